//! Track topology: nodes with plane coordinates, tracks connecting
//! them, and the subsets that are sensors and stations. Loaded from a
//! JSON file; a missing or corrupt file falls back to the built-in
//! demonstrator layout.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("unknown track {0}")]
    UnknownTrack(String),
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("route identifier {0} is not of the form FROM_TO")]
    BadRoute(String),
    #[error("route has no tracks")]
    EmptyRoute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub nodes: HashMap<String, Point>,
    pub tracks: Vec<Track>,
    pub sensors: Vec<String>,
    pub stations: Vec<String>,
}

impl Topology {
    /// Load from disk, falling back to `default_layout` on any failure.
    pub fn load_or_default(path: &Path) -> Topology {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Topology>(&raw) {
                Ok(topo) => {
                    info!(
                        path = %path.display(),
                        nodes = topo.nodes.len(),
                        tracks = topo.tracks.len(),
                        "loaded topology"
                    );
                    topo
                }
                Err(e) => {
                    warn!("failed to parse {}: {e}, using built-in layout", path.display());
                    Self::default_layout()
                }
            },
            Err(_) => {
                info!("no topology at {}, using built-in layout", path.display());
                Self::default_layout()
            }
        }
    }

    /// Built-in demonstrator layout: two stations, three line sensors,
    /// straight tracks between them.
    pub fn default_layout() -> Topology {
        let mut nodes = HashMap::new();
        for (id, x, y) in [
            ("ST1", 0.0, 0.0),
            ("S1", 1000.0, 0.0),
            ("S2", 2000.0, 0.0),
            ("S3", 3000.0, 0.0),
            ("ST2", 4000.0, 0.0),
        ] {
            nodes.insert(id.to_string(), Point { x, y });
        }
        let tracks = [
            ("T1", "ST1", "S1"),
            ("T2", "S1", "S2"),
            ("T3", "S2", "S3"),
            ("T4", "S3", "ST2"),
        ]
        .into_iter()
        .map(|(id, from, to)| Track { id: id.into(), from: from.into(), to: to.into() })
        .collect();
        Topology {
            nodes,
            tracks,
            sensors: vec!["S1".into(), "S2".into(), "S3".into()],
            stations: vec!["ST1".into(), "ST2".into()],
        }
    }

    pub fn track(&self, id: &str) -> Result<&Track, TopologyError> {
        self.tracks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| TopologyError::UnknownTrack(id.to_string()))
    }

    pub fn node(&self, id: &str) -> Result<&Point, TopologyError> {
        self.nodes.get(id).ok_or_else(|| TopologyError::UnknownNode(id.to_string()))
    }

    pub fn is_sensor(&self, id: &str) -> bool {
        self.sensors.iter().any(|s| s == id)
    }

    /// Euclidean length of one track.
    pub fn track_length(&self, track: &Track) -> Result<f64, TopologyError> {
        Ok(self.node(&track.from)?.distance(self.node(&track.to)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_connected() {
        let topo = Topology::default_layout();
        for track in &topo.tracks {
            assert!(topo.nodes.contains_key(&track.from));
            assert!(topo.nodes.contains_key(&track.to));
        }
        assert_eq!(topo.track_length(topo.track("T2").unwrap()).unwrap(), 1000.0);
        assert!(topo.is_sensor("S2"));
        assert!(!topo.is_sensor("ST1"));
    }

    #[test]
    fn unknown_ids_error() {
        let topo = Topology::default_layout();
        assert_eq!(topo.track("T99").unwrap_err(), TopologyError::UnknownTrack("T99".into()));
        assert_eq!(topo.node("X").unwrap_err(), TopologyError::UnknownNode("X".into()));
    }
}
