//! Movement Authority (Packet 15) generation from topology.
//!
//! Walks the granted track list, collects the sensor nodes along the
//! way, and turns each consecutive sensor pair into one section whose
//! length is the Euclidean sum of the tracks between them.

use serde_json::Value;
use tracing::warn;

use crate::message::Fields;
use crate::topology::{Topology, TopologyError};

/// One repeated section record of Packet 15.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaSection {
    pub l_section: u64,
    pub q_sectiontimer: u64,
    pub t_sectiontimer: u64,
    pub d_sectiontimerstoploc: u64,
}

impl MaSection {
    fn untimed(l_section: u64) -> Self {
        Self { l_section, q_sectiontimer: 0, t_sectiontimer: 0, d_sectiontimerstoploc: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct MovementAuthority {
    pub q_dir: u64,
    pub q_scale: u64,
    pub v_ema: u64,
    pub t_ema: u64,
    pub sections: Vec<MaSection>,
    pub l_endsection: u64,
}

impl MovementAuthority {
    /// `N_ITER` always equals the section count.
    pub fn n_iter(&self) -> u64 {
        self.sections.len() as u64
    }

    /// Declared packet length in bits: fixed part plus one repeated
    /// group per section.
    pub fn l_packet(&self) -> u64 {
        93 + 46 * self.n_iter()
    }

    /// Packet 15 value map for the wire codec.
    pub fn to_values(&self) -> Fields {
        let mut p = Fields::new();
        p.insert("NID_PACKET".into(), Value::from(15u64));
        p.insert("L_PACKET".into(), Value::from(self.l_packet()));
        p.insert("Q_DIR".into(), Value::from(self.q_dir));
        p.insert("Q_SCALE".into(), Value::from(self.q_scale));
        p.insert("V_EMA".into(), Value::from(self.v_ema));
        p.insert("T_EMA".into(), Value::from(self.t_ema));
        p.insert("N_ITER".into(), Value::from(self.n_iter()));
        p.insert("L_ENDSECTION".into(), Value::from(self.l_endsection));
        p.insert("Q_ENDTIMER".into(), Value::from(0u64));
        p.insert("T_ENDTIMER".into(), Value::from(0u64));
        p.insert("D_ENDTIMERSTARTLOC".into(), Value::from(0u64));
        let sections: Vec<Value> = self
            .sections
            .iter()
            .map(|s| {
                let mut m = Fields::new();
                m.insert("L_SECTION".into(), Value::from(s.l_section));
                m.insert("Q_SECTIONTIMER".into(), Value::from(s.q_sectiontimer));
                m.insert("T_SECTIONTIMER".into(), Value::from(s.t_sectiontimer));
                m.insert("D_SECTIONTIMERSTOPLOC".into(), Value::from(s.d_sectiontimerstoploc));
                Value::Object(m)
            })
            .collect();
        p.insert("sections".into(), Value::Array(sections));
        p
    }
}

/// Build Packet 15 for the route `ST_from_ST_to` over `track_ids`.
pub fn build_movement_authority(
    topo: &Topology,
    track_ids: &[String],
    route: &str,
) -> Result<MovementAuthority, TopologyError> {
    let (st_from, st_to) =
        route.split_once('_').ok_or_else(|| TopologyError::BadRoute(route.to_string()))?;
    if track_ids.is_empty() {
        return Err(TopologyError::EmptyRoute);
    }

    // Walk the track list, keeping the running node and noting at which
    // track index each sensor is first encountered.
    let mut current = st_from.to_string();
    let mut lengths: Vec<f64> = Vec::with_capacity(track_ids.len());
    let mut sensor_stops: Vec<(String, usize)> = Vec::new();
    for (idx, id) in track_ids.iter().enumerate() {
        let track = topo.track(id)?;
        let next = if track.from == current { track.to.clone() } else { track.from.clone() };
        lengths.push(topo.track_length(track)?);
        if topo.is_sensor(&next) && !sensor_stops.iter().any(|(s, _)| s == &next) {
            sensor_stops.push((next.clone(), idx));
        }
        current = next;
    }

    let first = topo.track(&track_ids[0])?;
    let q_dir = u64::from(first.from == st_from);

    let sections = sensor_stops
        .windows(2)
        .map(|pair| {
            let (_, a) = &pair[0];
            let (_, b) = &pair[1];
            let sum: f64 = lengths[a + 1..=*b].iter().sum();
            MaSection::untimed(sum.round() as u64)
        })
        .collect::<Vec<_>>();

    // From the last sensor to (and including) the track touching ST_to.
    let l_endsection = match sensor_stops.last() {
        Some((_, last_idx)) => lengths[last_idx + 1..].iter().sum::<f64>(),
        None => lengths.iter().sum::<f64>(),
    };

    if current != st_to {
        warn!(end = %current, target = st_to, "granted track list does not reach the target station");
    }
    Ok(MovementAuthority {
        q_dir,
        q_scale: 1,
        v_ema: 80,
        t_ema: 1023,
        sections,
        l_endsection: l_endsection.round() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    fn route_tracks() -> Vec<String> {
        vec!["T1".into(), "T2".into(), "T3".into(), "T4".into()]
    }

    #[test]
    fn default_route_yields_two_sections() {
        let topo = Topology::default_layout();
        let ma = build_movement_authority(&topo, &route_tracks(), "ST1_ST2").unwrap();
        // Sensors S1..S3 along the walk: sections S1→S2 and S2→S3.
        assert_eq!(ma.q_dir, 1);
        assert_eq!(ma.n_iter(), 2);
        assert_eq!(ma.sections[0].l_section, 1000);
        assert_eq!(ma.sections[1].l_section, 1000);
        assert_eq!(ma.l_endsection, 1000);
        assert_eq!(ma.l_packet(), 93 + 46 * 2);
    }

    #[test]
    fn q_dir_zero_when_walking_against_track_orientation() {
        let topo = Topology::default_layout();
        let reversed: Vec<String> = vec!["T4".into(), "T3".into(), "T2".into(), "T1".into()];
        let ma = build_movement_authority(&topo, &reversed, "ST2_ST1").unwrap();
        assert_eq!(ma.q_dir, 0);
        assert_eq!(ma.n_iter(), 2);
    }

    #[test]
    fn values_map_keeps_n_iter_and_sections_in_lockstep() {
        let topo = Topology::default_layout();
        let ma = build_movement_authority(&topo, &route_tracks(), "ST1_ST2").unwrap();
        let v = ma.to_values();
        let n = v["N_ITER"].as_u64().unwrap();
        assert_eq!(v["sections"].as_array().unwrap().len() as u64, n);
        assert_eq!(v["L_PACKET"].as_u64().unwrap(), 93 + 46 * n);
    }

    #[test]
    fn bad_route_and_empty_route_error() {
        let topo = Topology::default_layout();
        assert!(matches!(
            build_movement_authority(&topo, &route_tracks(), "ST1"),
            Err(TopologyError::BadRoute(_))
        ));
        assert!(matches!(
            build_movement_authority(&topo, &[], "ST1_ST2"),
            Err(TopologyError::EmptyRoute)
        ));
    }
}
