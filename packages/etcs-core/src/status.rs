//! Status-plane events published on `obu/<TRAIN_ID>/status` for the
//! operator UI and the log scrapers.

use serde::{Deserialize, Serialize};

use crate::kpi::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "trainNo")]
    pub train_no: String,
    pub service: String,
    pub state: String,
    pub ts: u64,
}

impl StatusEvent {
    pub fn new(train_no: &str, service: &str, state: &str) -> Self {
        Self {
            kind: "STATUS".into(),
            train_no: train_no.into(),
            service: service.into(),
            state: state.into(),
            ts: now_ms(),
        }
    }
}

/// Train actuator events, notably the automatic obstacle stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    pub t_auto_stop_send_ms: u64,
    pub ts: u64,
}
