//! KPI telemetry: sent-message RTT tracking and the record shapes
//! published on the KPI and status topics. Receiver-side single-clock
//! deltas only — cross-node clocks are not synchronized.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub fn now_s() -> u64 {
    now_ms() / 1000
}

/// `NID_MESSAGE → t_send_ms` for tracked outbound messages; an entry is
/// consumed by the matching inbound response. Owned by exactly one
/// orchestrator instance.
#[derive(Debug, Default)]
pub struct RttTable {
    sent: HashMap<u8, u64>,
}

impl RttTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, nid_message: u8, t_send_ms: u64) {
        self.sent.insert(nid_message, t_send_ms);
    }

    /// Clear the entry for `nid_message` and return the elapsed time.
    pub fn take_rtt(&mut self, nid_message: u8, t_recv_ms: u64) -> Option<u64> {
        self.sent.remove(&nid_message).map(|t0| t_recv_ms.saturating_sub(t0))
    }

    pub fn pending(&self) -> usize {
        self.sent.len()
    }
}

/// Position KPI, published on `kpi/<RBC_ID>/pos` per matched 136/146.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionKpi {
    pub event: String,
    pub nid_message: u8,
    pub sequence: u64,
    pub sensor_id: String,
    pub d_lrbg: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_sensor_ms: Option<u64>,
    pub t_obu_app_ms: u64,
    pub t_send_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
}

impl PositionKpi {
    pub const EVENT: &'static str = "POS_KPI";
}

/// RBC-side ETCS round-trip sample (single clock).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcsRttRx {
    pub event: String,
    pub nid_message: u8,
    pub rtt_ms: u64,
    pub ts: u64,
}

impl EtcsRttRx {
    pub fn new(nid_message: u8, rtt_ms: u64) -> Self {
        Self { event: "ETCS_RTT_RX".into(), nid_message, rtt_ms, ts: now_ms() }
    }
}

/// Alert→ack round trip measured on the OBU clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRtt {
    pub event: String,
    pub msg_id: String,
    pub rtt_ms: u64,
    pub ts: u64,
}

impl AiRtt {
    pub fn new(msg_id: String, rtt_ms: u64) -> Self {
        Self { event: "AI_RTT".into(), msg_id, rtt_ms, ts: now_ms() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_entry_is_consumed_once() {
        let mut table = RttTable::new();
        table.record_sent(136, 1000);
        assert_eq!(table.take_rtt(136, 1250), Some(250));
        assert_eq!(table.take_rtt(136, 1300), None);
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn rtt_never_underflows() {
        let mut table = RttTable::new();
        table.record_sent(132, 2000);
        assert_eq!(table.take_rtt(132, 1500), Some(0));
    }
}
