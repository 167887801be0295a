//! Automatic-stop coordinator: turns computer-vision obstacle alerts
//! into actuator stop commands, with a cooldown so alert bursts cannot
//! hammer the actuator.

use serde::{Deserialize, Serialize};

/// Alert published by the on-board inference pipeline on `obu/ai/alert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAlert {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_alert_send_ms: Option<u64>,
}

/// RBC acknowledgment on `obu/ai/ack`, closing the alert RTT loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiAck {
    pub msg_id: String,
    pub t_ack_send_ms: u64,
    pub ts: u64,
}

pub const STOP_COOLDOWN_MS: u64 = 1_500;
pub const MIN_CONFIDENCE: f64 = 0.25;

/// Debounced stop decision. A missing confidence stops unconditionally;
/// a present one must clear the threshold. At most one stop per
/// cooldown window.
#[derive(Debug)]
pub struct AutoStop {
    cooldown_ms: u64,
    min_conf: f64,
    last_stop_ms: Option<u64>,
}

impl Default for AutoStop {
    fn default() -> Self {
        Self { cooldown_ms: STOP_COOLDOWN_MS, min_conf: MIN_CONFIDENCE, last_stop_ms: None }
    }
}

impl AutoStop {
    pub fn new(cooldown_ms: u64, min_conf: f64) -> Self {
        Self { cooldown_ms, min_conf, last_stop_ms: None }
    }

    pub fn decide(&mut self, alert: &AiAlert, now_ms: u64) -> bool {
        if let Some(last) = self.last_stop_ms {
            if now_ms.saturating_sub(last) < self.cooldown_ms {
                return false;
            }
        }
        match alert.conf {
            Some(conf) if conf < self.min_conf => false,
            _ => {
                self.last_stop_ms = Some(now_ms);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(conf: Option<f64>) -> AiAlert {
        AiAlert {
            label: Some("person".into()),
            conf,
            msg_id: Some("AI_TRAIN01_1".into()),
            frame_id: Some(7),
            ts: None,
            t_alert_send_ms: None,
        }
    }

    #[test]
    fn low_confidence_never_stops() {
        let mut auto = AutoStop::default();
        assert!(!auto.decide(&alert(Some(0.10)), 1_000));
        // and the cooldown was not consumed
        assert!(auto.decide(&alert(Some(0.90)), 1_001));
    }

    #[test]
    fn missing_confidence_stops_unconditionally() {
        let mut auto = AutoStop::default();
        assert!(auto.decide(&alert(None), 1_000));
    }

    #[test]
    fn burst_is_suppressed_within_cooldown() {
        let mut auto = AutoStop::default();
        assert!(auto.decide(&alert(Some(0.9)), 1_000));
        assert!(!auto.decide(&alert(Some(0.9)), 1_500));
        assert!(auto.decide(&alert(Some(0.9)), 2_600));
    }
}
