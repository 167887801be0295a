//! On-Board Unit orchestrator.
//!
//! Owns the broker connection, the session state machine and the key
//! material for one mission: initiates the handshake, answers the
//! version/train-data exchanges, latches the single MA request, turns
//! sensor events into position reports, completes the mission, and
//! runs the automatic-stop coordinator on AI alerts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::autostop::{AiAck, AiAlert, AutoStop};
use crate::bus::{topics, MessageBus, QoS};
use crate::engine::EtcsEngine;
use crate::fsm::{SessionEvent, SessionFsm, SessionState};
use crate::handshake::{derive_session_keys, Au1, Au2, KeyUpdate, NoncePair, RootKeys};
use crate::kpi::{now_ms, PositionKpi, RttTable};
use crate::message::{nid, EtcsMessage, Source};
use crate::safety::SessionKeys;
use crate::status::{StatusEvent, TrainEvent};
use crate::templates::{registry, M_VERSION};

/// Fixed sensor→distance mapping: S1..S8 → 1000..8000 m.
pub fn sensor_distance(sensor_id: &str) -> Option<u64> {
    let n: u64 = sensor_id.strip_prefix('S')?.parse().ok()?;
    (1..=8).contains(&n).then_some(n * 1000)
}

/// Physical sensor event on `esp32/<RBC_ID>/sensor`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SensorEvent {
    pub sensor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_sensor_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ObuConfig {
    pub train_id: String,
    pub rbc_id: String,
    pub root_keys: RootKeys,
    /// Fallback until a Movement Authority announces the real count.
    pub total_sections: u64,
    pub handshake_timeout: Duration,
    pub ma_check_interval: Duration,
    pub throttle: bool,
}

impl Default for ObuConfig {
    fn default() -> Self {
        Self {
            train_id: "TRAIN01".into(),
            rbc_id: "DE0001".into(),
            root_keys: RootKeys::default(),
            total_sections: 3,
            handshake_timeout: Duration::from_secs(5),
            ma_check_interval: Duration::from_secs(1),
            throttle: true,
        }
    }
}

/// Mutable mission state behind one lock (event-loop serialized).
struct Mission {
    keys: Option<SessionKeys>,
    obu_nonces: NoncePair,
    ma_request_sent: bool,
    som_sent: bool,
    awaiting_146: bool,
    passed_sections: u64,
    total_sections: u64,
    last_sensor: Option<(String, u64, Option<u64>, u64)>,
    rtt: RttTable,
    autostop: AutoStop,
    /// msg_id → first-seen ms, for the alert→ack RTT.
    alerts_seen: HashMap<String, u64>,
}

pub struct Obu {
    cfg: ObuConfig,
    bus: Arc<dyn MessageBus>,
    fsm: Arc<RwLock<SessionFsm>>,
    engine: EtcsEngine,
    mission: Arc<RwLock<Mission>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Obu {
    pub fn new(cfg: ObuConfig, bus: Arc<dyn MessageBus>) -> Self {
        let fsm = Arc::new(RwLock::new(SessionFsm::new()));
        let engine = EtcsEngine::new(registry(), bus.clone(), fsm.clone(), cfg.throttle);
        let mission = Arc::new(RwLock::new(Mission {
            keys: None,
            obu_nonces: NoncePair::fresh(),
            ma_request_sent: false,
            som_sent: false,
            awaiting_146: false,
            passed_sections: 0,
            total_sections: cfg.total_sections,
            last_sensor: None,
            rtt: RttTable::new(),
            autostop: AutoStop::default(),
            alerts_seen: HashMap::new(),
        }));
        Self { cfg, bus, fsm, engine, mission, shutdown: Arc::new(tokio::sync::Notify::new()) }
    }

    pub fn state_handle(&self) -> Arc<RwLock<SessionFsm>> {
        self.fsm.clone()
    }

    pub async fn ma_request_sent(&self) -> bool {
        self.mission.read().await.ma_request_sent
    }

    pub async fn passed_sections(&self) -> u64 {
        self.mission.read().await.passed_sections
    }

    /// Connect, run the mission to termination, return after the
    /// termination ack (or when every subscription closes).
    pub async fn run(&self) {
        let mut au2_rx = self.bus.subscribe(&topics::rbc_handshake(&self.cfg.rbc_id)).await;
        let mut etcs_rx = self.bus.subscribe(&topics::rbc_out(&self.cfg.rbc_id)).await;
        let mut sensor_rx = self.bus.subscribe(&topics::sensor(&self.cfg.rbc_id)).await;
        let mut alert_rx = self.bus.subscribe(topics::AI_ALERT).await;
        let mut ack_rx = self.bus.subscribe(topics::AI_ACK).await;
        let mut ping_rx = self.bus.subscribe(topics::VIDEO_PING).await;

        self.status("etcs", "connected").await;
        self.fsm.write().await.transition(SessionEvent::Connected);
        self.initiate_handshake().await;
        self.spawn_ma_request_timer();

        loop {
            tokio::select! {
                Some(raw) = au2_rx.recv() => self.handle_au2(&raw.payload).await,
                Some(raw) = etcs_rx.recv() => {
                    if self.handle_etcs(&raw.payload).await {
                        break; // termination acknowledged
                    }
                }
                Some(raw) = sensor_rx.recv() => self.handle_sensor(&raw.payload).await,
                Some(raw) = alert_rx.recv() => self.handle_alert(&raw.payload).await,
                Some(raw) = ack_rx.recv() => self.handle_ai_ack(&raw.payload).await,
                Some(raw) = ping_rx.recv() => {
                    // Video RTT probe: echo the received buffer.
                    self.bus.publish(topics::VIDEO_PONG, raw.payload, QoS::AtMostOnce).await;
                }
                _ = self.shutdown.notified() => {
                    warn!("session abandoned, leaving mission loop");
                    break;
                }
                else => break,
            }
        }
        info!("OBU mission loop finished");
    }

    // ── Handshake ────────────────────────────────────────────────────

    async fn initiate_handshake(&self) {
        let nonces = self.mission.read().await.obu_nonces;
        let au1 = Au1::new(&self.cfg.train_id, &self.cfg.rbc_id, nonces, now_ms());
        let payload = serde_json::to_vec(&au1).unwrap_or_default();
        self.bus.publish(&topics::obu_handshake(&self.cfg.rbc_id), payload, QoS::ExactlyOnce).await;
        self.fsm.write().await.transition(SessionEvent::Au1Sent);
        self.status("etcs", "handshake_initiated").await;
        self.spawn_handshake_timeout();
    }

    fn spawn_handshake_timeout(&self) {
        let fsm = self.fsm.clone();
        let mission = self.mission.clone();
        let engine = self.engine.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.cfg.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let timed_out = {
                let mut f = fsm.write().await;
                f.state() == SessionState::HandshakeInitiated && {
                    f.transition(SessionEvent::Timeout);
                    true
                }
            };
            if timed_out {
                warn!("handshake timed out after {timeout:?}, returning to DISCONNECTED");
                mission.write().await.keys = None;
                engine.reset_session();
                shutdown.notify_one();
            }
        });
    }

    async fn handle_au2(&self, raw: &[u8]) {
        if self.fsm.read().await.state() != SessionState::HandshakeInitiated {
            debug!("AU2 outside HANDSHAKE_INITIATED, ignoring");
            return;
        }
        let Ok(au2) = serde_json::from_slice::<Au2>(raw) else {
            warn!("unparseable AU2, ignoring");
            return;
        };
        let keys = {
            let mut m = self.mission.write().await;
            let keys = derive_session_keys(&self.cfg.root_keys, &m.obu_nonces, &au2.nonces);
            m.keys = Some(keys.clone());
            keys
        };
        info!("AU2 received, session keys derived");

        // Let the bridge arm its safety layer before any secured traffic.
        let update = KeyUpdate::new(&keys, now_ms());
        let payload = serde_json::to_vec(&update).unwrap_or_default();
        self.bus.publish(&topics::obu_keys(&self.cfg.rbc_id), payload, QoS::AtLeastOnce).await;

        self.fsm.write().await.transition(SessionEvent::Au2Received);
        self.status("etcs", "session_keys_ready").await;
        self.send("session_establish", &[]).await;
    }

    // ── ETCS plane ───────────────────────────────────────────────────

    /// Returns true when the mission is over (termination acked).
    async fn handle_etcs(&self, raw: &[u8]) -> bool {
        let Some(msg) = EtcsMessage::from_bytes(raw) else {
            warn!("unparseable ETCS message on RBC-out plane");
            return false;
        };
        let nid_message = match self.engine.gate_inbound(&msg).await {
            Ok(n) => n,
            Err(reject) => {
                debug!(?reject, "inbound message rejected");
                return false;
            }
        };

        match nid_message {
            nid::SYSTEM_VERSION => self.on_system_version(&msg).await,
            nid::SESSION_ACK => {
                self.send("ack", &[("NID_MESSAGE_REF", json!(nid::SESSION_ACK))]).await;
                self.fsm.write().await.transition(SessionEvent::M38Received);
            }
            nid::TRAIN_DATA_ACK => self.on_train_data_ack(&msg).await,
            nid::TRAIN_ACCEPTED => {
                self.send("ack", &[("NID_MESSAGE_REF", json!(nid::TRAIN_ACCEPTED))]).await;
                self.fsm.write().await.transition(SessionEvent::M41Acked);
                self.status("etcs", "train_accepted").await;
            }
            nid::ACK => self.on_ack(&msg).await,
            nid::MA => self.on_movement_authority(&msg).await,
            nid::TERMINATION_ACK => {
                info!("termination acknowledged, session closed");
                self.teardown().await;
                return true;
            }
            other => warn!(nid = other, "no OBU handler for admitted NID"),
        }
        false
    }

    async fn on_system_version(&self, msg: &EtcsMessage) {
        let got = msg
            .packet("packet2")
            .and_then(|p| p.get("M_VERSION"))
            .and_then(Value::as_u64);
        if got == Some(M_VERSION) {
            self.send("ack", &[("NID_MESSAGE_REF", json!(nid::SYSTEM_VERSION))]).await;
            self.send("keys_auth", &[]).await;
            self.send("train_data", &[]).await;
            self.fsm.write().await.transition(SessionEvent::M32Acked);
            self.status("etcs", "version_exchanged").await;
        } else {
            warn!(?got, expected = M_VERSION, "system version mismatch");
            self.send("version_reject", &[("M_VERSION", json!(got.unwrap_or(0)))]).await;
            self.fsm.write().await.transition(SessionEvent::VersionMismatch);
        }
    }

    async fn on_train_data_ack(&self, _msg: &EtcsMessage) {
        self.send("ack", &[("NID_MESSAGE_REF", json!(nid::TRAIN_DATA_ACK))]).await;
        let first_time = {
            let mut m = self.mission.write().await;
            !std::mem::replace(&mut m.som_sent, true)
        };
        if first_time {
            // Start-of-mission train acceptance with the current position.
            let packet0 = json!({ "NID_PACKET": 0, "L_PACKET": 47, "Q_SCALE": 1,
                                  "D_LRBG": 0, "Q_DIRLRBG": 1, "V_TRAIN": 0 });
            self.send("train_acceptance", &[("packet0", packet0)]).await;
        }
        self.fsm.write().await.transition(SessionEvent::M8Received);
    }

    async fn on_ack(&self, msg: &EtcsMessage) {
        let reference = msg.num("NID_MESSAGE_REF").map(|v| v as u8);
        if reference == Some(nid::POSITION_REPORT) {
            let kpi = {
                let mut m = self.mission.write().await;
                if !m.awaiting_146 {
                    None
                } else {
                    m.awaiting_146 = false;
                    m.passed_sections += 1;
                    let rtt = m.rtt.take_rtt(nid::POSITION_REPORT, now_ms());
                    m.last_sensor.take().map(|(sensor_id, d_lrbg, t_sensor_ms, sequence)| PositionKpi {
                        event: PositionKpi::EVENT.into(),
                        nid_message: nid::POSITION_REPORT,
                        sequence,
                        sensor_id,
                        d_lrbg,
                        t_sensor_ms,
                        t_obu_app_ms: now_ms(),
                        t_send_ms: now_ms(),
                        rtt_ms: rtt,
                    })
                }
            };
            if let Some(kpi) = kpi {
                let payload = serde_json::to_vec(&kpi).unwrap_or_default();
                self.bus.publish(&topics::kpi_pos(&self.cfg.rbc_id), payload, QoS::AtLeastOnce).await;
            }
            self.fsm.write().await.transition(SessionEvent::PositionUpdate);
            self.check_mission_complete().await;
        } else {
            self.fsm.write().await.transition(SessionEvent::PositionUpdate);
        }
    }

    async fn on_movement_authority(&self, msg: &EtcsMessage) {
        if let Some(n_iter) = msg.packet("packet15").and_then(|p| p.get("N_ITER")).and_then(Value::as_u64)
        {
            let mut m = self.mission.write().await;
            m.total_sections = n_iter;
            info!(sections = n_iter, "movement authority received");
        }
        self.fsm.write().await.transition(SessionEvent::M3Received);
        self.status("etcs", "mission_active").await;
    }

    async fn check_mission_complete(&self) {
        let done = {
            let m = self.mission.read().await;
            m.passed_sections >= m.total_sections + 1
        };
        if !done {
            return;
        }
        if !self.fsm.write().await.transition(SessionEvent::MissionComplete) {
            return;
        }
        self.status("etcs", "mission_complete").await;
        self.send("end_of_mission", &[]).await;

        let engine = self.engine.clone();
        let topic = topics::rbc_in(&self.cfg.rbc_id);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Ok(mut msg) = engine.build_from_template("terminate_session", EtcsMessage::default()) {
                msg.set_origin(Source::LocalObu);
                engine.send_throttled(&topic, msg).await;
            }
        });
    }

    // ── MA request latch ─────────────────────────────────────────────

    fn spawn_ma_request_timer(&self) {
        let fsm = self.fsm.clone();
        let mission = self.mission.clone();
        let engine = self.engine.clone();
        let topic = topics::rbc_in(&self.cfg.rbc_id);
        let interval = self.cfg.ma_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let ready = {
                    let f = fsm.read().await;
                    matches!(f.state(), SessionState::TrainDataExchanged | SessionState::MaRequestReady)
                        && f.validate_message(nid::MA_REQUEST)
                };
                if !ready {
                    continue;
                }
                {
                    let mut m = mission.write().await;
                    if m.ma_request_sent {
                        continue;
                    }
                    m.ma_request_sent = true;
                }
                info!("requesting movement authority");
                if let Ok(mut msg) = engine.build_from_template("ma_request", EtcsMessage::default()) {
                    msg.set_origin(Source::LocalObu);
                    engine.send_throttled(&topic, msg).await;
                }
            }
        });
    }

    // ── Sensors → position reports ───────────────────────────────────

    async fn handle_sensor(&self, raw: &[u8]) {
        let Ok(event) = serde_json::from_slice::<SensorEvent>(raw) else {
            warn!("unparseable sensor event");
            return;
        };
        let Some(d_lrbg) = sensor_distance(&event.sensor_id) else {
            warn!(sensor = %event.sensor_id, "unknown sensor id");
            return;
        };

        let t_obu_app_ms = now_ms();
        let packet0 = json!({ "NID_PACKET": 0, "L_PACKET": 47, "Q_SCALE": 1,
                              "D_LRBG": d_lrbg, "Q_DIRLRBG": 1, "V_TRAIN": 60 });
        let mut overrides = EtcsMessage::default();
        overrides.values.insert("packet0".into(), packet0);
        if let Some(t) = event.t_sensor_ms {
            overrides.set_num("t_sensor_ms", t);
        }
        overrides.set_num("t_obu_app_ms", t_obu_app_ms);

        let Ok(mut msg) = self.engine.build_from_template("position_report", overrides) else {
            return;
        };
        msg.set_origin(Source::LocalObu);
        let sequence = msg.sequence().unwrap_or(0);
        {
            let mut m = self.mission.write().await;
            m.awaiting_146 = true;
            m.last_sensor = Some((event.sensor_id.clone(), d_lrbg, event.t_sensor_ms, sequence));
            m.rtt.record_sent(nid::POSITION_REPORT, t_obu_app_ms);
        }
        self.engine.send_throttled(&topics::rbc_in(&self.cfg.rbc_id), msg).await;
        self.fsm.write().await.transition(SessionEvent::MonitoringStarted);
        debug!(sensor = %event.sensor_id, d_lrbg, "position report queued");
    }

    // ── AI alerts → automatic stop ───────────────────────────────────

    async fn handle_alert(&self, raw: &[u8]) {
        let Ok(alert) = serde_json::from_slice::<AiAlert>(raw) else {
            warn!("unparseable AI alert");
            return;
        };
        let now = now_ms();
        let stop = {
            let mut m = self.mission.write().await;
            if let Some(id) = &alert.msg_id {
                m.alerts_seen.insert(id.clone(), now);
            }
            m.autostop.decide(&alert, now)
        };
        if !stop {
            debug!(conf = ?alert.conf, "alert below threshold or inside cooldown");
            return;
        }

        warn!(label = ?alert.label, conf = ?alert.conf, "obstacle: stopping train");
        self.bus.publish(topics::TRAIN_CMD, b"0".to_vec(), QoS::AtLeastOnce).await;
        let event = TrainEvent {
            kind: "TRAIN_EVENT".into(),
            event: "AUTO_STOP_OBSTACLE".into(),
            label: alert.label.clone(),
            conf: alert.conf,
            msg_id: alert.msg_id.clone(),
            frame_id: alert.frame_id,
            t_auto_stop_send_ms: now,
            ts: now,
        };
        let payload = serde_json::to_vec(&event).unwrap_or_default();
        self.bus.publish(&topics::status(&self.cfg.train_id), payload, QoS::AtLeastOnce).await;
    }

    async fn handle_ai_ack(&self, raw: &[u8]) {
        let Ok(ack) = serde_json::from_slice::<AiAck>(raw) else {
            return;
        };
        let rtt = {
            let mut m = self.mission.write().await;
            m.alerts_seen.remove(&ack.msg_id).map(|t0| now_ms().saturating_sub(t0))
        };
        if let Some(rtt_ms) = rtt {
            let record = crate::kpi::AiRtt::new(ack.msg_id, rtt_ms);
            let payload = serde_json::to_vec(&record).unwrap_or_default();
            self.bus.publish(&topics::status(&self.cfg.train_id), payload, QoS::AtLeastOnce).await;
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    async fn send(&self, template: &str, fields: &[(&str, Value)]) {
        let overrides = EtcsEngine::overrides(fields);
        match self.engine.build_from_template(template, overrides) {
            Ok(mut msg) => {
                msg.set_origin(Source::LocalObu);
                self.engine.send_throttled(&topics::rbc_in(&self.cfg.rbc_id), msg).await;
            }
            Err(e) => warn!("cannot build {template}: {e}"),
        }
    }

    async fn status(&self, service: &str, state: &str) {
        let event = StatusEvent::new(&self.cfg.train_id, service, state);
        let payload = serde_json::to_vec(&event).unwrap_or_default();
        self.bus.publish(&topics::status(&self.cfg.train_id), payload, QoS::AtLeastOnce).await;
    }

    async fn teardown(&self) {
        {
            let mut m = self.mission.write().await;
            m.keys = None;
            m.som_sent = false;
            m.ma_request_sent = false;
        }
        self.engine.reset_session();
        self.fsm.write().await.reset();
        self.status("etcs", "session_terminated").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_mapping_covers_s1_to_s8() {
        assert_eq!(sensor_distance("S1"), Some(1000));
        assert_eq!(sensor_distance("S3"), Some(3000));
        assert_eq!(sensor_distance("S8"), Some(8000));
        assert_eq!(sensor_distance("S9"), None);
        assert_eq!(sensor_distance("S0"), None);
        assert_eq!(sensor_distance("X1"), None);
    }
}
