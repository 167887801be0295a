//! Radio Block Centre orchestrator — the trackside mirror of the OBU.
//!
//! Accepts the handshake, drives the version/session/train-data
//! exchanges from the other side, holds the MA request until the
//! operator grants it, answers position reports, and acknowledges AI
//! obstacle alerts to close the alert RTT loop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::autostop::{AiAck, AiAlert};
use crate::bus::{topics, MessageBus, QoS};
use crate::dedup::DedupCache;
use crate::engine::EtcsEngine;
use crate::fsm::{SessionEvent, SessionFsm};
use crate::handshake::{derive_session_keys, Au1, Au2, NoncePair, RootKeys};
use crate::kpi::{now_ms, EtcsRttRx};
use crate::message::{nid, EtcsMessage, Source};
use crate::packet15::build_movement_authority;
use crate::safety::SessionKeys;
use crate::status::StatusEvent;
use crate::templates::registry;
use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// `ST_from_ST_to` route identifier, e.g. `ST1_ST2`.
    pub id: String,
    /// Ordered granted track list.
    pub tracks: Vec<String>,
}

#[derive(Clone)]
pub struct RbcConfig {
    pub rbc_id: String,
    pub train_id: String,
    pub root_keys: RootKeys,
    pub topology: Topology,
    pub route: RouteConfig,
    /// When set, the operator grant button is pressed automatically
    /// this long after an MA request arrives.
    pub auto_grant: Option<Duration>,
    pub throttle: bool,
}

impl Default for RbcConfig {
    fn default() -> Self {
        Self {
            rbc_id: "DE0001".into(),
            train_id: "TRAIN01".into(),
            root_keys: RootKeys::default(),
            topology: Topology::default_layout(),
            route: RouteConfig {
                id: "ST1_ST2".into(),
                tracks: vec!["T1".into(), "T2".into(), "T3".into(), "T4".into()],
            },
            auto_grant: Some(Duration::from_millis(200)),
            throttle: true,
        }
    }
}

struct Trackside {
    keys: Option<SessionKeys>,
    rbc_nonces: NoncePair,
    ma_request_received: bool,
    ma_granted: bool,
    dedup: DedupCache,
    /// `t_rbc_recv_ms` of the message a pending response answers.
    last_recv_ms: Option<u64>,
}

pub struct Rbc {
    cfg: RbcConfig,
    bus: Arc<dyn MessageBus>,
    fsm: Arc<RwLock<SessionFsm>>,
    engine: EtcsEngine,
    side: Arc<RwLock<Trackside>>,
    grant_tx: mpsc::UnboundedSender<()>,
    grant_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
}

impl Rbc {
    pub fn new(cfg: RbcConfig, bus: Arc<dyn MessageBus>) -> Self {
        let fsm = Arc::new(RwLock::new(SessionFsm::new()));
        let engine = EtcsEngine::new(registry(), bus.clone(), fsm.clone(), cfg.throttle);
        let side = Arc::new(RwLock::new(Trackside {
            keys: None,
            rbc_nonces: NoncePair::fresh(),
            ma_request_received: false,
            ma_granted: false,
            dedup: DedupCache::default(),
            last_recv_ms: None,
        }));
        let (grant_tx, grant_rx) = mpsc::unbounded_channel();
        Self { cfg, bus, fsm, engine, side, grant_tx, grant_rx: tokio::sync::Mutex::new(grant_rx) }
    }

    pub fn state_handle(&self) -> Arc<RwLock<SessionFsm>> {
        self.fsm.clone()
    }

    /// The operator's MA grant button.
    pub fn grant_handle(&self) -> mpsc::UnboundedSender<()> {
        self.grant_tx.clone()
    }

    pub async fn ma_request_received(&self) -> bool {
        self.side.read().await.ma_request_received
    }

    pub async fn run(&self) {
        let mut au1_rx = self.bus.subscribe(&topics::obu_handshake(&self.cfg.rbc_id)).await;
        let mut etcs_rx = self.bus.subscribe(&topics::rbc_in(&self.cfg.rbc_id)).await;
        let mut alert_rx = self.bus.subscribe(topics::AI_ALERT).await;
        let mut grant_rx = self.grant_rx.lock().await;

        self.fsm.write().await.transition(SessionEvent::Connected);
        self.status("rbc", "ready").await;

        loop {
            tokio::select! {
                Some(raw) = au1_rx.recv() => self.handle_au1(&raw.payload).await,
                Some(raw) = etcs_rx.recv() => self.handle_etcs(&raw.payload).await,
                Some(raw) = alert_rx.recv() => self.handle_alert(&raw.payload).await,
                Some(()) = grant_rx.recv() => self.handle_grant().await,
                else => break,
            }
        }
        info!("RBC loop finished");
    }

    // ── Handshake ────────────────────────────────────────────────────

    async fn handle_au1(&self, raw: &[u8]) {
        if !self.fsm.read().await.validate_message(nid::AU1) {
            debug!("AU1 outside READY, ignoring");
            return;
        }
        let Ok(au1) = serde_json::from_slice::<Au1>(raw) else {
            warn!("unparseable AU1, ignoring");
            return;
        };
        if au1.rbc_id != self.cfg.rbc_id {
            warn!(rbc = %au1.rbc_id, "AU1 for another RBC, ignoring");
            return;
        }
        info!(obu = %au1.obu_id, "AU1 received, replying AU2");

        let rbc_nonces = {
            let mut s = self.side.write().await;
            let keys = derive_session_keys(&self.cfg.root_keys, &au1.nonces, &s.rbc_nonces);
            s.keys = Some(keys);
            s.rbc_nonces
        };
        let au2 = Au2::new(&au1.obu_id, &self.cfg.rbc_id, rbc_nonces, now_ms());
        let payload = serde_json::to_vec(&au2).unwrap_or_default();
        self.bus.publish(&topics::rbc_handshake(&self.cfg.rbc_id), payload, QoS::ExactlyOnce).await;
        self.fsm.write().await.transition(SessionEvent::Au1Sent);
        self.status("rbc", "handshake_replied").await;
    }

    // ── ETCS plane ───────────────────────────────────────────────────

    async fn handle_etcs(&self, raw: &[u8]) {
        let Some(msg) = EtcsMessage::from_bytes(raw) else {
            warn!("unparseable ETCS message on RBC-in plane");
            return;
        };
        let nid_message = match self.engine.gate_inbound(&msg).await {
            Ok(n) => n,
            Err(reject) => {
                debug!(?reject, "inbound message rejected");
                return;
            }
        };
        let t_recv = now_ms();
        {
            let mut s = self.side.write().await;
            if !s.dedup.check_and_insert(&msg, t_recv) {
                debug!(nid = nid_message, "duplicate inbound PDU dropped");
                return;
            }
            s.last_recv_ms = Some(t_recv);
        }

        match nid_message {
            nid::SESSION_ESTABLISH => {
                let packet2 = json!({ "NID_PACKET": 2, "L_PACKET": 28,
                                      "M_VERSION": crate::templates::M_VERSION });
                self.respond("system_version", &[("packet2", packet2)], nid_message).await;
                self.fsm.write().await.transition(SessionEvent::M32Sent);
            }
            nid::KEYS_AUTH => {
                self.respond("session_ack", &[], nid_message).await;
                self.fsm.write().await.transition(SessionEvent::M38Sent);
            }
            nid::TRAIN_DATA => {
                self.respond("train_data_ack", &[], nid_message).await;
                self.status("rbc", "train_data_validated").await;
            }
            nid::TRAIN_ACCEPTANCE => {
                self.respond("train_accepted", &[], nid_message).await;
                self.fsm.write().await.transition(SessionEvent::M41Received);
            }
            nid::ACK => self.on_ack(&msg).await,
            nid::MA_REQUEST => self.on_ma_request().await,
            nid::POSITION_REPORT => {
                self.respond("ack", &[("NID_MESSAGE_REF", json!(nid::POSITION_REPORT))], nid_message)
                    .await;
                self.fsm.write().await.transition(SessionEvent::PositionUpdate);
            }
            nid::END_OF_MISSION => {
                self.fsm.write().await.transition(SessionEvent::MissionComplete);
                self.status("rbc", "mission_complete").await;
            }
            nid::SESSION_TERMINATE => self.on_terminate(nid_message).await,
            other => warn!(nid = other, "no RBC handler for admitted NID"),
        }
    }

    async fn on_ack(&self, msg: &EtcsMessage) {
        let reference = msg.num("NID_MESSAGE_REF").map(|v| v as u8);
        let event = match reference {
            Some(nid::SYSTEM_VERSION) => SessionEvent::M32Acked,
            Some(nid::TRAIN_DATA_ACK) => SessionEvent::M8Acked,
            Some(nid::TRAIN_ACCEPTED) => SessionEvent::M41Acked,
            _ => SessionEvent::PositionUpdate,
        };
        self.fsm.write().await.transition(event);
    }

    async fn on_ma_request(&self) {
        {
            let mut s = self.side.write().await;
            s.ma_request_received = true;
        }
        info!("MA request received, operator grant armed");
        self.status("rbc", "ma_request_received").await;
        if let Some(delay) = self.cfg.auto_grant {
            let tx = self.grant_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(());
            });
        }
    }

    async fn handle_grant(&self) {
        {
            let mut s = self.side.write().await;
            if !s.ma_request_received || s.ma_granted {
                debug!("grant without pending MA request, ignoring");
                return;
            }
            s.ma_granted = true;
        }
        let ma = match build_movement_authority(&self.cfg.topology, &self.cfg.route.tracks, &self.cfg.route.id)
        {
            Ok(ma) => ma,
            Err(e) => {
                warn!("cannot build movement authority: {e}");
                return;
            }
        };
        info!(sections = ma.n_iter(), "granting movement authority");
        self.respond("movement_authority", &[("packet15", Value::Object(ma.to_values()))], nid::MA_REQUEST)
            .await;
        let mut f = self.fsm.write().await;
        f.transition(SessionEvent::M3Sent);
        f.transition(SessionEvent::MonitoringStarted);
        drop(f);
        self.status("rbc", "ma_granted").await;
    }

    async fn on_terminate(&self, nid_message: u8) {
        self.respond("termination_ack", &[], nid_message).await;
        self.status("rbc", "session_terminated").await;
        // Leave time for the queued 39 to drain before tearing down.
        let fsm = self.fsm.clone();
        let engine = self.engine.clone();
        let side = self.side.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            side.write().await.keys = None;
            engine.reset_session();
            fsm.write().await.reset();
        });
    }

    // ── AI alerts ────────────────────────────────────────────────────

    async fn handle_alert(&self, raw: &[u8]) {
        let Ok(alert) = serde_json::from_slice::<AiAlert>(raw) else {
            return;
        };
        let Some(msg_id) = alert.msg_id else {
            debug!("alert without msg_id, not acknowledging");
            return;
        };
        let ack = AiAck { msg_id, t_ack_send_ms: now_ms(), ts: now_ms() };
        let payload = serde_json::to_vec(&ack).unwrap_or_default();
        self.bus.publish(topics::AI_ACK, payload, QoS::AtLeastOnce).await;
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Build the canonical response, send it, and emit the RBC-side
    /// RTT sample for the inbound message that triggered it.
    async fn respond(&self, template: &str, fields: &[(&str, Value)], inbound_nid: u8) {
        let overrides = EtcsEngine::overrides(fields);
        match self.engine.build_from_template(template, overrides) {
            Ok(mut msg) => {
                msg.set_origin(Source::LocalRbc);
                self.engine.send_throttled(&topics::rbc_out(&self.cfg.rbc_id), msg).await;
            }
            Err(e) => {
                warn!("cannot build {template}: {e}");
                return;
            }
        }
        let rtt = {
            let mut s = self.side.write().await;
            s.last_recv_ms.take().map(|t0| now_ms().saturating_sub(t0))
        };
        if let Some(rtt_ms) = rtt {
            let record = EtcsRttRx::new(inbound_nid, rtt_ms);
            let payload = serde_json::to_vec(&record).unwrap_or_default();
            self.bus.publish(&topics::kpi_pos(&self.cfg.rbc_id), payload, QoS::AtLeastOnce).await;
        }
    }

    async fn status(&self, service: &str, state: &str) {
        let event = StatusEvent::new(&self.cfg.train_id, service, state);
        let payload = serde_json::to_vec(&event).unwrap_or_default();
        self.bus.publish(&topics::status(&self.cfg.train_id), payload, QoS::AtLeastOnce).await;
    }
}
