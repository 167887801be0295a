//! ETCS message engine: template instantiation, sequence numbering,
//! throttled emission and the inbound gate.
//!
//! Outbound messages go through a single-shot pump guarding a FIFO
//! queue: when idle it pops the head, drops already-processed
//! sequences, drops messages the current state does not admit, then
//! publishes at QoS 2 and re-arms itself after the minimum
//! inter-message gap. The inbound gate enforces the envelope, the
//! origin loop guard and the per-state admit-set before any per-NID
//! handler runs.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::bus::{MessageBus, QoS};
use crate::error::TemplateError;
use crate::fsm::SessionFsm;
use crate::kpi::{now_ms, now_s};
use crate::message::{EtcsMessage, Source};
use crate::templates::TemplateSet;

/// Minimum gap between two published ETCS messages.
pub const MIN_MESSAGE_INTERVAL: Duration = Duration::from_millis(100);

/// Why the inbound gate refused a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingEnvelope,
    LocalOrigin(Source),
    NotAdmitted(u8),
}

struct Outbound {
    topic: String,
    msg: EtcsMessage,
}

#[derive(Default)]
struct SendQueue {
    queue: VecDeque<Outbound>,
    is_sending: bool,
}

#[derive(Clone)]
pub struct EtcsEngine {
    templates: &'static TemplateSet,
    bus: Arc<dyn MessageBus>,
    fsm: Arc<RwLock<SessionFsm>>,
    sequence: Arc<AtomicU64>,
    processed: Arc<Mutex<HashSet<u64>>>,
    sendq: Arc<tokio::sync::Mutex<SendQueue>>,
    throttle: bool,
}

impl EtcsEngine {
    pub fn new(
        templates: &'static TemplateSet,
        bus: Arc<dyn MessageBus>,
        fsm: Arc<RwLock<SessionFsm>>,
        throttle: bool,
    ) -> Self {
        Self {
            templates,
            bus,
            fsm,
            sequence: Arc::new(AtomicU64::new(1)),
            processed: Arc::new(Mutex::new(HashSet::new())),
            sendq: Arc::new(tokio::sync::Mutex::new(SendQueue::default())),
            throttle,
        }
    }

    pub fn templates(&self) -> &'static TemplateSet {
        self.templates
    }

    /// Merge template defaults with `overrides` and stamp the envelope:
    /// `T_TRAIN`/`T_TRAIN_ack` (epoch seconds, when declared and
    /// absent), `SEQUENCE`, `origin` (defaulting to `system`) and
    /// `t_app_ms`.
    pub fn build_from_template(
        &self,
        name: &str,
        overrides: EtcsMessage,
    ) -> Result<EtcsMessage, TemplateError> {
        let template = self.templates.by_name(name)?;
        let mut values = template.default_values();
        for (k, v) in overrides.values {
            values.insert(k, v);
        }
        let mut msg = EtcsMessage::new(values);
        for stamp in ["T_TRAIN", "T_TRAIN_ack"] {
            if template.declares(stamp) && msg.num(stamp).is_none() {
                msg.set_num(stamp, now_s());
            }
        }
        msg.set_num("SEQUENCE", self.sequence.fetch_add(1, Ordering::Relaxed));
        if msg.origin().is_none() {
            msg.set_origin(Source::Internal);
        }
        msg.set_num("t_app_ms", now_ms());
        Ok(msg)
    }

    /// Enqueue for throttled emission, or publish immediately when
    /// throttling is disabled. With an idle pump the head of the queue
    /// goes out inline; the rest drains on the 100 ms timer.
    pub async fn send_throttled(&self, topic: &str, msg: EtcsMessage) {
        if !self.throttle {
            self.publish_now(topic, msg).await;
            return;
        }
        self.sendq.lock().await.queue.push_back(Outbound { topic: topic.to_string(), msg });
        self.pump().await;
    }

    async fn publish_now(&self, topic: &str, mut msg: EtcsMessage) {
        msg.set_num("t_send_ms", now_ms());
        debug!(topic, nid = ?msg.nid(), seq = ?msg.sequence(), "publish");
        self.bus.publish(topic, msg.to_bytes(), QoS::ExactlyOnce).await;
    }

    /// Single-shot queue pump; returns at once when already draining.
    fn pump(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                let out = {
                    let mut q = self.sendq.lock().await;
                    if q.is_sending {
                        return;
                    }
                    let Some(out) = q.queue.pop_front() else { return };
                    q.is_sending = true;
                    out
                };

                if let Some(reason) = self.skip_reason(&out).await {
                    debug!(reason, "pump skipping queued message");
                    self.sendq.lock().await.is_sending = false;
                    continue;
                }

                let seq = out.msg.sequence().unwrap_or(0);
                self.processed.lock().expect("processed set poisoned").insert(seq);
                self.publish_now(&out.topic, out.msg).await;

                // Hold the lock flag through the gap, then try the next head.
                let engine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(MIN_MESSAGE_INTERVAL).await;
                    engine.sendq.lock().await.is_sending = false;
                    engine.pump().await;
                });
                return;
            }
        })
    }

    async fn skip_reason(&self, out: &Outbound) -> Option<&'static str> {
        let Some(nid_message) = out.msg.nid() else {
            return Some("missing NID_MESSAGE");
        };
        let seq = out.msg.sequence().unwrap_or(0);
        if self.processed.lock().expect("processed set poisoned").contains(&seq) {
            return Some("sequence already processed");
        }
        if !self.fsm.read().await.validate_message(nid_message) {
            warn!(nid = nid_message, seq, "state does not admit NID, skipping send");
            return Some("state does not admit NID");
        }
        None
    }

    /// Envelope, loop-guard and admit-set checks shared by both peers.
    /// Deduplication is the caller's concern (RBC inbound path only).
    pub async fn gate_inbound(&self, msg: &EtcsMessage) -> Result<u8, Rejection> {
        let (Some(nid_message), Some(origin)) = (msg.nid(), msg.origin()) else {
            return Err(Rejection::MissingEnvelope);
        };
        if matches!(origin, Source::LocalObu | Source::LocalRbc) {
            return Err(Rejection::LocalOrigin(origin));
        }
        if !self.fsm.read().await.validate_message(nid_message) {
            return Err(Rejection::NotAdmitted(nid_message));
        }
        Ok(nid_message)
    }

    /// Forget per-session emission state (sequence dedup set).
    pub fn reset_session(&self) {
        self.processed.lock().expect("processed set poisoned").clear();
    }

    /// Convenience for handlers: field override pairs → message.
    pub fn overrides(pairs: &[(&str, Value)]) -> EtcsMessage {
        let mut msg = EtcsMessage::default();
        for (k, v) in pairs {
            msg.values.insert((*k).to_string(), v.clone());
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::fsm::{SessionEvent, SessionState};
    use crate::templates::registry;
    use serde_json::json;

    fn harness(throttle: bool) -> (Arc<LocalBus>, Arc<RwLock<SessionFsm>>, EtcsEngine) {
        let bus = Arc::new(LocalBus::new());
        let fsm = Arc::new(RwLock::new(SessionFsm::new()));
        let engine = EtcsEngine::new(registry(), bus.clone(), fsm.clone(), throttle);
        (bus, fsm, engine)
    }

    #[tokio::test]
    async fn build_stamps_the_envelope() {
        let (_bus, _fsm, engine) = harness(false);
        let msg = engine.build_from_template("session_establish", EtcsMessage::default()).unwrap();
        assert_eq!(msg.nid(), Some(155));
        assert_eq!(msg.sequence(), Some(1));
        assert!(msg.num("T_TRAIN").is_some());
        assert_eq!(msg.origin(), Some(Source::Internal));

        let next = engine.build_from_template("ack", EtcsMessage::default()).unwrap();
        assert_eq!(next.sequence(), Some(2));
        assert!(next.num("T_TRAIN_ack").is_some());
    }

    #[tokio::test]
    async fn overrides_win_over_defaults() {
        let (_bus, _fsm, engine) = harness(false);
        let ov = EtcsEngine::overrides(&[("Q_MARQSTREASON", json!(2)), ("origin", json!("obu"))]);
        let msg = engine.build_from_template("ma_request", ov).unwrap();
        assert_eq!(msg.num("Q_MARQSTREASON"), Some(2));
        assert_eq!(msg.origin(), Some(Source::LocalObu));
    }

    #[tokio::test]
    async fn pump_skips_disallowed_and_duplicate_sequences() {
        let (bus, fsm, engine) = harness(true);
        let mut rx = bus.subscribe("rbc/DE0001/in").await;
        {
            let mut f = fsm.write().await;
            f.transition(SessionEvent::Connected);
            f.transition(SessionEvent::Au1Sent);
            assert_eq!(f.state(), SessionState::HandshakeInitiated);
        }

        // 155 is admitted in HANDSHAKE_INITIATED, 136 is not.
        let admitted = engine.build_from_template("session_establish", EtcsMessage::default()).unwrap();
        let refused = engine.build_from_template("position_report", EtcsMessage::default()).unwrap();
        engine.send_throttled("rbc/DE0001/in", admitted.clone()).await;
        engine.send_throttled("rbc/DE0001/in", refused).await;
        // Duplicate SEQUENCE: dropped by the send-side dedup.
        engine.send_throttled("rbc/DE0001/in", admitted).await;

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let decoded = EtcsMessage::from_bytes(&got.payload).unwrap();
        assert_eq!(decoded.nid(), Some(155));
        assert!(decoded.num("t_send_ms").is_some());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(rx.try_recv().is_err(), "only one message should have survived the pump");
    }

    #[tokio::test]
    async fn pump_paces_consecutive_messages() {
        let (bus, fsm, engine) = harness(true);
        let mut rx = bus.subscribe("rbc/DE0001/in").await;
        {
            let mut f = fsm.write().await;
            f.transition(SessionEvent::Connected);
            f.transition(SessionEvent::Au1Sent);
        }
        let first = engine.build_from_template("session_establish", EtcsMessage::default()).unwrap();
        let second = engine.build_from_template("session_establish", EtcsMessage::default()).unwrap();
        let t0 = tokio::time::Instant::now();
        engine.send_throttled("rbc/DE0001/in", first).await;
        engine.send_throttled("rbc/DE0001/in", second).await;

        let _ = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let head_latency = t0.elapsed();
        let _ = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let gap = t0.elapsed();
        assert!(head_latency < Duration::from_millis(50), "head should publish inline");
        assert!(gap >= MIN_MESSAGE_INTERVAL, "second message must respect the gap");
    }

    #[tokio::test]
    async fn gate_rejects_local_origins_and_unadmitted_nids() {
        let (_bus, fsm, engine) = harness(false);
        {
            let mut f = fsm.write().await;
            f.transition(SessionEvent::Connected);
            f.transition(SessionEvent::Au1Sent);
        }

        let mut looped = engine.build_from_template("session_establish", EtcsMessage::default()).unwrap();
        looped.set_origin(Source::LocalObu);
        assert_eq!(engine.gate_inbound(&looped).await, Err(Rejection::LocalOrigin(Source::LocalObu)));

        let mut wire = looped.clone();
        wire.set_origin(Source::Wire);
        assert_eq!(engine.gate_inbound(&wire).await, Ok(155));

        let mut unadmitted = engine.build_from_template("position_report", EtcsMessage::default()).unwrap();
        unadmitted.set_origin(Source::Wire);
        assert_eq!(engine.gate_inbound(&unadmitted).await, Err(Rejection::NotAdmitted(136)));

        let empty = EtcsMessage::default();
        assert_eq!(engine.gate_inbound(&empty).await, Err(Rejection::MissingEnvelope));
    }
}
