//! Two-hop bridge between the pub/sub broker and the durable queue.
//!
//! The forward bridge wraps logical messages into safety PDUs and ships
//! them to the queue; the reverse bridge unwraps deliveries and
//! republishes typed messages with `origin=amqp`. Because the safety
//! layer is binary and strips every JSON-level field, the forward side
//! appends an out-of-band metadata trailer (`~META || len || json`)
//! that the reverse side merges back. The trailer is NOT covered by MAC
//! or CRC: diagnostic data only, nothing may gate on it.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{topics, DurableQueue, MessageBus, QoS, QUEUE_OBU_TO_RBC, QUEUE_RBC_TO_OBU};
use crate::codec;
use crate::error::{BridgeError, SafetyError};
use crate::handshake::KeyUpdate;
use crate::kpi::now_ms;
use crate::message::{EtcsMessage, Fields, Source};
use crate::safety::{Direction, SafetyLayer, MIN_PDU_LEN};
use crate::templates::{registry, Template};

/// `"~META"` — start of the out-of-band trailer.
pub const META_MAGIC: [u8; 5] = [0x7E, 0x4D, 0x45, 0x54, 0x41];

/// Append `MAGIC || len:u32be || json` after the PDU.
pub fn append_meta_trailer(pdu: &mut Vec<u8>, meta: &Fields) {
    let json = serde_json::to_vec(meta).unwrap_or_default();
    pdu.extend_from_slice(&META_MAGIC);
    pdu.extend_from_slice(&(json.len() as u32).to_be_bytes());
    pdu.extend_from_slice(&json);
}

/// Slice off the trailer at the LAST magic occurrence, if any.
pub fn split_meta_trailer(frame: &[u8]) -> (&[u8], Option<Fields>) {
    let Some(pos) = frame
        .windows(META_MAGIC.len())
        .rposition(|w| w == META_MAGIC)
    else {
        return (frame, None);
    };
    let after = &frame[pos + META_MAGIC.len()..];
    if after.len() < 4 {
        return (&frame[..pos], None);
    }
    let len = u32::from_be_bytes([after[0], after[1], after[2], after[3]]) as usize;
    let body = &after[4..];
    if body.len() < len {
        warn!("meta trailer shorter than declared length, discarding trailer");
        return (&frame[..pos], None);
    }
    let meta = serde_json::from_slice::<Fields>(&body[..len]).ok();
    (&frame[..pos], meta)
}

/// JSON-level fields the binary layer would strip: everything the
/// template does not encode, minus the origin sentinel.
fn collect_meta(msg: &EtcsMessage, template: &Template) -> Fields {
    let mut meta = Fields::new();
    for (k, v) in &msg.values {
        if k == "origin" || k == "sections" {
            continue;
        }
        if template.declares(k) || template.sub_packets.contains(&k.as_str()) {
            continue;
        }
        meta.insert(k.clone(), v.clone());
    }
    meta
}

// ── Forward: pub/sub → durable queue ─────────────────────────────────

pub struct ForwardBridge {
    rbc_id: String,
    bus: Arc<dyn MessageBus>,
    queue: Arc<dyn DurableQueue>,
    safety: RwLock<SafetyLayer>,
}

impl ForwardBridge {
    pub fn new(rbc_id: &str, bus: Arc<dyn MessageBus>, queue: Arc<dyn DurableQueue>) -> Self {
        Self { rbc_id: rbc_id.into(), bus, queue, safety: RwLock::new(SafetyLayer::new()) }
    }

    pub async fn run(&self) {
        let mut in_rx = self.bus.subscribe(&topics::rbc_in(&self.rbc_id)).await;
        let mut out_rx = self.bus.subscribe(&topics::rbc_out(&self.rbc_id)).await;
        let mut keys_rx = self.bus.subscribe(&topics::obu_keys(&self.rbc_id)).await;
        info!(rbc = %self.rbc_id, "forward bridge up");

        loop {
            // Biased: a KEY_UPDATE racing the first secured message must
            // install before the wrap is attempted.
            tokio::select! {
                biased;
                Some(raw) = keys_rx.recv() => self.install_keys(&raw.payload).await,
                Some(raw) = in_rx.recv() => {
                    if let Err(e) = self.process(&raw.payload, Direction::ToRbc, QUEUE_OBU_TO_RBC).await {
                        warn!("forward bridge: {e}, dropping");
                    }
                }
                Some(raw) = out_rx.recv() => {
                    if let Err(e) = self.process(&raw.payload, Direction::ToObu, QUEUE_RBC_TO_OBU).await {
                        warn!("forward bridge: {e}, dropping");
                    }
                }
                else => break,
            }
        }
    }

    async fn install_keys(&self, raw: &[u8]) {
        match serde_json::from_slice::<KeyUpdate>(raw) {
            Ok(update) => {
                self.safety.write().await.set_keys(update.keys());
                info!("forward bridge: session keys installed");
            }
            Err(e) => warn!("bad KEY_UPDATE: {e}"),
        }
    }

    async fn process(&self, raw: &[u8], dir: Direction, queue: &str) -> Result<(), BridgeError> {
        let msg = EtcsMessage::from_bytes(raw).ok_or_else(|| BridgeError::Unparseable {
            reason: "not a JSON object".into(),
        })?;
        // Loop prevention: never re-bridge what the bridge produced.
        if msg.origin() == Some(Source::Wire) {
            debug!("forward bridge: amqp-origin message, dropping");
            return Ok(());
        }
        let nid_message = msg.nid().ok_or_else(|| BridgeError::Unparseable {
            reason: "missing NID_MESSAGE".into(),
        })?;
        let template = registry().by_nid(nid_message)?;

        let mut merged = template.default_values();
        for (k, v) in &msg.values {
            merged.insert(k.clone(), v.clone());
        }
        let payload = codec::pack(template, &merged, registry())?;
        let mut frame = self.safety.read().await.wrap(&payload, dir)?;

        append_meta_trailer(&mut frame, &collect_meta(&msg, template));
        self.queue.publish(queue, frame).await;
        debug!(nid = nid_message, queue, "forward bridge: PDU queued");
        Ok(())
    }
}

// ── Reverse: durable queue → pub/sub ─────────────────────────────────

pub struct ReverseBridge {
    rbc_id: String,
    bus: Arc<dyn MessageBus>,
    queue: Arc<dyn DurableQueue>,
    safety: RwLock<SafetyLayer>,
    /// Demo bootstrap only: pass PDUs through unverified before keys
    /// arrive instead of dropping them.
    allow_unsecured: bool,
}

impl ReverseBridge {
    pub fn new(rbc_id: &str, bus: Arc<dyn MessageBus>, queue: Arc<dyn DurableQueue>) -> Self {
        Self {
            rbc_id: rbc_id.into(),
            bus,
            queue,
            safety: RwLock::new(SafetyLayer::new()),
            allow_unsecured: false,
        }
    }

    pub fn with_unsecured_passthrough(mut self) -> Self {
        self.allow_unsecured = true;
        self
    }

    pub async fn run(&self) {
        let mut to_rbc = self.queue.consume(QUEUE_OBU_TO_RBC).await;
        let mut to_obu = self.queue.consume(QUEUE_RBC_TO_OBU).await;
        let mut keys_rx = self.bus.subscribe(&topics::obu_keys(&self.rbc_id)).await;
        info!(rbc = %self.rbc_id, "reverse bridge up");

        loop {
            tokio::select! {
                biased;
                Some(raw) = keys_rx.recv() => self.install_keys(&raw.payload).await,
                Some(delivery) = to_rbc.recv() => {
                    if let Err(e) = self.process(&delivery.payload, &topics::rbc_in(&self.rbc_id)).await {
                        warn!("reverse bridge: {e}, dropping delivery");
                    }
                    self.queue.ack(QUEUE_OBU_TO_RBC, delivery.tag).await;
                }
                Some(delivery) = to_obu.recv() => {
                    if let Err(e) = self.process(&delivery.payload, &topics::rbc_out(&self.rbc_id)).await {
                        warn!("reverse bridge: {e}, dropping delivery");
                    }
                    self.queue.ack(QUEUE_RBC_TO_OBU, delivery.tag).await;
                }
                else => break,
            }
        }
    }

    async fn install_keys(&self, raw: &[u8]) {
        match serde_json::from_slice::<KeyUpdate>(raw) {
            Ok(update) => {
                self.safety.write().await.set_keys(update.keys());
                info!("reverse bridge: session keys installed");
            }
            Err(e) => warn!("bad KEY_UPDATE: {e}"),
        }
    }

    /// Decode one delivery and republish; failures are logged and the
    /// delivery is acknowledged regardless (no requeue).
    async fn process(&self, frame: &[u8], topic: &str) -> Result<(), BridgeError> {
        let (pdu, meta) = split_meta_trailer(frame);
        let payload = match self.safety.read().await.unwrap(pdu) {
            Ok((_hdr, payload)) => payload,
            Err(SafetyError::NoKeys) if self.allow_unsecured && pdu.len() >= MIN_PDU_LEN => {
                warn!("reverse bridge: no keys, unverified pass-through");
                pdu[1..pdu.len() - 6].to_vec()
            }
            Err(e) => return Err(e.into()),
        };
        let &nid_message = payload.first().ok_or_else(|| BridgeError::Unparseable {
            reason: "empty payload".into(),
        })?;
        let template = registry().by_nid(nid_message)?;

        let fields = codec::unpack(template, &payload, registry());
        let mut msg = EtcsMessage::new(fields);
        msg.set_origin(Source::Wire);
        msg.set_num("t_bridge_app_ms", now_ms());
        if let Some(meta) = meta {
            for (k, v) in meta {
                msg.values.entry(k).or_insert(v);
            }
        }
        msg.set_num("t_bridge_send_ms", now_ms());

        debug!(nid = nid_message, topic, "reverse bridge: republishing");
        self.bus.publish(topic, msg.to_bytes(), QoS::ExactlyOnce).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trailer_round_trips_and_finds_last_magic() {
        let mut frame = vec![1u8, 2, 3];
        // payload bytes that happen to contain the magic
        frame.extend_from_slice(&META_MAGIC);
        frame.extend_from_slice(&[9, 9]);
        let mut meta = Fields::new();
        meta.insert("msg_id".into(), json!("X-42"));
        meta.insert("label".into(), json!("car"));
        append_meta_trailer(&mut frame, &meta);

        let (pdu, parsed) = split_meta_trailer(&frame);
        assert_eq!(pdu.len(), 3 + META_MAGIC.len() + 2);
        let parsed = parsed.unwrap();
        assert_eq!(parsed.get("msg_id"), Some(&json!("X-42")));
        assert_eq!(parsed.get("label"), Some(&json!("car")));
    }

    #[test]
    fn missing_trailer_is_fine() {
        let frame = vec![1u8, 2, 3, 4, 5, 6, 7];
        let (pdu, meta) = split_meta_trailer(&frame);
        assert_eq!(pdu, frame.as_slice());
        assert!(meta.is_none());
    }

    #[test]
    fn truncated_trailer_is_discarded() {
        let mut frame = vec![1u8, 2, 3];
        frame.extend_from_slice(&META_MAGIC);
        frame.extend_from_slice(&100u32.to_be_bytes());
        frame.extend_from_slice(b"{}"); // far fewer than 100 bytes
        let (pdu, meta) = split_meta_trailer(&frame);
        assert_eq!(pdu, &[1u8, 2, 3][..]);
        assert!(meta.is_none());
    }

    #[test]
    fn meta_collects_only_undeclared_fields() {
        let template = registry().by_nid(136).unwrap();
        let msg = EtcsMessage::new(
            json!({
                "NID_MESSAGE": 136, "T_TRAIN": 7, "SEQUENCE": 3,
                "origin": "obu", "msg_id": "X-1", "t_obu_app_ms": 123,
                "packet0": { "D_LRBG": 1000 },
            })
            .as_object()
            .unwrap()
            .clone(),
        );
        let meta = collect_meta(&msg, template);
        assert!(meta.contains_key("msg_id"));
        assert!(meta.contains_key("SEQUENCE"));
        assert!(meta.contains_key("t_obu_app_ms"));
        assert!(!meta.contains_key("origin"));
        assert!(!meta.contains_key("T_TRAIN"));
        assert!(!meta.contains_key("packet0"));
    }
}
