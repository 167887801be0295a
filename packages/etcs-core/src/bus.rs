//! Transport seam: the pub/sub broker and the durable queue broker are
//! external daemons, addressed through traits only. `LocalBus` and
//! `LocalQueue` are in-process implementations backing the tests and
//! the demonstrator harness; a production deployment substitutes real
//! broker clients behind the same traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Publish quality of service. ETCS plane runs at `ExactlyOnce`,
/// alerts/status at `AtLeastOnce`, the video probe at `AtMostOnce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS);
    async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<BusMessage>;
}

/// One delivery from a durable queue. The demonstrator acks
/// unconditionally — decode failures are logged, never requeued.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Vec<u8>,
    pub tag: u64,
}

#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>);
    async fn consume(&self, queue: &str) -> mpsc::UnboundedReceiver<Delivery>;
    async fn ack(&self, queue: &str, tag: u64);
}

// ── Topic namespace ──────────────────────────────────────────────────

pub mod topics {
    pub fn obu_handshake(rbc_id: &str) -> String {
        format!("obu/{rbc_id}/handshake")
    }
    pub fn rbc_handshake(rbc_id: &str) -> String {
        format!("rbc/{rbc_id}/handshake")
    }
    pub fn obu_keys(rbc_id: &str) -> String {
        format!("obu/{rbc_id}/keys")
    }
    pub fn rbc_in(rbc_id: &str) -> String {
        format!("rbc/{rbc_id}/in")
    }
    pub fn rbc_out(rbc_id: &str) -> String {
        format!("rbc/{rbc_id}/out")
    }
    pub fn sensor(rbc_id: &str) -> String {
        format!("esp32/{rbc_id}/sensor")
    }
    pub fn status(train_id: &str) -> String {
        format!("obu/{train_id}/status")
    }
    pub fn kpi_pos(rbc_id: &str) -> String {
        format!("kpi/{rbc_id}/pos")
    }

    pub const AI_ALERT: &str = "obu/ai/alert";
    pub const AI_ACK: &str = "obu/ai/ack";
    pub const TRAIN_CMD: &str = "obu/train";
    pub const TRAIN_META: &str = "obu/train/meta";
    pub const VIDEO_PING: &str = "obu/video/ping";
    pub const VIDEO_PONG: &str = "obu/video/pong";
}

/// Durable queue names of the logical RBC↔OBU pipe.
pub const QUEUE_OBU_TO_RBC: &str = "obu_to_rbc";
pub const QUEUE_RBC_TO_OBU: &str = "rbc_to_obu";

// ── In-process implementations ───────────────────────────────────────

/// Exact-topic fan-out bus. Dead subscribers are pruned on publish.
#[derive(Default, Clone)]
pub struct LocalBus {
    subs: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) {
        let mut subs = self.subs.lock().await;
        if let Some(senders) = subs.get_mut(topic) {
            senders.retain(|tx| {
                tx.send(BusMessage { topic: topic.to_string(), payload: payload.clone() }).is_ok()
            });
        }
        debug!(topic, len = payload.len(), "bus publish");
    }

    async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().await.entry(topic.to_string()).or_default().push(tx);
        rx
    }
}

/// FIFO in-process queue pair with no-op acks.
#[derive(Default, Clone)]
pub struct LocalQueue {
    consumers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>>,
    next_tag: Arc<Mutex<u64>>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableQueue for LocalQueue {
    async fn publish(&self, queue: &str, payload: Vec<u8>) {
        let tag = {
            let mut t = self.next_tag.lock().await;
            *t += 1;
            *t
        };
        let mut consumers = self.consumers.lock().await;
        if let Some(senders) = consumers.get_mut(queue) {
            senders.retain(|tx| {
                tx.send(Delivery { queue: queue.to_string(), payload: payload.clone(), tag }).is_ok()
            });
        }
        debug!(queue, tag, len = payload.len(), "queue publish");
    }

    async fn consume(&self, queue: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.lock().await.entry(queue.to_string()).or_default().push(tx);
        rx
    }

    async fn ack(&self, _queue: &str, _tag: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_fans_out_per_topic() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("rbc/DE0001/in").await;
        let mut b = bus.subscribe("rbc/DE0001/in").await;
        let mut other = bus.subscribe("rbc/DE0001/out").await;

        bus.publish("rbc/DE0001/in", b"hello".to_vec(), QoS::ExactlyOnce).await;
        assert_eq!(a.recv().await.unwrap().payload, b"hello");
        assert_eq!(b.recv().await.unwrap().payload, b"hello");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn queue_preserves_fifo_order() {
        let q = LocalQueue::new();
        let mut rx = q.consume(QUEUE_OBU_TO_RBC).await;
        q.publish(QUEUE_OBU_TO_RBC, vec![1]).await;
        q.publish(QUEUE_OBU_TO_RBC, vec![2]).await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.payload[0], second.payload[0]), (1, 2));
        assert!(first.tag < second.tag);
        q.ack(QUEUE_OBU_TO_RBC, first.tag).await;
    }
}
