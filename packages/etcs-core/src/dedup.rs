//! Inbound duplicate filter, applied after the origin gate.
//!
//! Key precedence: `msg_id`, else `NID:SEQUENCE`, else `NID`. Entries
//! expire after 5 s and are purged lazily on insert.

use std::collections::HashMap;

use crate::message::EtcsMessage;

pub const DEDUP_TTL_MS: u64 = 5_000;

#[derive(Debug)]
pub struct DedupCache {
    seen: HashMap<String, u64>,
    ttl_ms: u64,
    drops: u64,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEDUP_TTL_MS)
    }
}

impl DedupCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self { seen: HashMap::new(), ttl_ms, drops: 0 }
    }

    pub fn key_for(msg: &EtcsMessage) -> String {
        if let Some(id) = msg.msg_id() {
            return id.to_string();
        }
        match (msg.nid(), msg.sequence()) {
            (Some(n), Some(seq)) => format!("{n}:{seq}"),
            (Some(n), None) => n.to_string(),
            _ => String::from("?"),
        }
    }

    /// Returns true if the message is fresh; a duplicate inside the TTL
    /// window returns false and bumps the drop counter.
    pub fn check_and_insert(&mut self, msg: &EtcsMessage, now_ms: u64) -> bool {
        self.seen.retain(|_, last| now_ms.saturating_sub(*last) <= self.ttl_ms);
        let key = Self::key_for(msg);
        match self.seen.get(&key) {
            Some(_) => {
                self.drops += 1;
                false
            }
            None => {
                self.seen.insert(key, now_ms);
                true
            }
        }
    }

    pub fn drops(&self) -> u64 {
        self.drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(v: serde_json::Value) -> EtcsMessage {
        EtcsMessage::new(v.as_object().unwrap().clone())
    }

    #[test]
    fn key_precedence() {
        let with_id = msg(json!({ "NID_MESSAGE": 136, "SEQUENCE": 4, "msg_id": "X-42" }));
        assert_eq!(DedupCache::key_for(&with_id), "X-42");
        let with_seq = msg(json!({ "NID_MESSAGE": 136, "SEQUENCE": 4 }));
        assert_eq!(DedupCache::key_for(&with_seq), "136:4");
        let bare = msg(json!({ "NID_MESSAGE": 136 }));
        assert_eq!(DedupCache::key_for(&bare), "136");
    }

    #[test]
    fn duplicate_within_ttl_is_dropped() {
        let mut cache = DedupCache::default();
        let m = msg(json!({ "NID_MESSAGE": 146, "SEQUENCE": 9 }));
        assert!(cache.check_and_insert(&m, 1_000));
        assert!(!cache.check_and_insert(&m, 2_000));
        assert_eq!(cache.drops(), 1);
    }

    #[test]
    fn entry_expires_after_ttl() {
        let mut cache = DedupCache::default();
        let m = msg(json!({ "NID_MESSAGE": 146, "SEQUENCE": 9 }));
        assert!(cache.check_and_insert(&m, 1_000));
        assert!(cache.check_and_insert(&m, 6_001));
    }
}
