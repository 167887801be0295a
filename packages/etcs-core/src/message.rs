//! Logical ETCS messages as they travel on the pub/sub plane.
//!
//! A message is a flat dictionary of named numeric fields plus at most
//! one nested `packetN` object per declared sub-packet, carried as JSON
//! between processes. The envelope fields (`NID_MESSAGE`, `SEQUENCE`,
//! `origin`, timestamps) ride in the same dictionary; typed accessors
//! below keep the rest of the crate out of the string-key business.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known NID_MESSAGE values.
pub mod nid {
    pub const MA: u8 = 3;
    pub const TRAIN_DATA_ACK: u8 = 8;
    pub const SYSTEM_VERSION: u8 = 32;
    pub const SESSION_ACK: u8 = 38;
    pub const TERMINATION_ACK: u8 = 39;
    pub const TRAIN_ACCEPTED: u8 = 41;
    pub const TRAIN_DATA: u8 = 129;
    pub const MA_REQUEST: u8 = 132;
    pub const POSITION_REPORT: u8 = 136;
    pub const ACK: u8 = 146;
    pub const END_OF_MISSION: u8 = 150;
    pub const VERSION_REJECT: u8 = 154;
    pub const SESSION_ESTABLISH: u8 = 155;
    pub const SESSION_TERMINATE: u8 = 156;
    pub const TRAIN_ACCEPTANCE: u8 = 157;
    pub const KEYS_AUTH: u8 = 159;

    /// Local identifiers for the handshake plane. AU1/AU2 never appear
    /// inside a safety PDU; these values exist so the admit-set table
    /// can gate them like any other inbound message.
    pub const AU1: u8 = 0xA1;
    pub const AU2: u8 = 0xA2;
}

/// Where a message came from. Protocol peers admit only `Wire` —
/// everything else is a locally generated original that the bridge has
/// not carried yet (loop-prevention invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "amqp")]
    Wire,
    #[serde(rename = "obu")]
    LocalObu,
    #[serde(rename = "rbc")]
    LocalRbc,
    #[serde(rename = "system")]
    Internal,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Wire => "amqp",
            Source::LocalObu => "obu",
            Source::LocalRbc => "rbc",
            Source::Internal => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        match s {
            "amqp" => Some(Source::Wire),
            "obu" => Some(Source::LocalObu),
            "rbc" => Some(Source::LocalRbc),
            "system" => Some(Source::Internal),
            _ => None,
        }
    }
}

/// Field dictionary of one logical message.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EtcsMessage {
    pub values: Fields,
}

impl EtcsMessage {
    pub fn new(values: Fields) -> Self {
        Self { values }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.values).unwrap_or_default()
    }

    pub fn nid(&self) -> Option<u8> {
        self.num("NID_MESSAGE").map(|v| v as u8)
    }

    pub fn sequence(&self) -> Option<u64> {
        self.num("SEQUENCE")
    }

    pub fn origin(&self) -> Option<Source> {
        self.values
            .get("origin")
            .and_then(Value::as_str)
            .and_then(Source::parse)
    }

    pub fn set_origin(&mut self, origin: Source) {
        self.values
            .insert("origin".into(), Value::String(origin.as_str().into()));
    }

    /// Numeric field lookup, tolerating JSON floats that are whole.
    pub fn num(&self, key: &str) -> Option<u64> {
        as_u64(self.values.get(key)?)
    }

    pub fn set_num(&mut self, key: &str, v: u64) {
        self.values.insert(key.into(), Value::from(v));
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Nested sub-packet values, e.g. `packet15`.
    pub fn packet(&self, name: &str) -> Option<&Fields> {
        self.values.get(name).and_then(Value::as_object)
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.str_field("msg_id")
    }
}

pub(crate) fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }
}
