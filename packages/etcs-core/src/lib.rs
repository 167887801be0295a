//! # etcs-core
//!
//! Core of a simplified ETCS Level 2 signaling demonstrator: the
//! on-board (OBU) and trackside (RBC) session orchestrators, the
//! deterministic session state machine, the mutual handshake with
//! session-key derivation, the bit-packed wire codec, the safety
//! encapsulation layer (CBC-MAC + CRC-16 framing), the pub/sub ↔
//! durable-queue bridges, and the automatic-stop coordinator for
//! computer-vision obstacle alerts.
//!
//! External daemons (broker, queue broker, camera pipeline, actuator,
//! UI) are reached through the transport traits in [`bus`]; the
//! in-process implementations there back the tests and the
//! demonstrator harness.

pub mod autostop;
pub mod bridge;
pub mod bus;
pub mod codec;
pub mod crc;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod handshake;
pub mod kpi;
pub mod message;
pub mod obu;
pub mod packet15;
pub mod rbc;
pub mod safety;
pub mod status;
pub mod templates;
pub mod topology;

pub use bridge::{ForwardBridge, ReverseBridge};
pub use bus::{DurableQueue, LocalBus, LocalQueue, MessageBus, QoS};
pub use engine::EtcsEngine;
pub use error::{BridgeError, CodecError, SafetyError, SessionError, StateError, TemplateError};
pub use fsm::{SessionEvent, SessionFsm, SessionState};
pub use handshake::{derive_session_keys, Au1, Au2, KeyUpdate, NoncePair, RootKeys};
pub use message::{EtcsMessage, Source};
pub use obu::{Obu, ObuConfig};
pub use rbc::{Rbc, RbcConfig, RouteConfig};
pub use safety::{Direction, SafetyLayer, SessionKeys};
pub use topology::Topology;
