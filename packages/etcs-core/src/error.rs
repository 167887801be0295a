use thiserror::Error;

/// Bit-codec failures. Encode-side errors are bugs in the caller and
/// propagate; decode-side errors are logged and the message is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A field value does not fit its declared width, or is not numeric.
    #[error("field {field} out of range for {bits}-bit encoding")]
    OutOfRange { field: String, bits: u8 },
    /// The bit stream ended before all declared fields were read.
    #[error("insufficient bits while reading {field}")]
    InsufficientBits { field: String },
}

/// Safety-layer failures. All of them drop the PDU; queue deliveries
/// are still acknowledged (demonstrator policy, no requeue).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SafetyError {
    #[error("no session keys installed")]
    NoKeys,
    #[error("CRC mismatch (expected {expected:#06x}, got {got:#06x})")]
    CrcMismatch { expected: u16, got: u16 },
    #[error("MAC mismatch on NID {nid}")]
    MacMismatch { nid: u8 },
    #[error("PDU too short ({len} bytes, minimum 7)")]
    TooShort { len: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("no transition for event {event} in state {state}")]
    InvalidTransition { state: String, event: String },
    #[error("NID {nid} not admitted in state {state}")]
    MessageNotAdmitted { nid: u8, state: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no template for NID_MESSAGE {nid}")]
    Missing { nid: u8 },
    #[error("no template named {name}")]
    MissingByName { name: String },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unparseable bridge input: {reason}")]
    Unparseable { reason: String },
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("handshake timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
}
