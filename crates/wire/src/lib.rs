//! Navi Wire Protocol
//!
//! Shared encoding for everything that crosses a session channel between a
//! controller and the host. Both sides MUST depend on this crate so they
//! agree on the byte layout.
//!
//! # Message Categories
//!
//! - **Unreliable channel**: fixed-layout pose samples, one per controller tick.
//! - **Reliable channel**: touch records and RPC calls (handshake, commands).
//! - **Reliable-fragmented channel**: RPC calls carrying asset bundle chunks.
//!
//! # Envelope
//!
//! Every message starts with a one-byte tag:
//!
//! | tag | body |
//! |-----|------|
//! | `1` | pose: 10 × f32 LE (position xyz, rotation xyzw, acceleration xyz) |
//! | `2` | touch: i32 finger, u8 phase, f32 x, f32 y, i32 tap count (LE) |
//! | `3` | rpc: Protobuf `RpcCallProto` |
//!
//! Discovery datagrams use a separate text format, see [`discovery`].

#![deny(unsafe_code)]

pub mod discovery;
pub mod rpc;

pub use discovery::{Advertisement, DiscoveryDatagram};
pub use rpc::{ArgKind, RpcArg, RpcCall, method};

use navi_pose::{PoseSample, Quat, Vec2, Vec3};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for a single pose datagram on the unreliable channel.
pub const POSE_BUFFER_SIZE: usize = 256;

/// Envelope tag for pose samples.
pub const TAG_POSE: u8 = 1;

/// Envelope tag for touch records.
pub const TAG_TOUCH: u8 = 2;

/// Envelope tag for RPC calls.
pub const TAG_RPC: u8 = 3;

/// Encoded pose body length (10 × f32).
pub const POSE_BODY_LEN: usize = 40;

/// Encoded touch body length.
pub const TOUCH_BODY_LEN: usize = 17;

// ============================================================================
// Errors
// ============================================================================

/// A datagram or message could not be decoded.
///
/// The caller logs and drops the offending unit; the session stays up.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty buffer")]
    Empty,

    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("truncated {what}: need {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid touch phase {0}")]
    InvalidPhase(u8),

    #[error("rpc envelope: {0}")]
    Rpc(#[from] prost::DecodeError),

    #[error("argument {index} of {method} carries no value")]
    MissingValue { method: String, index: usize },

    #[error("{method} expects {expected} arguments, got {actual}")]
    ArgCount {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} of {method}: expected {expected}, got {actual}")]
    ArgType {
        method: String,
        index: usize,
        expected: ArgKind,
        actual: ArgKind,
    },

    #[error("argument {index} of {method} is out of range")]
    ArgRange { method: String, index: usize },

    #[error("discovery datagram is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed advertisement {0:?}")]
    MalformedAdvertisement(String),
}

// ============================================================================
// Protobuf RPC envelope
// ============================================================================

/// RPC call as carried on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcCallProto {
    /// Method name, e.g. `"DeviceNo"`.
    #[prost(string, tag = "1")]
    pub method: String,

    /// Ordered, heterogeneously typed arguments.
    #[prost(message, repeated, tag = "2")]
    pub args: Vec<RpcArgProto>,
}

/// One RPC argument.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcArgProto {
    #[prost(oneof = "rpc_arg_proto::Value", tags = "1, 2, 3, 4, 5")]
    pub value: Option<rpc_arg_proto::Value>,
}

pub mod rpc_arg_proto {
    /// Argument variants. Vector components travel as `Float`.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(int32, tag = "1")]
        Int(i32),
        #[prost(float, tag = "2")]
        Float(f32),
        #[prost(bool, tag = "3")]
        Bool(bool),
        #[prost(string, tag = "4")]
        Str(String),
        #[prost(bytes = "vec", tag = "5")]
        Blob(Vec<u8>),
    }
}

/// A received asset bundle as persisted to disk.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AssetBundleFile {
    /// Lowercase hex SHA-256 of `data`.
    #[prost(string, tag = "1")]
    pub sha256: String,

    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

// ============================================================================
// Touch records
// ============================================================================

/// Lifecycle phase of a touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPhase {
    Began,
    Ended,
    Stationary,
    Moved,
    Canceled,
}

impl TouchPhase {
    pub fn code(self) -> u8 {
        match self {
            Self::Began => 1,
            Self::Ended => 2,
            Self::Stationary => 3,
            Self::Moved => 4,
            Self::Canceled => 5,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(Self::Began),
            2 => Ok(Self::Ended),
            3 => Ok(Self::Stationary),
            4 => Ok(Self::Moved),
            5 => Ok(Self::Canceled),
            other => Err(DecodeError::InvalidPhase(other)),
        }
    }
}

/// One touch reported by a controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchEvent {
    pub finger_id: i32,
    pub phase: TouchPhase,
    pub position: Vec2,
    pub tap_count: i32,
}

// ============================================================================
// Envelope
// ============================================================================

/// Everything that crosses a session channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Pose(PoseSample),
    Touch(TouchEvent),
    Rpc(RpcCall),
}

impl From<PoseSample> for WireMessage {
    fn from(sample: PoseSample) -> Self {
        Self::Pose(sample)
    }
}

impl From<TouchEvent> for WireMessage {
    fn from(touch: TouchEvent) -> Self {
        Self::Touch(touch)
    }
}

impl From<RpcCall> for WireMessage {
    fn from(call: RpcCall) -> Self {
        Self::Rpc(call)
    }
}

/// Encode a message into a fresh buffer.
pub fn encode(message: &WireMessage) -> Vec<u8> {
    match message {
        WireMessage::Pose(sample) => {
            let mut out = Vec::with_capacity(1 + POSE_BODY_LEN);
            out.push(TAG_POSE);
            encode_pose_body(sample, &mut out);
            out
        }
        WireMessage::Touch(touch) => {
            let mut out = Vec::with_capacity(1 + TOUCH_BODY_LEN);
            out.push(TAG_TOUCH);
            out.extend_from_slice(&touch.finger_id.to_le_bytes());
            out.push(touch.phase.code());
            out.extend_from_slice(&touch.position.x.to_le_bytes());
            out.extend_from_slice(&touch.position.y.to_le_bytes());
            out.extend_from_slice(&touch.tap_count.to_le_bytes());
            out
        }
        WireMessage::Rpc(call) => {
            let proto = RpcCallProto::from(call.clone());
            let mut out = Vec::with_capacity(1 + prost::Message::encoded_len(&proto));
            out.push(TAG_RPC);
            out.extend_from_slice(&prost::Message::encode_to_vec(&proto));
            out
        }
    }
}

/// Decode one message. Trailing bytes after fixed-size records are ignored.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, DecodeError> {
    let (&tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    match tag {
        TAG_POSE => decode_pose_body(body).map(WireMessage::Pose),
        TAG_TOUCH => decode_touch_body(body).map(WireMessage::Touch),
        TAG_RPC => {
            let proto: RpcCallProto = prost::Message::decode(body)?;
            RpcCall::try_from(proto).map(WireMessage::Rpc)
        }
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn encode_pose_body(sample: &PoseSample, out: &mut Vec<u8>) {
    let fields = [
        sample.position.x,
        sample.position.y,
        sample.position.z,
        sample.rotation.x,
        sample.rotation.y,
        sample.rotation.z,
        sample.rotation.w,
        sample.acceleration.x,
        sample.acceleration.y,
        sample.acceleration.z,
    ];
    for value in fields {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn decode_pose_body(body: &[u8]) -> Result<PoseSample, DecodeError> {
    if body.len() < POSE_BODY_LEN {
        return Err(DecodeError::Truncated {
            what: "pose",
            expected: POSE_BODY_LEN,
            actual: body.len(),
        });
    }
    let mut fields = [0f32; 10];
    for (i, field) in fields.iter_mut().enumerate() {
        *field = read_f32(body, i * 4);
    }
    Ok(PoseSample {
        position: Vec3::new(fields[0], fields[1], fields[2]),
        rotation: Quat::new(fields[3], fields[4], fields[5], fields[6]),
        acceleration: Vec3::new(fields[7], fields[8], fields[9]),
    })
}

fn decode_touch_body(body: &[u8]) -> Result<TouchEvent, DecodeError> {
    if body.len() < TOUCH_BODY_LEN {
        return Err(DecodeError::Truncated {
            what: "touch",
            expected: TOUCH_BODY_LEN,
            actual: body.len(),
        });
    }
    Ok(TouchEvent {
        finger_id: read_i32(body, 0),
        phase: TouchPhase::from_code(body[4])?,
        position: Vec2::new(read_f32(body, 5), read_f32(body, 9)),
        tap_count: read_i32(body, 13),
    })
}

// Callers check length first.
fn read_f32(buf: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

// ============================================================================
// Tests
// ============================================================================
