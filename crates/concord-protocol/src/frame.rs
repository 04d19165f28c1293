//! Opcode framing.
//!
//! Every message on the wire is a JSON object `{op, d, t, s}`:
//! `op` selects the frame kind, `d` carries the opcode-specific payload,
//! `t` names the event on Dispatch frames, and `s` is the hub-allocated
//! sequence number present on every server-originated Dispatch.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::events::EventName;

/// Hard cap on a single frame, enforced on both sides.
pub const MAX_FRAME_BYTES: usize = 512 * 1024;

/// Frame kinds. 0-15 are protocol plumbing, 20-28 are authenticated
/// client commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OpCode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    TypingStart = 4,
    SendMessage = 5,
    RequestGuild = 6,
    RequestMessages = 7,
    Hello = 10,
    HeartbeatAck = 11,
    Ready = 12,
    Reconnect = 13,
    InvalidSession = 14,
    Error = 15,
    ChannelCreate = 20,
    ChannelUpdate = 21,
    ChannelDelete = 22,
    RoleAssign = 23,
    RoleRemove = 24,
    KickMember = 25,
    BanMember = 26,
    MuteMember = 27,
    Whisper = 28,
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = UnknownOpCode;

    fn try_from(value: u8) -> Result<Self, UnknownOpCode> {
        use OpCode::*;
        Ok(match value {
            0 => Dispatch,
            1 => Heartbeat,
            2 => Identify,
            3 => PresenceUpdate,
            4 => TypingStart,
            5 => SendMessage,
            6 => RequestGuild,
            7 => RequestMessages,
            10 => Hello,
            11 => HeartbeatAck,
            12 => Ready,
            13 => Reconnect,
            14 => InvalidSession,
            15 => Error,
            20 => ChannelCreate,
            21 => ChannelUpdate,
            22 => ChannelDelete,
            23 => RoleAssign,
            24 => RoleRemove,
            25 => KickMember,
            26 => BanMember,
            27 => MuteMember,
            28 => Whisper,
            other => return Err(UnknownOpCode(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown opcode {0}")]
pub struct UnknownOpCode(pub u8);

/// Closed error taxonomy carried by `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ErrorCode {
    Unknown = 0,
    InvalidPayload = 1,
    Unauthorized = 2,
    AlreadyAuthenticated = 3,
    Forbidden = 4,
    NotFound = 5,
    ServerError = 6,
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        code as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown error code {0}")]
pub struct UnknownErrorCode(pub u8);

impl TryFrom<u8> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(value: u8) -> Result<Self, UnknownErrorCode> {
        use ErrorCode::*;
        Ok(match value {
            0 => Unknown,
            1 => InvalidPayload,
            2 => Unauthorized,
            3 => AlreadyAuthenticated,
            4 => Forbidden,
            5 => NotFound,
            6 => ServerError,
            other => return Err(UnknownErrorCode(other)),
        })
    }
}

/// The `d` payload of an `Error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<EventName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte cap")]
    TooLarge(usize),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Frame {
    /// A bare frame with no payload (HeartbeatAck, Reconnect).
    pub fn bare(op: OpCode) -> Self {
        Frame { op, d: None, t: None, s: None }
    }

    /// A command or plumbing frame carrying a typed payload.
    pub fn with_payload<T: Serialize>(op: OpCode, payload: &T) -> Result<Self, FrameError> {
        Ok(Frame {
            op,
            d: Some(serde_json::to_value(payload)?),
            t: None,
            s: None,
        })
    }

    /// A server-originated Dispatch with its event name and sequence number.
    pub fn dispatch<T: Serialize>(
        event: EventName,
        seq: u64,
        payload: &T,
    ) -> Result<Self, FrameError> {
        Ok(Frame {
            op: OpCode::Dispatch,
            d: Some(serde_json::to_value(payload)?),
            t: Some(event),
            s: Some(seq),
        })
    }

    /// An `Error` frame addressed to a misbehaving or unlucky client.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let payload = ErrorPayload { code, message: message.into() };
        Frame {
            op: OpCode::Error,
            d: serde_json::to_value(&payload).ok(),
            t: None,
            s: None,
        }
    }

    /// Deserialize the `d` payload into its typed form.
    ///
    /// A missing `d` decodes as JSON `null`, so payload-less heartbeats
    /// (`{"op":1}`) are accepted wherever the target type tolerates null.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        let value = self.d.clone().unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(text.len()));
        }
        Ok(text)
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }
}
