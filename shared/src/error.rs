//! Error codes surfaced to hosts and the NACK reasons carried on the wire
//!
//! The server reports rejections through a single payload byte inside a NACK
//! frame. Those bytes map one-to-one onto [`NackReason`]; bytes the client does
//! not know about are preserved in [`NackReason::Unrecognized`] instead of
//! failing the parse. [`ErrorCode`] is the sticky code a client exposes after a
//! flow fails, combining local failures with server NACK reasons.

use num_enum::FromPrimitive;
use std::fmt;
use thiserror::Error;

/// Reason byte carried at the payload offset of a NACK frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum NackReason {
    ErrorContactingMcu = 243,
    McuOffline = 244,
    NoMcuInfo = 245,
    ServoCountMismatch = 246,
    InvalidParameter = 247,
    NoActiveMcu = 249,
    InvalidQuery = 250,
    #[num_enum(catch_all)]
    Unrecognized(u8),
}

impl NackReason {
    /// Raw wire byte for this reason
    pub fn code(self) -> u8 {
        match self {
            NackReason::InvalidQuery => 250,
            NackReason::NoActiveMcu => 249,
            NackReason::InvalidParameter => 247,
            NackReason::ServoCountMismatch => 246,
            NackReason::NoMcuInfo => 245,
            NackReason::McuOffline => 244,
            NackReason::ErrorContactingMcu => 243,
            NackReason::Unrecognized(code) => code,
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::InvalidQuery => write!(f, "invalid query"),
            NackReason::NoActiveMcu => write!(f, "no active MCU"),
            NackReason::InvalidParameter => write!(f, "invalid parameter"),
            NackReason::ServoCountMismatch => write!(f, "servo count mismatch"),
            NackReason::NoMcuInfo => write!(f, "no MCU info"),
            NackReason::McuOffline => write!(f, "MCU offline"),
            NackReason::ErrorContactingMcu => write!(f, "error contacting MCU"),
            NackReason::Unrecognized(code) => write!(f, "unrecognized NACK code {}", code),
        }
    }
}

/// Sticky error code observed by hosts through `get_last_error`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    #[error("No error")]
    Clear,

    #[error("Generic error")]
    Generic,

    /// Transport failure or a response matching no known frame
    #[error("Server connection error")]
    ServerConnError,

    /// Info response was malformed (zero servos or truncated)
    #[error("Information from server (iMCU) was corrupted")]
    CorruptedInfo,

    #[error("No server connection")]
    NoServerConnection,

    #[error("Servo id out of range")]
    InvalidServoId,

    #[error("Servo position out of range")]
    InvalidServoPosition,

    #[error("Server NACK: {0}")]
    Nack(NackReason),
}

impl ErrorCode {
    /// Numeric code as exposed to hosts; NACK reasons keep their wire byte
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::Clear => 0,
            ErrorCode::Generic => 1,
            ErrorCode::ServerConnError => 2,
            ErrorCode::CorruptedInfo => 3,
            ErrorCode::NoServerConnection => 4,
            ErrorCode::InvalidServoId => 100,
            ErrorCode::InvalidServoPosition => 101,
            ErrorCode::Nack(reason) => reason.code(),
        }
    }

    pub fn is_clear(self) -> bool {
        self == ErrorCode::Clear
    }
}

impl From<NackReason> for ErrorCode {
    fn from(reason: NackReason) -> Self {
        ErrorCode::Nack(reason)
    }
}

/// Why an info frame could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("info frame reports zero servos")]
    ZeroServoCount,

    #[error("info frame truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("info frame reports {count} servos, limit is {limit}")]
    TooManyServos { count: usize, limit: usize },
}
