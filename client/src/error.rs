//! Client-side error types
//!
//! Flow failures are not returned to callers; they are recorded as a sticky
//! [`ErrorCode`](servolink_shared::ErrorCode) on the client status. The types
//! here cover what does surface synchronously: transport calls and batch
//! validation in `send_movement`.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Connection to {addr} refused or unreachable: {source}")]
    Refused {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Not connected")]
    NotConnected,

    /// Peer closed the stream or the session was closed locally
    #[error("Connection closed")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Servo id {servo_id} out of range (servo count: {servo_count})")]
    InvalidServoId { servo_id: u8, servo_count: usize },

    #[error("Servo position {position} out of range for servo {servo_id} (max 179)")]
    InvalidServoPosition { servo_id: u8, position: u8 },

    #[error("No tokio runtime available to run client flows")]
    NoRuntime,
}
