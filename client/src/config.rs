//! Client configuration
//!
//! Plain values supplied at construction. Defaults match the bench setup the
//! protocol was built around: the server on `192.168.137.1:54817` and an MCU
//! named `smartMCU` selected right after login.

use serde::{Deserialize, Serialize};
use servolink_shared::{DEFAULT_HOST, DEFAULT_MCU_NAME, DEFAULT_PORT};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server IP address
    pub host: String,
    pub port: u16,
    /// MCU selected automatically after a successful login
    pub default_mcu: Option<String>,
    /// Maximum bytes taken from a single receive call
    pub recv_buffer_size: usize,
    pub connect_timeout: Duration,
    /// How long a disconnect waits for an in-flight flow to settle before
    /// forcing the socket closed
    pub drain_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            default_mcu: Some(DEFAULT_MCU_NAME.to_string()),
            recv_buffer_size: 256,
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_default_mcu(mut self, name: Option<impl Into<String>>) -> Self {
        self.default_mcu = name.map(Into::into);
        self
    }

    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
