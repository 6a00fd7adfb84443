//! # Servolink Simulated Server
//!
//! A stand-in for the intermediary server and the microcontrollers behind it.
//! It speaks the same wire protocol as the real bench, so the client can be
//! exercised end to end without hardware.
//!
//! ## Behavior
//!
//! - A connection must send the login token first. Anything else is answered
//!   with an `InvalidQuery` NACK and the connection is closed.
//! - `sMCU` selects an MCU for the connection. Unknown names get
//!   `InvalidParameter`, offline MCUs get `McuOffline`.
//! - `iMCU` answers with an info frame of the selected MCU, or `NoActiveMcu`.
//! - `SRVP` is answered with a server ACK right away. After the simulated
//!   device latency the positions are applied and a device ACK follows.
//!   Servo ids beyond the MCU's table get `ServoCountMismatch`.
//!
//! Tests can script the next response to a query kind through
//! [`SimHandle::inject`] and read back every accepted movement through
//! [`SimHandle::movements`].
//!
//! ## Module Organization
//!
//! ### MCU Module (`mcu`)
//! Simulated MCUs with their servo tables, and the shared registry.
//!
//! ### Network Module (`network`)
//! The TCP accept loop, per-connection query handling and the control handle.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use servolink_server::mcu::McuRegistry;
//! use servolink_server::network::{SimConfig, SimServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = McuRegistry::from_specs(&["smartMCU:4".parse()?]);
//!     let server = SimServer::bind("127.0.0.1:54817", registry, SimConfig::default()).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod mcu;
pub mod network;

pub use network::{Injection, QueryKind, SimConfig, SimHandle, SimServer};
