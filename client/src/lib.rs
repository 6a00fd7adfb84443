//! # Servolink Client Library
//!
//! This library drives a remote servo bench through an intermediary server. The
//! server speaks a small line-based protocol over TCP, forwards commands to a
//! named microcontroller (MCU), and reports the MCU's servo table back. The
//! client logs in, selects an MCU, fetches its servo positions, and streams
//! movement commands to it.
//!
//! ## Architecture Overview
//!
//! Every host-facing operation is fire-and-forget. It checks the current
//! phase, launches a flow on the tokio runtime and returns. Failures do not
//! come back as return values; they land in a sticky error code that stays
//! set until the host clears it.
//!
//! ### Phase Guards
//! The client is always in exactly one phase (`StartingUp`, `Idle`,
//! `WaitingServerAck`, ...). Each operation may only start from certain
//! phases; a request made from any other phase is ignored. This keeps a host
//! that fires commands from a UI thread from overlapping two exchanges on the
//! same socket.
//!
//! ### Movement Coalescing
//! Servo commands usually arrive much faster than the server can confirm
//! them. They are merged per servo into a pending buffer, and a single drain
//! loop sends whatever is pending, waits for the server ACK and then the
//! device ACK, and repeats while new commands arrived. The most recent
//! position per servo wins and nothing submitted is lost.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! [`RemoteClient`], the orchestrator running connect, select, fetch,
//! movement and disconnect flows.
//!
//! ### Transport Module (`transport`)
//! The single TCP session. No framing, no retry, and a close signal that
//! unblocks a pending receive.
//!
//! ### Status Module (`status`)
//! Phase, sticky error flag and last error code, kept in a `watch` channel
//! so guard checks are atomic and observers can await changes.
//!
//! ### Coalescer Module (`coalescer`)
//! Pending and confirmed servo positions plus the drain loop.
//!
//! ### Supervisor Module (`supervisor`)
//! Bookkeeping of running flows per kind, used by disconnect, shutdown and
//! `clear_error`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use servolink_client::{ClientConfig, ClientStatus, RemoteClient};
//! use servolink_shared::ServoCommand;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RemoteClient::new(ClientConfig::new("192.168.137.1", 54817))?;
//!
//!     // Login, select the default MCU and fetch its servo table
//!     client.connect();
//!     client
//!         .wait_for(|s| s.status == ClientStatus::Idle || s.errored, Duration::from_secs(5))
//!         .await;
//!
//!     client.send_movement(&[ServoCommand::new(0, 45)])?;
//!     client
//!         .wait_for(|s| s.status == ClientStatus::Idle, Duration::from_secs(5))
//!         .await;
//!     println!("Positions: {:?}", client.get_current_positions());
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod coalescer;
pub mod config;
pub mod error;
pub mod network;
pub mod status;
pub mod supervisor;
pub mod transport;

pub use config::ClientConfig;
pub use error::{ClientError, TransportError};
pub use network::RemoteClient;
pub use status::{ClientStatus, StatusSnapshot};
pub use supervisor::FlowKind;
