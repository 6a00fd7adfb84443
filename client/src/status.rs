//! Client status state machine
//!
//! Holds the phase, the sticky error flag and the last error code in one
//! `watch` channel. Every guard check and the transition it allows happen in a
//! single `send_if_modified` closure, so two flows can never both pass the same
//! guard. Observers subscribe to the channel and wait for a predicate instead
//! of polling.
//!
//! Transitions requested from inside a flow go through [`StatusMachine::advance`],
//! which only moves from an expected phase. A flow whose client was
//! disconnected underneath it therefore cannot drag the status back out of
//! `NoServerConn`.

use servolink_shared::ErrorCode;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientStatus {
    StartingUp,
    NoServerConn,
    Idle,
    OnMcuSelect,
    RetrievingInfoAfterSelect,
    RetrievingInfo,
    WaitingServerAck,
    WaitingDeviceAck,
}

impl ClientStatus {
    /// Phases in which a movement drain loop is active
    pub fn is_draining(self) -> bool {
        matches!(
            self,
            ClientStatus::WaitingServerAck | ClientStatus::WaitingDeviceAck
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: ClientStatus,
    pub errored: bool,
    pub last_error: ErrorCode,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: ClientStatus::StartingUp,
            errored: false,
            last_error: ErrorCode::Clear,
        }
    }
}

pub struct StatusMachine {
    tx: watch::Sender<StatusSnapshot>,
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusSnapshot::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    /// Checks `guard` and applies `apply` atomically; returns whether it applied
    pub fn transition_if(
        &self,
        guard: impl FnOnce(&StatusSnapshot) -> bool,
        apply: impl FnOnce(&mut StatusSnapshot),
    ) -> bool {
        self.tx.send_if_modified(|snapshot| {
            if guard(snapshot) {
                apply(snapshot);
                true
            } else {
                false
            }
        })
    }

    /// Starts an operation: requires a clear error flag and one of `allowed`
    pub fn try_begin(&self, allowed: &[ClientStatus], next: ClientStatus) -> bool {
        self.transition_if(
            |s| !s.errored && allowed.contains(&s.status),
            |s| s.status = next,
        )
    }

    /// Moves from one of `from` to `to`; no-op if the phase changed meanwhile
    pub fn advance(&self, from: &[ClientStatus], to: ClientStatus) -> bool {
        self.transition_if(|s| from.contains(&s.status), |s| s.status = to)
    }

    /// Unconditionally sets the phase
    pub fn set_status(&self, status: ClientStatus) {
        self.tx.send_modify(|s| s.status = status);
    }

    /// Records a sticky error, leaving the phase as it is
    ///
    /// Ignored once the client is disconnected, so a late failure from an
    /// interrupted flow does not mask `NoServerConnection`.
    pub fn fail(&self, code: ErrorCode) -> bool {
        self.transition_if(
            |s| s.status != ClientStatus::NoServerConn,
            |s| {
                s.errored = true;
                s.last_error = code;
            },
        )
    }

    /// Records a sticky error and returns to `Idle` (clean NACK)
    pub fn fail_to_idle(&self, code: ErrorCode) -> bool {
        self.transition_if(
            |s| s.status != ClientStatus::NoServerConn,
            |s| {
                s.errored = true;
                s.last_error = code;
                s.status = ClientStatus::Idle;
            },
        )
    }

    /// Marks the connection as gone
    pub fn disconnected(&self) {
        self.tx.send_modify(|s| {
            s.status = ClientStatus::NoServerConn;
            s.errored = true;
            s.last_error = ErrorCode::NoServerConnection;
        });
    }

    /// Fresh login: back to `StartingUp` with the error cleared
    pub fn logged_in(&self) {
        self.tx.send_modify(|s| {
            s.status = ClientStatus::StartingUp;
            s.errored = false;
            s.last_error = ErrorCode::Clear;
        });
    }

    /// Clears the sticky error; refused before a connection exists
    ///
    /// With `reset_to_idle` the phase also returns to `Idle`, which callers
    /// only request when no flow is still running.
    pub fn clear_error(&self, reset_to_idle: bool) -> bool {
        self.transition_if(
            |s| !matches!(s.status, ClientStatus::StartingUp | ClientStatus::NoServerConn),
            |s| {
                s.errored = false;
                s.last_error = ErrorCode::Clear;
                if reset_to_idle {
                    s.status = ClientStatus::Idle;
                }
            },
        )
    }

    /// Waits until `predicate` holds, up to `timeout`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&StatusSnapshot) -> bool,
        timeout: Duration,
    ) -> Option<StatusSnapshot> {
        let mut rx = self.tx.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Some(*snapshot),
            _ => None,
        };
        result
    }
}
