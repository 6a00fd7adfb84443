//! Tracking of in-flight client flows
//!
//! Each public operation runs as a detached tokio task. The supervisor counts
//! running flows per kind so a disconnect can wait for them to settle and so
//! `clear_error` knows whether it may reset the phase. A flow holds a
//! [`FlowGuard`] for its whole lifetime; dropping the guard (normal return,
//! early return or task abort) releases the slot and wakes waiters.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Connect,
    SelectMcu,
    FetchInfo,
    Movement,
    Disconnect,
}

#[derive(Default)]
pub struct FlowSupervisor {
    running: Mutex<HashMap<FlowKind, usize>>,
    settled: Notify,
}

/// Slot held by one running flow
pub struct FlowGuard {
    supervisor: Arc<FlowSupervisor>,
    kind: FlowKind,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        let mut running = self.supervisor.running.lock();
        if let Some(count) = running.get_mut(&self.kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(&self.kind);
            }
        }
        drop(running);

        debug!("{:?} flow finished", self.kind);
        self.supervisor.settled.notify_waiters();
    }
}

impl FlowSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a flow of `kind`, always succeeding
    pub fn claim(self: &Arc<Self>, kind: FlowKind) -> FlowGuard {
        *self.running.lock().entry(kind).or_insert(0) += 1;
        FlowGuard {
            supervisor: Arc::clone(self),
            kind,
        }
    }

    /// Registers a flow of `kind` unless any of `exclusive` is already running
    pub fn try_claim(self: &Arc<Self>, kind: FlowKind, exclusive: &[FlowKind]) -> Option<FlowGuard> {
        let mut running = self.running.lock();
        if exclusive.iter().any(|k| running.contains_key(k)) {
            return None;
        }
        *running.entry(kind).or_insert(0) += 1;
        drop(running);

        Some(FlowGuard {
            supervisor: Arc::clone(self),
            kind,
        })
    }

    /// Runs `flow` on `handle`, releasing `guard` when it completes
    pub fn spawn<F>(&self, handle: &Handle, guard: FlowGuard, flow: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("{:?} flow started", guard.kind);
        handle.spawn(async move {
            let _guard = guard;
            flow.await;
        })
    }

    pub fn is_running(&self, kind: FlowKind) -> bool {
        self.running.lock().contains_key(&kind)
    }

    /// Whether any flow other than the listed ones is running
    pub fn any_running_except(&self, ignore: &[FlowKind]) -> bool {
        self.running.lock().keys().any(|k| !ignore.contains(k))
    }

    pub fn any_running(&self) -> bool {
        !self.running.lock().is_empty()
    }

    /// Waits until only the `ignore`d kinds (if any) are still running
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_settled(&self, ignore: &[FlowKind], timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !self.any_running_except(ignore) {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
