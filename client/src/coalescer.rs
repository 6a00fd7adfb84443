//! Movement coalescing
//!
//! Movement requests can arrive far faster than the server round-trip. They
//! are merged into a pending buffer indexed by servo id, holding the encoded
//! (+1) position or 0 for "no update". A single drain loop repeatedly takes a
//! snapshot of that buffer, hands it to the wire, and loops while new requests
//! arrived in the meantime. The latest position per servo wins; a request made
//! while a send is in flight is carried by the next iteration.
//!
//! `current` mirrors what the device has confirmed. It is written only by an
//! info fetch and by a completed drain iteration.

use crate::error::ClientError;
use crate::status::{ClientStatus, StatusMachine};
use log::debug;
use parking_lot::Mutex;
use servolink_shared::ServoCommand;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

const DRAINING: [ClientStatus; 2] = [ClientStatus::WaitingServerAck, ClientStatus::WaitingDeviceAck];

#[derive(Default)]
pub struct MovementCoalescer {
    pending: Mutex<Vec<u8>>,
    pending_flag: AtomicBool,
    current: Mutex<Vec<u8>>,
}

impl MovementCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh servo table from an info fetch
    ///
    /// Pending updates are discarded and the buffer is resized to match.
    pub fn reset(&self, positions: Vec<u8>) {
        let servo_count = positions.len();
        *self.current.lock() = positions;
        *self.pending.lock() = vec![0; servo_count];
        self.pending_flag.store(false, Ordering::SeqCst);
    }

    pub fn servo_count(&self) -> usize {
        self.current.lock().len()
    }

    /// Validates and merges a batch of commands into the pending buffer
    ///
    /// The whole batch is rejected on the first invalid command; nothing is
    /// merged in that case.
    pub fn submit(&self, commands: &[ServoCommand]) -> Result<(), ClientError> {
        let mut pending = self.pending.lock();
        let servo_count = pending.len();

        for cmd in commands {
            if cmd.servo_id as usize >= servo_count {
                return Err(ClientError::InvalidServoId {
                    servo_id: cmd.servo_id,
                    servo_count,
                });
            }
            if !cmd.position_in_range() {
                return Err(ClientError::InvalidServoPosition {
                    servo_id: cmd.servo_id,
                    position: cmd.servo_position,
                });
            }
        }

        for cmd in commands {
            pending[cmd.servo_id as usize] = cmd.encoded_position();
        }
        drop(pending);

        self.pending_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending_flag.load(Ordering::SeqCst)
    }

    /// Clears the pending flag and swaps the buffer out for an all-zero one
    ///
    /// Returns `None` when no servo has an update.
    pub fn take_snapshot(&self) -> Option<Vec<u8>> {
        self.pending_flag.store(false, Ordering::SeqCst);

        let mut pending = self.pending.lock();
        let servo_count = pending.len();
        let snapshot = std::mem::replace(&mut *pending, vec![0; servo_count]);
        drop(pending);

        snapshot.iter().any(|p| *p != 0).then_some(snapshot)
    }

    /// Merges a delivered snapshot into the confirmed positions
    pub fn commit(&self, snapshot: &[u8]) {
        let mut current = self.current.lock();
        for (slot, &position) in current.iter_mut().zip(snapshot) {
            if position != 0 {
                *slot = position;
            }
        }
    }

    /// Confirmed positions in user-facing units, one entry per servo
    pub fn current_positions(&self) -> Vec<ServoCommand> {
        self.current
            .lock()
            .iter()
            .enumerate()
            .map(|(servo_id, &encoded)| ServoCommand::from_encoded(servo_id as u8, encoded))
            .collect()
    }

    /// Confirmed positions with the +1 offset kept (index = servo id)
    pub fn raw_positions(&self) -> Vec<u8> {
        self.current.lock().clone()
    }

    /// Runs the drain loop until the buffer stays empty for a full iteration
    ///
    /// The caller has already moved the status into `WaitingServerAck`.
    /// `deliver` sends one snapshot and waits for both acknowledgements,
    /// returning `false` if the iteration failed (it records the failure
    /// itself). The loop also stops if the status leaves the draining phases,
    /// which happens when the client is disconnected.
    pub async fn drain<F, Fut>(&self, status: &StatusMachine, mut deliver: F)
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            if !status.advance(&DRAINING, ClientStatus::WaitingServerAck) {
                debug!("Drain loop stopped: client left the draining phase");
                return;
            }

            if let Some(snapshot) = self.take_snapshot() {
                if !deliver(snapshot.clone()).await {
                    return;
                }
                self.commit(&snapshot);
            }

            // Exit only if nothing arrived; decided under the status lock so a
            // concurrent submit either sees Idle or leaves the flag for us.
            let finished = status.transition_if(
                |s| s.status.is_draining() && !self.has_pending(),
                |s| s.status = ClientStatus::Idle,
            );
            if finished || !status.snapshot().status.is_draining() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn coalescer_with(servo_count: usize) -> MovementCoalescer {
        let coalescer = MovementCoalescer::new();
        coalescer.reset(vec![91; servo_count]);
        coalescer
    }

    fn draining_status() -> StatusMachine {
        let status = StatusMachine::new();
        status.set_status(ClientStatus::WaitingServerAck);
        status
    }

    #[test]
    fn test_submit_encodes_offset() {
        let coalescer = coalescer_with(2);
        coalescer.submit(&[ServoCommand::new(0, 45)]).unwrap();

        assert!(coalescer.has_pending());
        assert_eq!(coalescer.take_snapshot(), Some(vec![46, 0]));
        assert!(!coalescer.has_pending());
    }

    #[test]
    fn test_submit_rejects_whole_batch() {
        let coalescer = coalescer_with(2);
        let result = coalescer.submit(&[ServoCommand::new(0, 10), ServoCommand::new(2, 10)]);

        assert!(matches!(
            result,
            Err(ClientError::InvalidServoId {
                servo_id: 2,
                servo_count: 2
            })
        ));
        assert!(!coalescer.has_pending());
        assert_eq!(coalescer.take_snapshot(), None);
    }

    #[test]
    fn test_submit_rejects_position() {
        let coalescer = coalescer_with(2);
        let result = coalescer.submit(&[ServoCommand::new(1, 180)]);

        assert!(matches!(
            result,
            Err(ClientError::InvalidServoPosition {
                servo_id: 1,
                position: 180
            })
        ));
        assert_eq!(coalescer.take_snapshot(), None);
    }

    #[test]
    fn test_submit_before_info_fetch() {
        let coalescer = MovementCoalescer::new();
        let result = coalescer.submit(&[ServoCommand::new(0, 10)]);
        assert!(matches!(result, Err(ClientError::InvalidServoId { .. })));
    }

    #[test]
    fn test_latest_submit_wins() {
        let coalescer = coalescer_with(3);
        coalescer.submit(&[ServoCommand::new(1, 10)]).unwrap();
        coalescer
            .submit(&[ServoCommand::new(1, 20), ServoCommand::new(2, 30)])
            .unwrap();

        assert_eq!(coalescer.take_snapshot(), Some(vec![0, 21, 31]));
    }

    #[test]
    fn test_commit_only_touches_updated_servos() {
        let coalescer = coalescer_with(3);
        coalescer.commit(&[0, 46, 0]);

        assert_eq!(coalescer.raw_positions(), vec![91, 46, 91]);
        assert_eq!(
            coalescer.current_positions(),
            vec![
                ServoCommand::new(0, 90),
                ServoCommand::new(1, 45),
                ServoCommand::new(2, 90)
            ]
        );
    }

    #[test]
    fn test_reset_discards_pending() {
        let coalescer = coalescer_with(2);
        coalescer.submit(&[ServoCommand::new(0, 45)]).unwrap();
        coalescer.reset(vec![1, 2, 3]);

        assert!(!coalescer.has_pending());
        assert_eq!(coalescer.servo_count(), 3);
        assert_eq!(coalescer.take_snapshot(), None);
    }

    #[tokio::test]
    async fn test_drain_single_iteration() {
        let coalescer = coalescer_with(2);
        let status = draining_status();
        coalescer.submit(&[ServoCommand::new(0, 45)]).unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        coalescer
            .drain(&status, |snapshot| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(snapshot);
                    true
                }
            })
            .await;

        assert_eq!(*sent.lock(), vec![vec![46, 0]]);
        assert_eq!(coalescer.current_positions()[0].servo_position, 45);
        assert_eq!(status.snapshot().status, ClientStatus::Idle);
    }

    #[tokio::test]
    async fn test_drain_picks_up_submit_during_send() {
        let coalescer = Arc::new(coalescer_with(2));
        let status = draining_status();
        coalescer.submit(&[ServoCommand::new(0, 10)]).unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let inner = Arc::clone(&coalescer);
        coalescer
            .drain(&status, |snapshot| {
                let log = Arc::clone(&log);
                let inner = Arc::clone(&inner);
                async move {
                    let first = log.lock().is_empty();
                    log.lock().push(snapshot);
                    if first {
                        // Two bursts land while the first send is in flight
                        inner.submit(&[ServoCommand::new(1, 50)]).unwrap();
                        inner.submit(&[ServoCommand::new(1, 60)]).unwrap();
                    }
                    true
                }
            })
            .await;

        assert_eq!(*sent.lock(), vec![vec![11, 0], vec![0, 61]]);
        assert_eq!(coalescer.raw_positions(), vec![11, 61]);
        assert_eq!(status.snapshot().status, ClientStatus::Idle);
    }

    #[tokio::test]
    async fn test_drain_failure_leaves_positions() {
        let coalescer = coalescer_with(2);
        let status = draining_status();
        coalescer.submit(&[ServoCommand::new(0, 45)]).unwrap();

        coalescer.drain(&status, |_| async { false }).await;

        assert_eq!(coalescer.raw_positions(), vec![91, 91]);
    }

    #[tokio::test]
    async fn test_drain_stops_when_disconnected() {
        let coalescer = coalescer_with(2);
        let status = StatusMachine::new();
        status.disconnected();
        coalescer.submit(&[ServoCommand::new(0, 45)]).unwrap();

        let mut calls = 0;
        coalescer
            .drain(&status, |_| {
                calls += 1;
                async { true }
            })
            .await;

        assert_eq!(calls, 0);
        assert_eq!(status.snapshot().status, ClientStatus::NoServerConn);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use servolink_shared::{MAX_SERVOS, MAX_SERVO_POSITION};

        proptest! {
            /// An accepted command ends up in the confirmed table once delivered
            #[test]
            fn delivered_position_is_confirmed(
                servo_count in 1usize..=MAX_SERVOS,
                servo_id in 0u8..MAX_SERVOS as u8,
                position in 0u8..=MAX_SERVO_POSITION,
            ) {
                prop_assume!((servo_id as usize) < servo_count);
                let coalescer = coalescer_with(servo_count);

                coalescer.submit(&[ServoCommand::new(servo_id, position)]).unwrap();
                let snapshot = coalescer.take_snapshot().unwrap();
                coalescer.commit(&snapshot);

                prop_assert_eq!(
                    coalescer.current_positions()[servo_id as usize],
                    ServoCommand::new(servo_id, position)
                );
            }

            /// A batch with any invalid command leaves both tables untouched
            #[test]
            fn rejected_batch_changes_nothing(
                servo_count in 1usize..=8,
                valid in prop::collection::vec((0u8..8, 0u8..=MAX_SERVO_POSITION), 0..4),
                bad_id in any::<bool>(),
                bad_value in 180u8..=255,
            ) {
                let coalescer = coalescer_with(servo_count);
                let mut batch: Vec<ServoCommand> = valid
                    .into_iter()
                    .filter(|(id, _)| (*id as usize) < servo_count)
                    .map(ServoCommand::from)
                    .collect();
                batch.push(if bad_id {
                    ServoCommand::new(servo_count as u8, 10)
                } else {
                    ServoCommand::new(0, bad_value)
                });

                prop_assert!(coalescer.submit(&batch).is_err());
                prop_assert!(!coalescer.has_pending());
                prop_assert_eq!(coalescer.take_snapshot(), None);
                prop_assert_eq!(coalescer.raw_positions(), vec![91; servo_count]);
            }

            /// Only the last of two submissions for a servo is transmitted
            #[test]
            fn second_submit_wins(first in 0u8..=MAX_SERVO_POSITION, second in 0u8..=MAX_SERVO_POSITION) {
                let coalescer = coalescer_with(2);
                coalescer.submit(&[ServoCommand::new(1, first)]).unwrap();
                coalescer.submit(&[ServoCommand::new(1, second)]).unwrap();

                prop_assert_eq!(coalescer.take_snapshot(), Some(vec![0, second + 1]));
            }
        }
    }
}
