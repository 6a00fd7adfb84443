//! # Servolink shared protocol types
//!
//! Everything both ends of the servo server protocol agree on: the wire
//! codec, the error and NACK code taxonomy, and the servo command value type.
//! The client driver and the simulated server depend on this crate and on
//! nothing of each other.

pub mod codec;
pub mod error;

use serde::{Deserialize, Serialize};

pub use codec::{Frame, InfoFrame, Query};
pub use error::{DecodeError, ErrorCode, NackReason};

/// Highest servo count an MCU can report; servo ids are `0..MAX_SERVOS`
pub const MAX_SERVOS: usize = 32;
/// Highest user-facing servo position (degrees)
pub const MAX_SERVO_POSITION: u8 = 179;

pub const DEFAULT_PORT: u16 = 54817;
pub const DEFAULT_HOST: &str = "192.168.137.1";
pub const DEFAULT_MCU_NAME: &str = "smartMCU";

/// A requested position for one servo, in user-facing units
///
/// Positions are `0..=179`. Internally the client stores `position + 1` so that
/// zero can mean "no update pending"; use [`ServoCommand::encoded_position`]
/// and [`ServoCommand::from_encoded`] to cross that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServoCommand {
    pub servo_id: u8,
    pub servo_position: u8,
}

impl ServoCommand {
    pub fn new(servo_id: u8, servo_position: u8) -> Self {
        Self {
            servo_id,
            servo_position,
        }
    }

    /// Position with the +1 offset applied
    pub fn encoded_position(&self) -> u8 {
        self.servo_position.saturating_add(1)
    }

    /// Builds a command from a stored (+1 offset) position
    ///
    /// A stored zero has never been set; it is reported as position 0.
    pub fn from_encoded(servo_id: u8, encoded: u8) -> Self {
        Self::new(servo_id, encoded.saturating_sub(1))
    }

    pub fn position_in_range(&self) -> bool {
        self.servo_position <= MAX_SERVO_POSITION
    }
}

impl From<(u8, u8)> for ServoCommand {
    fn from((servo_id, servo_position): (u8, u8)) -> Self {
        Self::new(servo_id, servo_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servo_command_creation() {
        let cmd = ServoCommand::new(3, 90);
        assert_eq!(cmd.servo_id, 3);
        assert_eq!(cmd.servo_position, 90);
        assert!(cmd.position_in_range());
    }

    #[test]
    fn test_encoded_position_offset() {
        assert_eq!(ServoCommand::new(0, 0).encoded_position(), 1);
        assert_eq!(ServoCommand::new(0, 179).encoded_position(), 180);
        assert_eq!(ServoCommand::from_encoded(1, 46), ServoCommand::new(1, 45));
    }

    #[test]
    fn test_from_encoded_unset() {
        assert_eq!(ServoCommand::from_encoded(2, 0).servo_position, 0);
    }

    #[test]
    fn test_position_out_of_range() {
        assert!(!ServoCommand::new(0, 180).position_in_range());
        assert!(!ServoCommand::new(0, 255).position_in_range());
    }

    #[test]
    fn test_from_tuple() {
        let cmd: ServoCommand = (1, 45).into();
        assert_eq!(cmd, ServoCommand::new(1, 45));
    }
}
