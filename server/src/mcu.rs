//! Simulated microcontrollers behind the server
//!
//! Each MCU owns a servo table in wire units (position + 1). The registry is
//! shared by every connection; connections only remember which MCU they
//! selected by name.

use servolink_shared::{ServoCommand, MAX_SERVOS};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Initial user-facing position of every simulated servo
pub const HOME_POSITION: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMcu {
    pub name: String,
    pub online: bool,
    positions: Vec<u8>,
}

impl SimMcu {
    pub fn new(name: impl Into<String>, servo_count: usize) -> Self {
        let servo_count = servo_count.min(MAX_SERVOS);
        Self {
            name: name.into(),
            online: true,
            positions: vec![HOME_POSITION + 1; servo_count],
        }
    }

    pub fn servo_count(&self) -> usize {
        self.positions.len()
    }

    /// Servo table in wire units
    pub fn raw_positions(&self) -> &[u8] {
        &self.positions
    }

    pub fn positions(&self) -> Vec<ServoCommand> {
        self.positions
            .iter()
            .enumerate()
            .map(|(id, &raw)| ServoCommand::from_encoded(id as u8, raw))
            .collect()
    }

    /// Whether every command addresses a servo this MCU has
    pub fn accepts(&self, commands: &[ServoCommand]) -> bool {
        commands
            .iter()
            .all(|cmd| (cmd.servo_id as usize) < self.servo_count())
    }

    pub fn apply(&mut self, commands: &[ServoCommand]) {
        for cmd in commands {
            if let Some(slot) = self.positions.get_mut(cmd.servo_id as usize) {
                *slot = cmd.encoded_position();
            }
        }
    }
}

/// `name:servo_count` as given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuSpec {
    pub name: String,
    pub servo_count: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid MCU '{0}', expected name:servo_count (1-32)")]
pub struct McuSpecError(String);

impl FromStr for McuSpec {
    type Err = McuSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, count) = s.split_once(':').ok_or_else(|| McuSpecError(s.to_string()))?;
        let servo_count: usize = count.parse().map_err(|_| McuSpecError(s.to_string()))?;
        if name.is_empty() || servo_count == 0 || servo_count > MAX_SERVOS {
            return Err(McuSpecError(s.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            servo_count,
        })
    }
}

#[derive(Debug, Default)]
pub struct McuRegistry {
    mcus: HashMap<String, SimMcu>,
}

impl McuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[McuSpec]) -> Self {
        let mut registry = Self::new();
        for spec in specs {
            registry.insert(SimMcu::new(spec.name.clone(), spec.servo_count));
        }
        registry
    }

    pub fn insert(&mut self, mcu: SimMcu) {
        self.mcus.insert(mcu.name.clone(), mcu);
    }

    pub fn get(&self, name: &str) -> Option<&SimMcu> {
        self.mcus.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SimMcu> {
        self.mcus.get_mut(name)
    }

    /// Marks an MCU on- or offline; returns `false` if it does not exist
    pub fn set_online(&mut self, name: &str, online: bool) -> bool {
        match self.mcus.get_mut(name) {
            Some(mcu) => {
                mcu.online = online;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.mcus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mcus.is_empty()
    }
}
