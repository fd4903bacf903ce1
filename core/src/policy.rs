// Decision engine: sensor reading in, LED command out

use crate::message::{Command, CommandKind, SensorReading};

/// Default `gx` threshold
pub const DEFAULT_THRESHOLD: f64 = 0.50;

/// Maps a reading to the command sent back to the peripheral.
/// Implementations must be pure: no I/O, same input gives same output.
#[cfg_attr(test, mockall::automock)]
pub trait DecisionPolicy: Send + Sync {
    fn decide(&self, reading: &SensorReading) -> Command;
}

/// `gx > threshold` blinks for one second, anything else for five
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub threshold: f64,
}

impl ThresholdPolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl DecisionPolicy for ThresholdPolicy {
    fn decide(&self, reading: &SensorReading) -> Command {
        let kind = if reading.gx > self.threshold {
            CommandKind::Blink1s
        } else {
            CommandKind::Blink5s
        };
        Command::new(kind, reading.source_timestamp)
    }
}

/// Apply the default threshold policy
pub fn decide(reading: &SensorReading) -> Command {
    ThresholdPolicy::default().decide(reading)
}
