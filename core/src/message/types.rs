// Message types: what flows through the bridge channels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Bluetooth base UUID: 0000xxxx-0000-1000-8000-00805F9B34FB
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// Wire keyword for a one-second blink
pub const BLINK_1S: &str = "BLINK_1S";

/// Wire keyword for a five-second blink
pub const BLINK_5S: &str = "BLINK_5S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid characteristic id '{0}'")]
pub struct InvalidCharacteristicId(pub String);

/// GATT characteristic identifier (always stored as a full 128-bit UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacteristicId(Uuid);

impl CharacteristicId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Expand a 16- or 32-bit assigned number against the Bluetooth base UUID
    pub fn from_short(short: u32) -> Self {
        Self(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for CharacteristicId {
    type Err = InvalidCharacteristicId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if matches!(hex.len(), 4 | 8) {
            return u32::from_str_radix(hex, 16)
                .map(Self::from_short)
                .map_err(|_| InvalidCharacteristicId(s.to_string()));
        }

        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|_| InvalidCharacteristicId(s.to_string()))
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CharacteristicId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A characteristic value exactly as the transport delivered it
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub characteristic_id: CharacteristicId,
    pub payload: Vec<u8>,
    pub received_at: SystemTime,
}

impl RawNotification {
    pub fn new(characteristic_id: CharacteristicId, payload: Vec<u8>) -> Self {
        Self {
            characteristic_id,
            payload,
            received_at: SystemTime::now(),
        }
    }
}

/// One IMU sample: gyroscope then accelerometer, three axes each.
///
/// Only ever constructed with all six fields present; there is no partial
/// reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub source_timestamp: SystemTime,
}

/// What the LED characteristic should do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Blink1s,
    Blink5s,
    /// Control text forwarded verbatim
    Custom(String),
}

impl CommandKind {
    /// Map control text onto a known kind, falling back to `Custom`
    pub fn from_keyword(text: &str) -> Self {
        match text {
            BLINK_1S => CommandKind::Blink1s,
            BLINK_5S => CommandKind::Blink5s,
            other => CommandKind::Custom(other.to_string()),
        }
    }

    pub fn as_wire_str(&self) -> &str {
        match self {
            CommandKind::Blink1s => BLINK_1S,
            CommandKind::Blink5s => BLINK_5S,
            CommandKind::Custom(text) => text,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// Outbound command for the control characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub issued_at: SystemTime,
}

impl Command {
    pub fn new(kind: CommandKind, issued_at: SystemTime) -> Self {
        Self { kind, issued_at }
    }

    /// Bytes written to the control characteristic
    pub fn to_bytes(&self) -> Vec<u8> {
        self.kind.as_wire_str().as_bytes().to_vec()
    }
}
