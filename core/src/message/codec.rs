// Notification codec: UTF-8 text in, reading or control command out

use super::types::{Command, CommandKind, SensorReading};
use std::time::SystemTime;
use thiserror::Error;

/// Number of comma-separated fields in an IMU sample
pub const SENSOR_FIELD_COUNT: usize = 6;

/// Field names in wire order
pub const SENSOR_FIELDS: [&str; SENSOR_FIELD_COUNT] = ["gx", "gy", "gz", "ax", "ay", "az"];

/// Default substring marking a payload as a control message
pub const DEFAULT_COMMAND_KEYWORD: &str = "BLINK";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("Payload is empty")]
    Empty,
    #[error("Expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("Field {field} is not a number: '{token}'")]
    InvalidNumber { field: &'static str, token: String },
    #[error("Field {field} is not finite")]
    NonFinite { field: &'static str },
}

/// A successfully decoded notification
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Reading(SensorReading),
    Control(Command),
}

/// Decode one notification payload.
///
/// Trailing NUL padding and surrounding whitespace are ignored. Text that
/// contains `command_keyword` is a control message; anything else must be
/// exactly six finite floats.
pub fn decode_notification(
    payload: &[u8],
    command_keyword: &str,
    received_at: SystemTime,
) -> Result<Decoded, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
    let text = text.trim_end_matches('\0').trim();

    if text.is_empty() {
        return Err(DecodeError::Empty);
    }

    if !command_keyword.is_empty() && text.contains(command_keyword) {
        return Ok(Decoded::Control(Command::new(
            CommandKind::from_keyword(text),
            received_at,
        )));
    }

    parse_sensor_reading(text, received_at).map(Decoded::Reading)
}

/// Parse `gx,gy,gz,ax,ay,az`. All six or nothing.
pub fn parse_sensor_reading(
    text: &str,
    source_timestamp: SystemTime,
) -> Result<SensorReading, DecodeError> {
    let tokens: Vec<&str> = text.split(',').collect();
    if tokens.len() != SENSOR_FIELD_COUNT {
        return Err(DecodeError::FieldCount {
            expected: SENSOR_FIELD_COUNT,
            found: tokens.len(),
        });
    }

    let mut values = [0f64; SENSOR_FIELD_COUNT];
    for (i, token) in tokens.iter().enumerate() {
        let field = SENSOR_FIELDS[i];
        let token = token.trim();
        let value: f64 = token.parse().map_err(|_| DecodeError::InvalidNumber {
            field,
            token: token.to_string(),
        })?;
        if !value.is_finite() {
            return Err(DecodeError::NonFinite { field });
        }
        values[i] = value;
    }

    let [gx, gy, gz, ax, ay, az] = values;
    Ok(SensorReading {
        gx,
        gy,
        gz,
        ax,
        ay,
        az,
        source_timestamp,
    })
}
