// Message module: bridge data model and the notification wire format

pub mod codec;
pub mod types;

pub use codec::{
    decode_notification, parse_sensor_reading, DecodeError, Decoded, DEFAULT_COMMAND_KEYWORD,
    SENSOR_FIELDS, SENSOR_FIELD_COUNT,
};
pub use types::{
    CharacteristicId, Command, CommandKind, InvalidCharacteristicId, RawNotification,
    SensorReading, BLINK_1S, BLINK_5S, BLUETOOTH_BASE_UUID,
};
