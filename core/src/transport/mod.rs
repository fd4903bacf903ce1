// Transport module: the BLE stack as seen by the bridge
//
// GATT/ATT, scanning and the radio itself live in the platform stack. The
// bridge reaches them only through `BleTransport`.

pub mod simulated;

use crate::link::LinkError;
use crate::message::CharacteristicId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use simulated::SimulatedTransport;

/// How the target peripheral is identified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// Advertised local name
    Name(String),
    /// Hardware address, or the platform peripheral id where addresses are hidden
    Address(String),
}

impl DeviceSelector {
    pub fn is_empty(&self) -> bool {
        match self {
            DeviceSelector::Name(name) => name.trim().is_empty(),
            DeviceSelector::Address(address) => address.trim().is_empty(),
        }
    }

    /// Does `device` satisfy this selector?
    ///
    /// With `use_platform_address` an address selector matches the hardware
    /// address only; otherwise the platform peripheral id is accepted too.
    pub fn matches(&self, device: &DeviceRef, use_platform_address: bool) -> bool {
        match self {
            DeviceSelector::Name(name) => device.name.as_deref() == Some(name.as_str()),
            DeviceSelector::Address(address) => {
                device.address.eq_ignore_ascii_case(address)
                    || (!use_platform_address && device.id.eq_ignore_ascii_case(address))
            }
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Name(name) => write!(f, "name '{}'", name),
            DeviceSelector::Address(address) => write!(f, "address '{}'", address),
        }
    }
}

/// A peripheral found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    /// Platform peripheral id (CoreBluetooth UUID, BlueZ path, ...)
    pub id: String,
    pub name: Option<String>,
    pub address: String,
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// An open connection. `id` is unique per connect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: u64,
    pub device: DeviceRef,
}

/// Invoked from the transport's own dispatch context for every notification.
/// Must return promptly and never block.
pub type NotificationCallback = Arc<dyn Fn(CharacteristicId, Vec<u8>) + Send + Sync>;

/// Invoked when the transport loses a connection it did not close itself
pub type DisconnectCallback = Box<dyn Fn(ConnectionHandle) + Send + Sync>;

/// Platform BLE central abstraction
///
/// Implemented by `SimulatedTransport` here and by the btleplug-backed
/// transport in the CLI.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Scan until a peripheral matches `selector` or `timeout` elapses
    async fn scan_for_device(
        &self,
        selector: &DeviceSelector,
        timeout: Duration,
        use_platform_address: bool,
    ) -> Result<Option<DeviceRef>, LinkError>;

    /// Connect and discover services
    async fn connect(&self, device: &DeviceRef) -> Result<ConnectionHandle, LinkError>;

    /// Enable notifications on `characteristic`, delivering them to `callback`
    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        characteristic: CharacteristicId,
        callback: NotificationCallback,
    ) -> Result<(), LinkError>;

    /// Write one value to `characteristic`
    async fn write(
        &self,
        handle: &ConnectionHandle,
        characteristic: CharacteristicId,
        data: &[u8],
    ) -> Result<(), LinkError>;

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), LinkError>;

    /// Register the callback for unexpected link loss
    fn set_on_disconnected(&self, callback: DisconnectCallback);
}
