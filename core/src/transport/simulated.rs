//! In-memory peripheral implementing `BleTransport`
//!
//! Lets the whole bridge run without a radio: tests inject notifications,
//! drop the link, make connects or writes fail, and inspect what was
//! written.

use super::{
    BleTransport, ConnectionHandle, DeviceRef, DeviceSelector, DisconnectCallback,
    NotificationCallback,
};
use crate::link::LinkError;
use crate::message::CharacteristicId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct SimState {
    devices: Vec<DeviceRef>,
    visible: bool,
    connected: Option<ConnectionHandle>,
    next_handle_id: u64,
    subscriptions: HashMap<CharacteristicId, NotificationCallback>,
    on_disconnected: Option<Arc<dyn Fn(ConnectionHandle) + Send + Sync>>,
    connect_failures_remaining: u32,
    write_failures_remaining: u32,
    fail_all_writes: bool,
    write_latency: Duration,
    scan_latency: Duration,
    connect_latency: Duration,
    /// Subscribes that succeed before every later one hangs forever
    subscribes_before_stall: Option<u32>,
    subscribe_count: u32,
    writes: Vec<(CharacteristicId, Vec<u8>)>,
    scan_count: usize,
    connect_count: usize,
    disconnect_count: usize,
}

/// Simulated BLE central with one or more fake peripherals
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    writes_in_flight: AtomicUsize,
    max_writes_in_flight: AtomicUsize,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                visible: true,
                next_handle_id: 1,
                ..SimState::default()
            }),
            writes_in_flight: AtomicUsize::new(0),
            max_writes_in_flight: AtomicUsize::new(0),
        }
    }

    /// Add an advertising peripheral
    pub fn with_device(self, name: &str, address: &str) -> Self {
        self.add_device(DeviceRef {
            id: format!("sim-{}", address.to_ascii_lowercase()),
            name: Some(name.to_string()),
            address: address.to_string(),
        });
        self
    }

    pub fn add_device(&self, device: DeviceRef) {
        self.state.lock().devices.push(device);
    }

    /// Out-of-range peripherals never show up in scans
    pub fn set_devices_visible(&self, visible: bool) {
        self.state.lock().visible = visible;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().connect_failures_remaining = count;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().write_failures_remaining = count;
    }

    pub fn set_fail_all_writes(&self, fail: bool) {
        self.state.lock().fail_all_writes = fail;
    }

    pub fn set_write_latency(&self, latency: Duration) {
        self.state.lock().write_latency = latency;
    }

    /// Scans take this long before answering (the scan timeout is ignored)
    pub fn set_scan_latency(&self, latency: Duration) {
        self.state.lock().scan_latency = latency;
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.lock().connect_latency = latency;
    }

    /// Let `count` more subscribes through, then hang every later one
    pub fn stall_subscribes_after(&self, count: u32) {
        let mut state = self.state.lock();
        state.subscribes_before_stall = Some(state.subscribe_count + count);
    }

    /// Deliver a notification as the peripheral would.
    /// Returns false when nothing is subscribed to `characteristic`.
    pub fn inject_notification(&self, characteristic: CharacteristicId, payload: &[u8]) -> bool {
        let callback = {
            let state = self.state.lock();
            if state.connected.is_none() {
                return false;
            }
            state.subscriptions.get(&characteristic).cloned()
        };

        match callback {
            Some(callback) => {
                callback(characteristic, payload.to_vec());
                true
            }
            None => false,
        }
    }

    /// Simulate the peripheral going away (out of range, power loss)
    pub fn drop_connection(&self) {
        let (handle, callback) = {
            let mut state = self.state.lock();
            state.subscriptions.clear();
            (state.connected.take(), state.on_disconnected.clone())
        };

        if let (Some(handle), Some(callback)) = (handle, callback) {
            callback(handle);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected.is_some()
    }

    pub fn writes(&self) -> Vec<(CharacteristicId, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Written values decoded as UTF-8
    pub fn written_text(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .map(|(_, data)| String::from_utf8_lossy(data).into_owned())
            .collect()
    }

    pub fn scan_count(&self) -> usize {
        self.state.lock().scan_count
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnect_count
    }

    /// Highest number of writes ever observed in flight at once
    pub fn max_writes_in_flight(&self) -> usize {
        self.max_writes_in_flight.load(Ordering::SeqCst)
    }

    fn check_handle(&self, handle: &ConnectionHandle) -> Result<(), LinkError> {
        match &self.state.lock().connected {
            Some(current) if current.id == handle.id => Ok(()),
            _ => Err(LinkError::NotConnected),
        }
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    async fn scan_for_device(
        &self,
        selector: &DeviceSelector,
        _timeout: Duration,
        use_platform_address: bool,
    ) -> Result<Option<DeviceRef>, LinkError> {
        let latency = {
            let mut state = self.state.lock();
            state.scan_count += 1;
            state.scan_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = self.state.lock();
        if !state.visible {
            return Ok(None);
        }
        Ok(state
            .devices
            .iter()
            .find(|d| selector.matches(d, use_platform_address))
            .cloned())
    }

    async fn connect(&self, device: &DeviceRef) -> Result<ConnectionHandle, LinkError> {
        let latency = {
            let mut state = self.state.lock();
            state.connect_count += 1;
            state.connect_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();

        if state.connect_failures_remaining > 0 {
            state.connect_failures_remaining -= 1;
            return Err(LinkError::ConnectFailed(format!(
                "simulated connect failure for {}",
                device
            )));
        }
        if !state.visible {
            return Err(LinkError::ConnectFailed(format!("{} out of range", device)));
        }

        let handle = ConnectionHandle {
            id: state.next_handle_id,
            device: device.clone(),
        };
        state.next_handle_id += 1;
        state.connected = Some(handle.clone());
        Ok(handle)
    }

    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        characteristic: CharacteristicId,
        callback: NotificationCallback,
    ) -> Result<(), LinkError> {
        self.check_handle(handle)?;
        let stalled = {
            let mut state = self.state.lock();
            state.subscribe_count += 1;
            matches!(state.subscribes_before_stall, Some(limit) if state.subscribe_count > limit)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        self.state
            .lock()
            .subscriptions
            .insert(characteristic, callback);
        Ok(())
    }

    async fn write(
        &self,
        handle: &ConnectionHandle,
        characteristic: CharacteristicId,
        data: &[u8],
    ) -> Result<(), LinkError> {
        self.check_handle(handle)?;

        let latency = {
            let mut state = self.state.lock();
            if state.fail_all_writes {
                return Err(LinkError::WriteFailed("simulated write failure".to_string()));
            }
            if state.write_failures_remaining > 0 {
                state.write_failures_remaining -= 1;
                return Err(LinkError::WriteFailed("simulated write failure".to_string()));
            }
            state.write_latency
        };

        let in_flight = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_writes_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.state.lock().writes.push((characteristic, data.to_vec()));
        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.disconnect_count += 1;
        if state.connected.as_ref().map(|h| h.id) == Some(handle.id) {
            state.connected = None;
            state.subscriptions.clear();
        }
        Ok(())
    }

    fn set_on_disconnected(&self, callback: DisconnectCallback) {
        self.state.lock().on_disconnected = Some(Arc::from(callback));
    }
}
