// btleplug-backed BLE transport
//
// CoreBluetooth on macOS, BlueZ on Linux, WinRT on Windows. Scanning is
// event driven: peripherals already known to the adapter are checked first,
// then DeviceDiscovered/DeviceUpdated events until the scan timeout.

use async_trait::async_trait;
use blebridge_core::transport::DisconnectCallback;
use blebridge_core::{
    BleTransport, CharacteristicId, ConnectionHandle, DeviceRef, DeviceSelector, LinkError,
    NotificationCallback,
};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SharedDisconnectCallback = Arc<dyn Fn(ConnectionHandle) + Send + Sync>;

struct Connection {
    handle: ConnectionHandle,
    peripheral: Peripheral,
    pumps: Vec<JoinHandle<()>>,
}

impl Connection {
    fn stop_pumps(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

type Connections = Arc<Mutex<HashMap<u64, Connection>>>;

pub struct BtleplugTransport {
    adapter: Adapter,
    /// Peripherals seen by scans, keyed by platform id
    discovered: Mutex<HashMap<String, Peripheral>>,
    connections: Connections,
    next_handle_id: AtomicU64,
    on_disconnected: Arc<Mutex<Option<SharedDisconnectCallback>>>,
    watcher: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start watching for link loss
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::AdapterUnavailable("no Bluetooth adapter found".to_string()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }

        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let on_disconnected: Arc<Mutex<Option<SharedDisconnectCallback>>> =
            Arc::new(Mutex::new(None));

        let mut events = adapter
            .events()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        let watcher = {
            let connections = connections.clone();
            let on_disconnected = on_disconnected.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        handle_link_loss(&connections, &on_disconnected, &id);
                    }
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            discovered: Mutex::new(HashMap::new()),
            connections,
            next_handle_id: AtomicU64::new(1),
            on_disconnected,
            watcher,
        })
    }

    async fn describe(peripheral: &Peripheral) -> Option<DeviceRef> {
        let properties = peripheral.properties().await.ok()??;
        Some(DeviceRef {
            id: peripheral.id().to_string(),
            name: properties.local_name,
            address: properties.address.to_string(),
        })
    }

    async fn check(
        &self,
        peripheral: Peripheral,
        selector: &DeviceSelector,
        use_platform_address: bool,
    ) -> Option<DeviceRef> {
        let device = Self::describe(&peripheral).await?;
        if !selector.matches(&device, use_platform_address) {
            return None;
        }
        self.discovered.lock().insert(device.id.clone(), peripheral);
        Some(device)
    }

    fn connection(&self, handle: &ConnectionHandle) -> Result<Peripheral, LinkError> {
        self.connections
            .lock()
            .get(&handle.id)
            .map(|c| c.peripheral.clone())
            .ok_or(LinkError::NotConnected)
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.watcher.abort();
        for connection in self.connections.lock().values_mut() {
            connection.stop_pumps();
        }
    }
}

fn handle_link_loss(
    connections: &Connections,
    on_disconnected: &Mutex<Option<SharedDisconnectCallback>>,
    id: &PeripheralId,
) {
    let lost: Vec<ConnectionHandle> = {
        let mut connections = connections.lock();
        let ids: Vec<u64> = connections
            .iter()
            .filter(|(_, c)| c.peripheral.id() == *id)
            .map(|(handle_id, _)| *handle_id)
            .collect();
        ids.into_iter()
            .filter_map(|handle_id| connections.remove(&handle_id))
            .map(|mut c| {
                c.stop_pumps();
                c.handle
            })
            .collect()
    };

    if lost.is_empty() {
        return;
    }
    let callback = on_disconnected.lock().clone();
    for handle in lost {
        warn!("Peripheral {} disconnected", handle.device);
        if let Some(callback) = &callback {
            callback(handle);
        }
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    characteristic: CharacteristicId,
) -> Result<Characteristic, LinkError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic.uuid())
        .ok_or(LinkError::CharacteristicNotFound(characteristic))
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn scan_for_device(
        &self,
        selector: &DeviceSelector,
        timeout: Duration,
        use_platform_address: bool,
    ) -> Result<Option<DeviceRef>, LinkError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        debug!("Scanning for {}", selector);

        let scan = async {
            let known = self
                .adapter
                .peripherals()
                .await
                .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
            for peripheral in known {
                if let Some(device) = self.check(peripheral, selector, use_platform_address).await {
                    return Ok(Some(device));
                }
            }

            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    continue;
                };
                if let Some(device) = self.check(peripheral, selector, use_platform_address).await {
                    return Ok(Some(device));
                }
            }
            Ok(None)
        };

        let result = match tokio::time::timeout(timeout, scan).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        };
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }
        result
    }

    async fn connect(&self, device: &DeviceRef) -> Result<ConnectionHandle, LinkError> {
        let peripheral = self
            .discovered
            .lock()
            .get(&device.id)
            .cloned()
            .ok_or_else(|| LinkError::DeviceNotFound(device.to_string()))?;

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::ConnectFailed(format!("{}: {}", device, e)))?;
        if let Err(e) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(LinkError::ConnectFailed(format!(
                "{}: service discovery failed: {}",
                device, e
            )));
        }

        let handle = ConnectionHandle {
            id: self.next_handle_id.fetch_add(1, Ordering::Relaxed),
            device: device.clone(),
        };
        self.connections.lock().insert(
            handle.id,
            Connection {
                handle: handle.clone(),
                peripheral,
                pumps: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        characteristic: CharacteristicId,
        callback: NotificationCallback,
    ) -> Result<(), LinkError> {
        let peripheral = self.connection(handle)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        if !target
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(LinkError::SubscribeFailed(format!(
                "{} does not support notifications",
                characteristic
            )));
        }

        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| LinkError::SubscribeFailed(e.to_string()))?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| LinkError::SubscribeFailed(e.to_string()))?;

        let uuid = target.uuid;
        let pump = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == uuid {
                    callback(characteristic, notification.value);
                }
            }
        });

        match self.connections.lock().get_mut(&handle.id) {
            Some(connection) => connection.pumps.push(pump),
            None => pump.abort(),
        }
        Ok(())
    }

    async fn write(
        &self,
        handle: &ConnectionHandle,
        characteristic: CharacteristicId,
        data: &[u8],
    ) -> Result<(), LinkError> {
        let peripheral = self.connection(handle)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), LinkError> {
        let connection = self.connections.lock().remove(&handle.id);
        let Some(mut connection) = connection else {
            return Ok(());
        };
        connection.stop_pumps();
        connection
            .peripheral
            .disconnect()
            .await
            .map_err(|e| LinkError::ConnectFailed(format!("disconnect: {}", e)))
    }

    fn set_on_disconnected(&self, callback: DisconnectCallback) {
        *self.on_disconnected.lock() = Some(Arc::from(callback));
    }
}
