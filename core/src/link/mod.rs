// Link manager: connection lifecycle for one peripheral
//
// Startup runs inline (connect, subscribe). After that the manager becomes a
// single tokio task that owns the connection handle, serializes writes
// through its mailbox and reconnects with backoff when the transport drops.

pub mod backoff;
pub mod state;

pub use backoff::ReconnectPolicy;
pub use state::LinkState;

use crate::config::BridgeSettings;
use crate::events::{BridgeEvent, BridgeMetrics, EventSender};
use crate::ingest::NotificationSink;
use crate::message::CharacteristicId;
use crate::transport::{BleTransport, ConnectionHandle, DeviceRef, DeviceSelector};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Pending requests the link task will buffer before callers wait
const MAILBOX_CAPACITY: usize = 16;

/// Slack on top of the scan timeout for transports that overrun it
const SCAN_TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(CharacteristicId),
    #[error("Not connected")]
    NotConnected,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("Link manager closed")]
    Closed,
}

impl LinkError {
    /// Can trying again change the outcome?
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LinkError::DeviceNotFound(_)
                | LinkError::CharacteristicNotFound(_)
                | LinkError::AdapterUnavailable(_)
                | LinkError::Closed
        )
    }
}

/// Requests served by the link task
#[derive(Debug)]
pub enum LinkCommand {
    Write {
        characteristic: CharacteristicId,
        data: Vec<u8>,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
}

/// Owns the connection to one peripheral
pub struct LinkManager {
    transport: Arc<dyn BleTransport>,
    selector: Option<DeviceSelector>,
    use_platform_address: bool,
    scan_timeout: Duration,
    connect_timeout: Duration,
    write_timeout: Duration,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<LinkState>,
    events: EventSender,
    metrics: Arc<BridgeMetrics>,
    handle: Option<ConnectionHandle>,
    subscription: Option<(CharacteristicId, NotificationSink)>,
    disconnect_rx: mpsc::UnboundedReceiver<ConnectionHandle>,
}

impl LinkManager {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        settings: &BridgeSettings,
        use_platform_address: bool,
        events: EventSender,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        transport.set_on_disconnected(Box::new(move |handle| {
            let _ = disconnect_tx.send(handle);
        }));

        let (state_tx, _) = watch::channel(LinkState::Disconnected);

        Self {
            transport,
            selector: None,
            use_platform_address,
            scan_timeout: settings.scan_timeout(),
            connect_timeout: settings.connect_timeout(),
            write_timeout: settings.write_timeout(),
            policy: ReconnectPolicy::from(settings.reconnect),
            state_tx,
            events,
            metrics,
            handle: None,
            subscription: None,
            disconnect_rx,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch every state change of this link
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: LinkState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("Unexpected link transition {} -> {}", current, next);
        }
        self.state_tx.send_replace(next);
        let _ = self.events.send(BridgeEvent::LinkStateChanged {
            from: current,
            to: next,
        });
    }

    /// Scan for the peripheral matching `selector` and connect to it.
    /// The selector is kept for later reconnects.
    pub async fn connect(&mut self, selector: &DeviceSelector) -> Result<ConnectionHandle, LinkError> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        self.selector = Some(selector.clone());

        self.set_state(LinkState::Scanning);
        debug!("Scanning for {} (timeout {:?})", selector, self.scan_timeout);
        let device = match self.scan(selector).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                self.set_state(LinkState::Disconnected);
                return Err(LinkError::DeviceNotFound(selector.to_string()));
            }
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };

        self.set_state(LinkState::Connecting);
        match timeout(self.connect_timeout, self.transport.connect(&device)).await {
            Ok(Ok(handle)) => {
                info!("Connected to {}", device);
                self.handle = Some(handle.clone());
                self.set_state(LinkState::Connected);
                Ok(handle)
            }
            Ok(Err(e)) => {
                self.set_state(LinkState::Disconnected);
                Err(e)
            }
            Err(_) => {
                self.set_state(LinkState::Disconnected);
                Err(LinkError::Timeout(format!(
                    "connect to {} after {:?}",
                    device, self.connect_timeout
                )))
            }
        }
    }

    /// Scan bounded by the scan timeout even if the transport ignores it
    async fn scan(&self, selector: &DeviceSelector) -> Result<Option<DeviceRef>, LinkError> {
        let limit = self.scan_timeout + SCAN_TIMEOUT_MARGIN;
        timeout(
            limit,
            self.transport
                .scan_for_device(selector, self.scan_timeout, self.use_platform_address),
        )
        .await
        .map_err(|_| LinkError::Timeout(format!("scan for {} after {:?}", selector, limit)))?
    }

    /// Startup connect. Transient failures are retried for one backoff
    /// window; a peripheral that is not advertising fails immediately.
    pub async fn establish(
        &mut self,
        selector: &DeviceSelector,
    ) -> Result<ConnectionHandle, LinkError> {
        let mut attempts = 0;
        loop {
            match self.connect(selector).await {
                Ok(handle) => return Ok(handle),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempts += 1;
                    if !self.policy.should_retry(attempts) {
                        return Err(e);
                    }
                    let delay = self.policy.delay(attempts - 1);
                    warn!(
                        "Connect attempt {} to {} failed: {}; retrying in {:?}",
                        attempts, selector, e, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Enable notifications on `characteristic` and feed them into `sink`.
    /// The subscription is restored after every reconnect.
    pub async fn subscribe(
        &mut self,
        characteristic: CharacteristicId,
        sink: NotificationSink,
    ) -> Result<(), LinkError> {
        self.subscribe_current(characteristic, &sink).await?;
        self.subscription = Some((characteristic, sink));
        Ok(())
    }

    async fn subscribe_current(
        &self,
        characteristic: CharacteristicId,
        sink: &NotificationSink,
    ) -> Result<(), LinkError> {
        let handle = self.handle.as_ref().ok_or(LinkError::NotConnected)?;
        timeout(
            self.connect_timeout,
            self.transport
                .subscribe(handle, characteristic, sink.callback()),
        )
        .await
        .map_err(|_| LinkError::Timeout(format!("subscribe to {}", characteristic)))??;
        debug!("Subscribed to {}", characteristic);
        Ok(())
    }

    /// Write one value. Fails with `NotConnected` unless the link is up.
    pub async fn write(&self, characteristic: CharacteristicId, data: &[u8]) -> Result<(), LinkError> {
        if !self.state().is_connected() {
            return Err(LinkError::NotConnected);
        }
        let handle = self.handle.as_ref().ok_or(LinkError::NotConnected)?;

        match timeout(
            self.write_timeout,
            self.transport.write(handle, characteristic, data),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(format!(
                "write to {} after {:?}",
                characteristic, self.write_timeout
            ))),
        }
    }

    /// Close the connection if one is open. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.transport.disconnect(&handle).await {
                warn!("Disconnect from {} failed: {}", handle.device, e);
            } else {
                info!("Disconnected from {}", handle.device);
            }
        }
        self.set_state(LinkState::Disconnected);
    }

    /// One reconnect attempt: re-scan, connect, restore the subscription
    async fn reconnect_once(&mut self) -> Result<(), LinkError> {
        let selector = self.selector.clone().ok_or(LinkError::NotConnected)?;
        let device = self
            .scan(&selector)
            .await?
            .ok_or_else(|| LinkError::DeviceNotFound(selector.to_string()))?;

        let handle = timeout(self.connect_timeout, self.transport.connect(&device))
            .await
            .map_err(|_| {
                LinkError::Timeout(format!(
                    "connect to {} after {:?}",
                    device, self.connect_timeout
                ))
            })??;
        self.handle = Some(handle);

        if let Some((characteristic, sink)) = self.subscription.clone() {
            if let Err(e) = self.subscribe_current(characteristic, &sink).await {
                if let Some(half_open) = self.handle.take() {
                    let _ = self.transport.disconnect(&half_open).await;
                }
                return Err(e);
            }
        }

        info!("Reconnected to {}", device);
        self.set_state(LinkState::Connected);
        Ok(())
    }

    /// Move into the link task. The task runs until shutdown has been
    /// signalled and every `LinkHandle` is gone, then disconnects.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (LinkHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = LinkHandle {
            command_tx,
            state: self.subscribe_state(),
        };
        let task = tokio::spawn(self.run(command_rx, shutdown));
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LinkCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut stopping = *shutdown.borrow();
        let mut retry_at: Option<Instant> = None;
        let mut attempts: u32 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed(), if !stopping => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                        retry_at = None;
                        if self.handle.is_none() {
                            self.set_state(LinkState::Disconnected);
                        }
                        debug!("Link task stopping, reconnection disabled");
                    }
                }

                Some(dropped) = self.disconnect_rx.recv() => {
                    if self.handle.as_ref().map(|h| h.id) != Some(dropped.id) {
                        continue;
                    }
                    self.handle = None;
                    warn!("Link to {} dropped", dropped.device);

                    if stopping {
                        self.set_state(LinkState::Disconnected);
                    } else {
                        self.set_state(LinkState::Reconnecting);
                        attempts = 0;
                        retry_at = Some(Instant::now() + self.policy.delay(0));
                    }
                }

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    // None when shutdown arrived mid-attempt
                    let outcome = {
                        let attempt = self.reconnect_once();
                        tokio::pin!(attempt);
                        loop {
                            tokio::select! {
                                result = &mut attempt => break Some(result),
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break None;
                                    }
                                }
                            }
                        }
                    };

                    match outcome {
                        None => {
                            stopping = true;
                            retry_at = None;
                            info!("Shutdown during reconnect, abandoning attempt");
                            // Closes a connection the attempt had already opened
                            self.disconnect().await;
                        }
                        Some(Ok(())) => {
                            retry_at = None;
                            attempts = 0;
                            self.metrics.record_reconnect();
                        }
                        Some(Err(e)) => {
                            attempts += 1;
                            debug!("Reconnect attempt {} failed: {}", attempts, e);
                            if !self.policy.should_retry(attempts) {
                                error!(
                                    "Reconnect window exhausted after {} attempts, starting a new one",
                                    attempts
                                );
                                self.metrics.record_link_lost();
                                let _ = self.events.send(BridgeEvent::LinkLost { attempts });
                                attempts = 0;
                            }
                            retry_at = Some(Instant::now() + self.policy.delay(attempts));
                        }
                    }
                }

                command = commands.recv() => match command {
                    Some(LinkCommand::Write { characteristic, data, reply }) => {
                        let result = self.write(characteristic, &data).await;
                        let delivered = result.is_ok();
                        if reply.send(result).await.is_err() && delivered {
                            // The caller gave up (drain deadline) but the value reached the peripheral
                            self.metrics.record_dispatched();
                            debug!("Write to {} completed after its caller gave up", characteristic);
                        }
                    }
                    None => break,
                },
            }
        }

        self.disconnect().await;
        debug!("Link task exited");
    }
}

/// Cloneable handle to the running link task
#[derive(Clone)]
pub struct LinkHandle {
    command_tx: mpsc::Sender<LinkCommand>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Write through the link task. Returns `NotConnected` right away while
    /// the link is down.
    pub async fn write(&self, characteristic: CharacteristicId, data: Vec<u8>) -> Result<(), LinkError> {
        if !self.state().is_connected() {
            return Err(LinkError::NotConnected);
        }

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(LinkCommand::Write {
                characteristic,
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::Closed)?;

        reply_rx.recv().await.ok_or(LinkError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectSettings;
    use crate::transport::SimulatedTransport;

    const NOTIFY: u32 = 0x2A58;
    const LED: u32 = 0x2A59;

    fn settings() -> BridgeSettings {
        BridgeSettings {
            reconnect: ReconnectSettings {
                initial_delay_ms: 1_000,
                max_delay_ms: 8_000,
                max_attempts: 3,
                jitter: 0.0,
            },
            ..BridgeSettings::default()
        }
    }

    fn selector() -> DeviceSelector {
        DeviceSelector::Name("Nano 33 IoT".to_string())
    }

    fn setup() -> (
        Arc<SimulatedTransport>,
        LinkManager,
        mpsc::UnboundedReceiver<BridgeEvent>,
        Arc<BridgeMetrics>,
    ) {
        let sim = Arc::new(SimulatedTransport::new().with_device("Nano 33 IoT", "AA:BB:CC:DD:EE:FF"));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(BridgeMetrics::new());
        let link = LinkManager::new(sim.clone(), &settings(), false, events_tx, metrics.clone());
        (sim, link, events_rx, metrics)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn wait_for_state(rx: &mut watch::Receiver<LinkState>, wanted: LinkState) {
        timeout(Duration::from_secs(120), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state reached in time")
            .expect("link state sender alive");
    }

    #[tokio::test]
    async fn test_connect_walks_startup_states() {
        let (_sim, mut link, mut events, _) = setup();
        link.connect(&selector()).await.unwrap();

        assert_eq!(link.state(), LinkState::Connected);
        let transitions: Vec<(LinkState, LinkState)> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::LinkStateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (LinkState::Disconnected, LinkState::Scanning),
                (LinkState::Scanning, LinkState::Connecting),
                (LinkState::Connecting, LinkState::Connected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_is_not_retried() {
        let (sim, mut link, _events, _) = setup();
        sim.set_devices_visible(false);

        let result = link.establish(&selector()).await;
        assert!(matches!(result, Err(LinkError::DeviceNotFound(_))));
        assert_eq!(sim.scan_count(), 1);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_retries_transient_connect_failures() {
        let (sim, mut link, _events, _) = setup();
        sim.fail_next_connects(2);

        link.establish(&selector()).await.unwrap();
        assert_eq!(sim.connect_count(), 3);
        assert!(link.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_gives_up_after_one_window() {
        let (sim, mut link, _events, _) = setup();
        sim.fail_next_connects(10);

        let result = link.establish(&selector()).await;
        assert!(matches!(result, Err(LinkError::ConnectFailed(_))));
        assert_eq!(sim.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_scan_is_bounded() {
        let (sim, mut link, _events, _) = setup();
        sim.set_scan_latency(Duration::from_secs(3_600));

        let start = Instant::now();
        let result = link.connect(&selector()).await;
        assert!(matches!(result, Err(LinkError::Timeout(_))));
        assert!(start.elapsed() <= BridgeSettings::default().scan_timeout() + SCAN_TIMEOUT_MARGIN);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (_sim, link, _events, _) = setup();
        let result = link
            .write(CharacteristicId::from_short(LED), b"BLINK_1S")
            .await;
        assert_eq!(result, Err(LinkError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_subscription() {
        let (sim, mut link, _events, metrics) = setup();
        let (sink_events, _sink_rx) = mpsc::unbounded_channel();
        let (sink, mut notifications) = NotificationSink::channel(8, metrics.clone(), sink_events);

        link.connect(&selector()).await.unwrap();
        link.subscribe(CharacteristicId::from_short(NOTIFY), sink)
            .await
            .unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = link.spawn(shutdown_rx);
        let mut state = handle.subscribe_state();

        sim.drop_connection();
        wait_for_state(&mut state, LinkState::Reconnecting).await;
        assert_eq!(
            handle
                .write(CharacteristicId::from_short(LED), b"BLINK_1S".to_vec())
                .await,
            Err(LinkError::NotConnected)
        );

        wait_for_state(&mut state, LinkState::Connected).await;
        assert!(sim.inject_notification(CharacteristicId::from_short(NOTIFY), b"0.6,0,0,0,0,0"));
        let raw = notifications.recv().await.unwrap();
        assert_eq!(raw.payload, b"0.6,0,0,0,0,0".to_vec());
        assert_eq!(metrics.snapshot().reconnects, 1);

        handle
            .write(CharacteristicId::from_short(LED), b"BLINK_5S".to_vec())
            .await
            .unwrap();
        assert_eq!(sim.written_text(), vec!["BLINK_5S".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_window_reports_link_lost_and_keeps_trying() {
        let (sim, mut link, mut events, metrics) = setup();
        link.connect(&selector()).await.unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = link.spawn(shutdown_rx);
        let mut state = handle.subscribe_state();

        sim.set_devices_visible(false);
        sim.drop_connection();

        // 1s + 2s + 4s exhausts the first window
        sleep(Duration::from_secs(8)).await;
        assert_eq!(metrics.snapshot().link_lost, 1);
        assert!(drain(&mut events)
            .iter()
            .any(|e| *e == BridgeEvent::LinkLost { attempts: 3 }));
        assert_eq!(handle.state(), LinkState::Reconnecting);

        sim.set_devices_visible(true);
        wait_for_state(&mut state, LinkState::Connected).await;
        assert_eq!(metrics.snapshot().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_exactly_once() {
        let (sim, mut link, _events, _) = setup();
        link.connect(&selector()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = link.spawn(shutdown_rx);
        let state = handle.subscribe_state();

        shutdown_tx.send(true).unwrap();
        drop(handle);
        timeout(Duration::from_secs(5), task)
            .await
            .expect("link task exits")
            .unwrap();

        assert_eq!(sim.disconnect_count(), 1);
        assert!(!sim.is_connected());
        assert_eq!(*state.borrow(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_reconnect_closes_half_open_link() {
        let (sim, mut link, _events, metrics) = setup();
        let (sink_events, _sink_rx) = mpsc::unbounded_channel();
        let (sink, _notifications) = NotificationSink::channel(8, metrics, sink_events);
        link.connect(&selector()).await.unwrap();
        link.subscribe(CharacteristicId::from_short(NOTIFY), sink)
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = link.spawn(shutdown_rx);
        let state = handle.subscribe_state();

        // Reconnect at 1s connects, then hangs re-subscribing
        sim.stall_subscribes_after(0);
        sim.drop_connection();
        sleep(Duration::from_secs(2)).await;
        assert!(sim.is_connected());
        assert_eq!(*state.borrow(), LinkState::Reconnecting);

        shutdown_tx.send(true).unwrap();
        drop(handle);
        timeout(Duration::from_secs(1), task)
            .await
            .expect("link task exits without waiting out the subscribe")
            .unwrap();

        assert_eq!(sim.disconnect_count(), 1);
        assert!(!sim.is_connected());
        assert_eq!(*state.borrow(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_after_shutdown() {
        let (sim, mut link, _events, _) = setup();
        link.connect(&selector()).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = link.spawn(shutdown_rx);
        let mut state = handle.subscribe_state();

        shutdown_tx.send(true).unwrap();
        sleep(Duration::from_millis(10)).await;
        sim.drop_connection();
        wait_for_state(&mut state, LinkState::Disconnected).await;

        sleep(Duration::from_secs(30)).await;
        assert_eq!(sim.connect_count(), 1);
    }
}
