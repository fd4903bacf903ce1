//! Bridge supervisor
//!
//! Owns the startup sequence and the lifecycle of the three bridge tasks:
//!
//! ```text
//! Starting ──> Running ──> Draining ──> Stopped
//! ```
//!
//! Startup failures (no such peripheral, connect or subscribe failing) are
//! returned to the caller. Once running, every task reports into one event
//! channel that the supervisor relays to the configured `EventSink`.

use crate::config::BridgeConfig;
use crate::dispatch::CommandDispatcher;
use crate::events::{BridgeEvent, BridgeMetrics, BridgeStats, EventSink, TracingSink};
use crate::ingest::{IngestPipeline, NotificationSink};
use crate::link::{LinkError, LinkManager, LinkState};
use crate::policy::{DecisionPolicy, ThresholdPolicy};
use crate::transport::BleTransport;
use crate::BridgeError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Extra time granted to a task on top of its own deadline before it is aborted
const TASK_EXIT_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Starting => write!(f, "Starting"),
            SupervisorState::Running => write!(f, "Running"),
            SupervisorState::Draining => write!(f, "Draining"),
            SupervisorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Builds and starts a bridge
pub struct BridgeSupervisor {
    config: BridgeConfig,
    transport: Arc<dyn BleTransport>,
    policy: Arc<dyn DecisionPolicy>,
    sink: Arc<dyn EventSink>,
}

impl BridgeSupervisor {
    pub fn new(config: BridgeConfig, transport: Arc<dyn BleTransport>) -> Result<Self, BridgeError> {
        config.validate()?;
        let policy = Arc::new(ThresholdPolicy::new(config.settings.threshold));
        Ok(Self {
            config,
            transport,
            policy,
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn DecisionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Connect, subscribe and spawn the link, ingest and dispatch tasks
    pub async fn start(self) -> Result<RunningBridge, BridgeError> {
        let BridgeSupervisor {
            config,
            transport,
            policy,
            sink,
        } = self;
        let settings = &config.settings;
        info!(
            "Starting bridge for {} (notify {}, command {})",
            config.selector, config.notify_characteristic, config.command_characteristic
        );

        let metrics = Arc::new(BridgeMetrics::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (notification_sink, notifications) =
            NotificationSink::channel(settings.queue_capacity, metrics.clone(), events_tx.clone());

        let mut link = LinkManager::new(
            transport,
            settings,
            config.use_platform_address_mode,
            events_tx.clone(),
            metrics.clone(),
        );

        let startup: Result<(), LinkError> = async {
            link.establish(&config.selector).await?;
            link.subscribe(config.notify_characteristic, notification_sink)
                .await
        }
        .await;
        if let Err(e) = startup {
            link.disconnect().await;
            while let Ok(event) = events_rx.try_recv() {
                sink.emit(event);
            }
            warn!("Bridge startup failed: {}", e);
            return Err(BridgeError::Startup(e));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (link_handle, link_task) = link.spawn(shutdown_rx.clone());
        let link_state = link_handle.subscribe_state();

        let (command_tx, command_rx) = mpsc::channel(settings.queue_capacity);
        let ingest = IngestPipeline::new(
            settings.command_keyword.clone(),
            metrics.clone(),
            events_tx.clone(),
        );
        let ingest_task = tokio::spawn(ingest.run(
            notifications,
            command_tx,
            policy,
            shutdown_rx.clone(),
        ));

        let dispatcher = CommandDispatcher::new(
            link_handle,
            config.command_characteristic,
            settings.write_rate_limit,
            settings.command_retry,
            metrics.clone(),
        );
        let dispatch_task = tokio::spawn(dispatcher.run(
            command_rx,
            shutdown_rx,
            settings.drain_grace(),
            events_tx,
        ));

        info!("Bridge running");
        Ok(RunningBridge {
            state: SupervisorState::Running,
            drain_grace: settings.drain_grace(),
            // Longest the link task can be busy: a write, or a reconnect
            // attempt (scan, connect, subscribe) caught before it saw shutdown
            link_exit_timeout: settings.scan_timeout()
                + settings.connect_timeout() * 2
                + settings.write_timeout(),
            shutdown_tx,
            link_state,
            events_rx,
            sink,
            metrics,
            ingest_task: Some(ingest_task),
            dispatch_task: Some(dispatch_task),
            link_task: Some(link_task),
        })
    }

    /// Start, run until `shutdown` resolves, then drain and stop
    pub async fn run_until<F>(self, shutdown: F) -> Result<BridgeStats, BridgeError>
    where
        F: Future<Output = ()>,
    {
        let bridge = self.start().await?;
        Ok(bridge.run_until(shutdown).await)
    }
}

/// A started bridge
pub struct RunningBridge {
    state: SupervisorState,
    drain_grace: Duration,
    link_exit_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    link_state: watch::Receiver<LinkState>,
    events_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<BridgeMetrics>,
    ingest_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
}

impl RunningBridge {
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_state.borrow()
    }

    pub fn subscribe_link_state(&self) -> watch::Receiver<LinkState> {
        self.link_state.clone()
    }

    pub fn stats(&self) -> BridgeStats {
        self.metrics.snapshot()
    }

    /// Relay events to the sink until `shutdown` resolves, then stop
    pub async fn run_until<F>(mut self, shutdown: F) -> BridgeStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(event) = self.events_rx.recv() => self.sink.emit(event),
            }
        }
        self.shutdown().await
    }

    /// Forward every event reported so far
    pub fn relay_pending_events(&mut self) -> usize {
        let mut relayed = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.sink.emit(event);
            relayed += 1;
        }
        relayed
    }

    /// Drain and stop. Ingest stops at once, the dispatcher gets up to the
    /// drain grace for queued commands, then the link closes.
    pub async fn shutdown(mut self) -> BridgeStats {
        self.state = SupervisorState::Draining;
        info!("Bridge draining (grace {:?})", self.drain_grace);
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.ingest_task.take() {
            join_or_abort("ingest", task, self.drain_grace).await;
        }
        if let Some(task) = self.dispatch_task.take() {
            join_or_abort("dispatch", task, self.drain_grace + TASK_EXIT_MARGIN).await;
        }
        if let Some(task) = self.link_task.take() {
            join_or_abort("link", task, self.link_exit_timeout + TASK_EXIT_MARGIN).await;
        }

        self.relay_pending_events();
        self.state = SupervisorState::Stopped;

        let stats = self.metrics.snapshot();
        info!(
            notifications = stats.notifications_received,
            readings = stats.readings_decoded,
            dispatched = stats.commands_dispatched,
            failed = stats.commands_failed,
            dropped = stats.total_dropped(),
            reconnects = stats.reconnects,
            "Bridge stopped"
        );
        stats
    }
}

async fn join_or_abort(name: &str, mut task: JoinHandle<()>, limit: Duration) {
    match timeout(limit, &mut task).await {
        Ok(Ok(())) => debug!("{} task finished", name),
        Ok(Err(e)) => warn!("{} task failed: {}", name, e),
        Err(_) => {
            warn!("{} task still running after {:?}, aborting", name, limit);
            task.abort();
        }
    }
}
