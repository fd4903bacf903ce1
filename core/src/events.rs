//! Observability: structured bridge events and counters
//!
//! The core never formats logs for the operator directly; it emits
//! `BridgeEvent`s into an injected `EventSink`. `TracingSink` turns them into
//! `tracing` events, `MemorySink` keeps them for inspection.

use crate::link::LinkState;
use crate::message::{CommandKind, DecodeError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Channel the bridge tasks report into; the supervisor drains it into the
/// configured `EventSink`.
pub type EventSender = mpsc::UnboundedSender<BridgeEvent>;

/// Why a notification never reached the decision engine
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Notification channel at capacity; the newest item was discarded
    QueueFull,
    /// Payload failed to decode
    Malformed(DecodeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    LinkStateChanged { from: LinkState, to: LinkState },
    NotificationDropped { reason: DropReason },
    CommandDeliveryFailed {
        command: CommandKind,
        attempts: u32,
        error: String,
    },
    /// A full reconnect window was exhausted; reconnection continues
    LinkLost { attempts: u32 },
}

/// Receiver for bridge events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BridgeEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::LinkStateChanged { from, to } => {
                info!(from = %from, to = %to, "link state changed");
            }
            BridgeEvent::NotificationDropped { reason } => match reason {
                DropReason::QueueFull => debug!("notification dropped: queue full"),
                DropReason::Malformed(err) => debug!(error = %err, "notification dropped: malformed"),
            },
            BridgeEvent::CommandDeliveryFailed {
                command,
                attempts,
                error,
            } => {
                warn!(command = %command, attempts, error = %error, "command delivery failed");
            }
            BridgeEvent::LinkLost { attempts } => {
                error!(attempts, "link lost: reconnect window exhausted, still retrying");
            }
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<BridgeEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events.lock().clone()
    }

    pub fn count_where(&self, predicate: impl Fn(&BridgeEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: BridgeEvent) {
        self.events.lock().push(event);
    }
}

/// Live counters shared by the bridge tasks
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    notifications_received: AtomicU64,
    readings_decoded: AtomicU64,
    control_messages: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_backpressure: AtomicU64,
    commands_dispatched: AtomicU64,
    commands_failed: AtomicU64,
    commands_abandoned: AtomicU64,
    reconnects: AtomicU64,
    link_lost: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_notification(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reading(&self) {
        self.readings_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_message(&self) {
        self.control_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) -> u64 {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_backpressure_drop(&self) -> u64 {
        self.dropped_backpressure.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_abandoned(&self) {
        self.commands_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_lost(&self) {
        self.link_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            readings_decoded: self.readings_decoded.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            commands_abandoned: self.commands_abandoned.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            link_lost: self.link_lost.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `BridgeMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    pub notifications_received: u64,
    pub readings_decoded: u64,
    pub control_messages: u64,
    pub dropped_malformed: u64,
    pub dropped_backpressure: u64,
    /// Writes that reached the peripheral, including one the link finished
    /// after the drain deadline gave up on it
    pub commands_dispatched: u64,
    pub commands_failed: u64,
    /// Commands cut off by shutdown: still queued, waiting for queue space,
    /// or in flight at the drain deadline
    pub commands_abandoned: u64,
    pub reconnects: u64,
    pub link_lost: u64,
}

impl BridgeStats {
    /// Notifications that never produced a command
    pub fn total_dropped(&self) -> u64 {
        self.dropped_malformed + self.dropped_backpressure
    }
}
