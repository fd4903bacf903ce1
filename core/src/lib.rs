// BLE Bridge Core: notification/command pipeline for a single peripheral
//
// Link → ingest → policy → dispatch → link. Everything in here is
// transport-agnostic; the BLE stack is reached only through `BleTransport`.

pub mod config;
pub mod dispatch;
pub mod events;
pub mod ingest;
pub mod link;
pub mod message;
pub mod policy;
pub mod supervisor;
pub mod transport;

use thiserror::Error;

pub use config::{
    BridgeConfig, BridgeSettings, ConfigError, ReconnectSettings, RetrySettings, WriteRateLimit,
};
pub use dispatch::{CommandDispatcher, RateLimiter};
pub use events::{
    BridgeEvent, BridgeMetrics, BridgeStats, DropReason, EventSender, EventSink, MemorySink,
    TracingSink,
};
pub use ingest::{Ingested, IngestPipeline, NotificationSink};
pub use link::{LinkError, LinkHandle, LinkManager, LinkState, ReconnectPolicy};
pub use message::{
    decode_notification, CharacteristicId, Command, CommandKind, DecodeError, RawNotification,
    SensorReading,
};
pub use policy::{decide, DecisionPolicy, ThresholdPolicy};
pub use supervisor::{BridgeSupervisor, RunningBridge, SupervisorState};
pub use transport::{
    BleTransport, ConnectionHandle, DeviceRef, DeviceSelector, NotificationCallback,
    SimulatedTransport,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Startup failed: {0}")]
    Startup(#[from] LinkError),
}

impl BridgeError {
    /// True when the configured peripheral could not be found at startup
    pub fn is_device_not_found(&self) -> bool {
        matches!(self, BridgeError::Startup(LinkError::DeviceNotFound(_)))
    }
}
