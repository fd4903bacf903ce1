// Link state machine: one value per managed peripheral

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    /// Transport dropped; backoff-driven reconnection in progress
    Reconnecting,
}

impl LinkState {
    /// Transitions the link manager is allowed to make
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Disconnected, Scanning)
                | (Scanning, Connecting)
                | (Scanning, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState::Disconnected
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Scanning => write!(f, "Scanning"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}
