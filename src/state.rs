//! Connection lifecycle state machine
//!
//! ```text
//! idle ──start──▶ connecting ──ack/first tick──▶ connected
//!                     │                              │
//!                     │ failure                 drop │
//!                     ▼                              ▼
//!                 reconnecting ◀──────────────── reconnecting
//!                     │ attempts == max
//!                     ▼
//!                  failed (polling) ──reconnect()──▶ connecting
//! ```
//!
//! Every state can return to `idle` through `stop()`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing running
    #[default]
    Idle,
    /// Resolving symbols and opening the stream
    Connecting,
    /// Stream is live and delivering tickers
    Connected,
    /// Stream dropped, waiting to retry
    Reconnecting,
    /// Retries exhausted, REST polling is the data source
    Failed,
}

/// Externally triggered manager actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
    Reconnect,
    SwitchPage,
}

impl ConnectionState {
    /// Returns true if the machine may move from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (_, Idle) => true,
            (Idle, Connecting) => true,
            (Connecting, Connected | Reconnecting | Failed) => true,
            // a page without streamable symbols drops straight to polling
            (Connected, Reconnecting | Connecting | Failed) => true,
            (Reconnecting, Connected | Failed | Connecting) => true,
            (Failed, Connecting) => true,
            _ => false,
        }
    }

    /// Returns true if `action` may be issued while in this state
    pub fn permits(self, action: Action) -> bool {
        match action {
            Action::Start | Action::Stop => true,
            Action::Reconnect | Action::SwitchPage => self != ConnectionState::Idle,
        }
    }

    /// True while the manager holds a page target
    pub fn is_active(self) -> bool {
        self != ConnectionState::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Reconnect => "reconnect",
            Action::SwitchPage => "switch page",
        };
        f.write_str(name)
    }
}
