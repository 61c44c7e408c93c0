//! Connection status of a document's realtime channel, for UI display.
//!
//! ```text
//! Connecting ──► Subscribed ──► Disconnected
//!      └──────────────────────────▲
//! ```
//!
//! `Disconnected` is terminal; there is no automatic reconnect.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Shared, observable [`ConnectionState`]. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct Presence {
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

impl Presence {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn get_status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `Connecting → Subscribed`; false from any other state.
    pub(crate) fn set_subscribed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Subscribed;
                true
            } else {
                false
            }
        })
    }

    /// Any state `→ Disconnected`; false if already there.
    pub(crate) fn set_disconnected(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                false
            } else {
                *state = ConnectionState::Disconnected;
                true
            }
        })
    }
}
