//! Session status and the callbacks a live session reports through.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::order::OrderLine;

/// Connection status of the live session, as shown to the customer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    /// Whether a session currently holds (or is acquiring) resources.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Callbacks invoked by the session engine.
///
/// All callbacks run on the session task and must not block. Status and
/// talking changes are also published on watch channels; the callbacks exist
/// for hosts that prefer push notifications.
pub trait SessionObserver: Send + Sync {
    /// The agent added items to the order. Never called with an empty list.
    fn on_order_update(&self, lines: Vec<OrderLine>);

    /// A transcript fragment arrived.
    fn on_transcript_update(&self, _text: &str, _is_user: bool) {}

    fn on_status_change(&self, _status: ConnectionStatus) {}

    fn on_talking_change(&self, _talking: bool) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_order_update(&self, _lines: Vec<OrderLine>) {}
}
