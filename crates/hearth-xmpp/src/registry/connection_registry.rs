//! Connection Registry implementation.
//!
//! Tracks live streams by the address bound to them.

use std::fmt;

use dashmap::DashMap;
use jid::Jid;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::stanza::Stanza;

/// A stanza queued for writing to a connection.
#[derive(Debug, Clone)]
pub struct OutboundStanza {
    /// The stanza to send
    pub stanza: Stanza,
}

impl OutboundStanza {
    /// Create a new outbound stanza.
    pub fn new(stanza: Stanza) -> Self {
        Self { stanza }
    }
}

/// Registry entry for one live stream.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Channel to the connection's write side
    pub sender: mpsc::Sender<OutboundStanza>,
    /// Stream id, so a stale connection cannot unregister its replacement
    pub stream_id: String,
}

/// Result of attempting to send a stanza to a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum SendResult {
    /// Queued for delivery
    Sent,
    /// Nobody is bound to that address
    NotConnected,
    /// The recipient's queue is full (backpressure)
    ChannelFull,
    /// The recipient's queue is closed
    ChannelClosed,
}

/// Registry of live streams.
///
/// Thread-safe map from bound address to the connection's outbound queue.
/// Uses DashMap for concurrent access without explicit locking.
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// // When a stream is opened:
/// let (tx, rx) = mpsc::channel(256);
/// registry.register(jid.clone(), stream_id.clone(), tx);
///
/// // From a delivery handler:
/// let result = registry.send_to(&recipient, stanza);
///
/// // When the connection closes:
/// registry.unregister(&jid, &stream_id);
/// ```
pub struct ConnectionRegistry {
    connections: DashMap<Jid, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection's outbound queue under `jid`.
    ///
    /// An existing registration for the same address is replaced; the newer
    /// stream wins.
    #[instrument(skip(self, sender), fields(jid = %jid))]
    pub fn register(&self, jid: Jid, stream_id: String, sender: mpsc::Sender<OutboundStanza>) {
        let existing = self
            .connections
            .insert(jid, ConnectionEntry { sender, stream_id });
        if existing.is_some() {
            debug!("Replaced existing connection registration");
        } else {
            debug!("Registered new connection");
        }
    }

    /// Unregister `jid` if it is still bound to `stream_id`.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn unregister(&self, jid: &Jid, stream_id: &str) -> Option<ConnectionEntry> {
        let removed = self
            .connections
            .remove_if(jid, |_, entry| entry.stream_id == stream_id);
        if removed.is_some() {
            debug!("Unregistered connection");
        } else {
            debug!("Connection was not registered");
        }
        removed.map(|(_, entry)| entry)
    }

    /// Check if an address is currently bound.
    pub fn is_connected(&self, jid: &Jid) -> bool {
        self.connections.contains_key(jid)
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a stanza for the connection bound to `jid`.
    #[instrument(skip(self, stanza), fields(to = %jid))]
    pub fn send_to(&self, jid: &Jid, stanza: Stanza) -> SendResult {
        let sender = match self.connections.get(jid) {
            Some(entry) => entry.value().sender.clone(),
            None => {
                debug!("Recipient not connected");
                return SendResult::NotConnected;
            }
        };

        match sender.try_send(OutboundStanza::new(stanza)) {
            Ok(()) => {
                debug!("Stanza queued for delivery");
                SendResult::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel closed, connection may have dropped");
                self.connections.remove_if(jid, |_, entry| entry.sender.is_closed());
                SendResult::ChannelClosed
            }
        }
    }

    /// List all bound addresses.
    pub fn list_connections(&self) -> Vec<Jid> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }

    /// Remove every entry whose queue is closed. Returns how many went.
    pub fn cleanup_stale(&self) -> usize {
        let before = self.connections.len();
        self.connections.retain(|_, entry| !entry.sender.is_closed());
        let removed = before.saturating_sub(self.connections.len());

        if removed > 0 {
            info!(count = removed, "Cleaned up stale connections");
        }

        removed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}
