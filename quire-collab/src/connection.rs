//! Connection handles and per-connection lifecycle state.
//!
//! The transport owns the socket and the receiving end of the outbound
//! channel. Everyone else (registry, hub) only holds a [`ConnectionHandle`],
//! which can push frames but never keeps the socket alive.

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// Stable identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Work item for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-encoded envelope, shared by every recipient of a broadcast
    Frame(Arc<str>),
    /// Close the connection with a code and reason
    Close { code: u16, reason: String },
}

/// Lifecycle of a connection as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Identity is being resolved
    Connecting,
    /// Registered and relaying frames
    Active,
    /// Terminal
    Closed,
}

/// Non-owning handle to a connection's outbound channel.
///
/// Sending never waits on the recipient: the frame is queued and the
/// transport's writer drains it. A send fails only once the writer is gone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
        }
    }

    /// Create a handle together with the receiving end its writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, item: Outbound) -> Result<(), TransportError> {
        self.sender
            .send(item)
            .map_err(|_| TransportError::Closed(self.id))
    }

    pub fn send_frame(&self, frame: Arc<str>) -> Result<(), TransportError> {
        self.send(Outbound::Frame(frame))
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl std::hash::Hash for ConnectionHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
