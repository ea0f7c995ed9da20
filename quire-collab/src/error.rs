//! Error taxonomy for the collaboration layer.
//!
//! Every error here is scoped to a single connection. None of them is
//! allowed to escape a connection's loop and take down another one.

use thiserror::Error;

/// Malformed or unrecognized inbound frame. The frame is dropped and the
/// connection stays active.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unrecognized message type: {0}")]
    UnknownType(String),
    #[error("Message type {0} cannot be sent by a client")]
    NotClientOriginated(String),
    #[error("Missing required field '{field}' for {msg_type}")]
    MissingField {
        msg_type: &'static str,
        field: &'static str,
    },
    #[error("Non-text frame")]
    NonText,
}

/// Connection could not be admitted. The connection is closed without
/// ever being registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingToken,
    #[error("Missing page identifier")]
    MissingPage,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("User {user_id} may not access page {page_id}")]
    Forbidden { page_id: String, user_id: String },
}

/// Send or receive failure on one connection. Handled as a disconnect of
/// that connection only.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection {0} is closed")]
    Closed(crate::connection::ConnectionId),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Send timed out after {0} ms")]
    SendTimeout(u64),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error for the fallible entry points of the server.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
