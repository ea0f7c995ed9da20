//! # quire-collab: Real-time page collaboration for Quire
//!
//! Relays live edits, comments, cursors, typing signals and presence to
//! every participant connected to the same page.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)  ┌──────────────────┐
//! │ Browser tab │ ◄─────────────────► │ CollabServer     │
//! │ (per user)  │                     │ (reader/writer)  │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │
//!                                              ▼
//!          IdentityProvider ◄──────── ┌──────────────────┐ ◄──── on_page_mutated
//!          PermissionChecker ◄─────── │ CollaborationHub │ ◄──── on_comment_added
//!                                     └────────┬─────────┘
//!                                              │
//!                                     ┌────────┴─────────┐
//!                                     │ConnectionRegistry│
//!                                     │ (page → members) │
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope and client frame parsing
//! - [`connection`]: connection ids, handles and lifecycle states
//! - [`registry`]: live connections grouped by page
//! - [`hub`]: per-connection state machine and fan-out
//! - [`services`]: identity and permission collaborator traits
//! - [`server`]: tokio-tungstenite transport
//! - [`config`]: layered server configuration
//! - [`error`]: error taxonomy
//!
//! The hub is a relay, not a merge engine: concurrent edits reach receivers
//! in arrival order.

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod services;

// Re-exports for convenience
pub use config::ServerConfig;
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState, Outbound};
pub use error::{AuthError, CollabError, ConfigError, ProtocolError, TransportError};
pub use hub::{
    BroadcastReport, CollaborationHub, CommentAdded, DropReason, FrameOutcome, HubStats,
    PageMutation, Recipients, Session,
};
pub use protocol::{ClientFrame, Envelope, MessageType, UserIdentity};
pub use registry::{ConnectionIdentity, ConnectionRegistry};
pub use server::{CollabServer, ConnectTarget};
pub use services::{
    AllowAll, IdentityProvider, PermissionChecker, PermissionLevel, StaticIdentityProvider,
    StaticPermissions,
};
