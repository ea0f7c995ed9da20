//! Live connections grouped by page.
//!
//! The registry knows nothing about message semantics. It answers two
//! questions for the hub: who is on this page, and who is this connection.
//!
//! All state sits behind one lock so a broadcast never observes a
//! registration or deregistration half-applied. Invariants kept under it:
//! - every registered connection has exactly one identity
//! - a connection is in a page's set iff its identity names that page
//! - no page entry with zero members survives a mutation

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::protocol::UserIdentity;

/// Identity bound to a connection at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub connection_id: ConnectionId,
    pub page_id: String,
    pub user_id: String,
    pub username: String,
}

impl ConnectionIdentity {
    pub fn user(&self) -> UserIdentity {
        UserIdentity::new(self.user_id.clone(), self.username.clone())
    }
}

struct RegisteredConnection {
    handle: ConnectionHandle,
    identity: ConnectionIdentity,
}

#[derive(Default)]
struct RegistryState {
    /// page_id → connections on that page
    pages: HashMap<String, HashSet<ConnectionId>>,
    /// connection_id → handle + identity
    connections: HashMap<ConnectionId, RegisteredConnection>,
}

impl RegistryState {
    fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionIdentity> {
        let entry = self.connections.remove(id)?;
        let page_id = &entry.identity.page_id;
        if let Some(members) = self.pages.get_mut(page_id) {
            members.remove(id);
            if members.is_empty() {
                self.pages.remove(page_id);
            }
        }
        Some(entry.identity)
    }
}

/// Registry of live connections.
///
/// Constructed explicitly and shared by `Arc`; one instance per process is
/// the normal setup, but nothing here is global.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection on a page.
    ///
    /// Registering a connection that is already registered replaces its
    /// previous identity in the same critical section (the old page set is
    /// left and pruned if emptied). The replaced identity is returned.
    pub async fn register(
        &self,
        handle: ConnectionHandle,
        page_id: &str,
        user_id: &str,
        username: &str,
    ) -> Option<ConnectionIdentity> {
        let id = handle.id();
        let identity = ConnectionIdentity {
            connection_id: id,
            page_id: page_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
        };

        let mut state = self.state.write().await;
        let replaced = state.remove(&id);
        if let Some(previous) = &replaced {
            log::warn!(
                "Connection {id} re-registered without deregister (page {} -> {page_id})",
                previous.page_id
            );
        }

        state
            .pages
            .entry(page_id.to_string())
            .or_default()
            .insert(id);
        state
            .connections
            .insert(id, RegisteredConnection { handle, identity });
        replaced
    }

    /// Remove a connection from its page and discard its identity.
    ///
    /// Absent connections are a no-op returning `None`, so both the
    /// graceful-close and the error path may call this.
    pub async fn deregister(&self, id: &ConnectionId) -> Option<ConnectionIdentity> {
        self.state.write().await.remove(id)
    }

    /// Snapshot of the handles currently on a page. Order is unspecified.
    pub async fn members_of(&self, page_id: &str) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        let Some(members) = state.pages.get(page_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| state.connections.get(id))
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Members of a page together with their identities.
    pub async fn members_with_identity(
        &self,
        page_id: &str,
    ) -> Vec<(ConnectionHandle, ConnectionIdentity)> {
        let state = self.state.read().await;
        let Some(members) = state.pages.get(page_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| state.connections.get(id))
            .map(|entry| (entry.handle.clone(), entry.identity.clone()))
            .collect()
    }

    /// One entry per live connection on the page; a user with two
    /// connections is listed twice.
    pub async fn users_on_page(&self, page_id: &str) -> Vec<UserIdentity> {
        self.members_with_identity(page_id)
            .await
            .into_iter()
            .map(|(_, identity)| identity.user())
            .collect()
    }

    pub async fn identity_of(&self, id: &ConnectionId) -> Option<ConnectionIdentity> {
        self.state
            .read()
            .await
            .connections
            .get(id)
            .map(|entry| entry.identity.clone())
    }

    pub async fn is_registered(&self, id: &ConnectionId) -> bool {
        self.state.read().await.connections.contains_key(id)
    }

    /// Number of pages with at least one connection.
    pub async fn page_count(&self) -> usize {
        self.state.read().await.pages.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn active_pages(&self) -> Vec<String> {
        self.state.read().await.pages.keys().cloned().collect()
    }
}
