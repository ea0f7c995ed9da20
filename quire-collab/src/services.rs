//! Collaborator seams: identity resolution and page permissions.
//!
//! The host application owns users, tokens and access rules. The hub only
//! talks to them through these traits so it can be tested in isolation.

use std::collections::HashMap;
use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, ConfigError};
use crate::protocol::UserIdentity;

/// Access level a user holds on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

/// Resolves an authentication token to a user.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Decides whether a user may act on a page at a given level.
#[async_trait::async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check_permission(
        &self,
        page_id: &str,
        user_id: &str,
        required: PermissionLevel,
    ) -> bool;
}

/// Token table held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, UserIdentity>,
}

/// On-disk shape of a token table: `{"tokens": {"<token>": {"user_id": .., "username": ..}}}`.
#[derive(Debug, Deserialize)]
struct TokenFile {
    tokens: HashMap<String, UserIdentity>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: UserIdentity) -> Self {
        self.insert(token, user);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user: UserIdentity) {
        self.tokens.insert(token.into(), user);
    }

    /// Load a token table from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: TokenFile = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { tokens: file.tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn identify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Grants every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl PermissionChecker for AllowAll {
    async fn check_permission(&self, _page_id: &str, _user_id: &str, _required: PermissionLevel) -> bool {
        true
    }
}

/// Explicit grants per (page, user). Holding a level implies every lower one.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    grants: HashMap<(String, String), PermissionLevel>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(
        mut self,
        page_id: impl Into<String>,
        user_id: impl Into<String>,
        level: PermissionLevel,
    ) -> Self {
        self.grants.insert((page_id.into(), user_id.into()), level);
        self
    }
}

#[async_trait::async_trait]
impl PermissionChecker for StaticPermissions {
    async fn check_permission(&self, page_id: &str, user_id: &str, required: PermissionLevel) -> bool {
        self.grants
            .get(&(page_id.to_string(), user_id.to_string()))
            .is_some_and(|held| *held >= required)
    }
}
