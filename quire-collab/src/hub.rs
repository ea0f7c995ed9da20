//! Per-connection state machine and page fan-out.
//!
//! ```text
//!   connect()                handle_frame()              disconnect()
//! ┌────────────┐  identify  ┌────────┐  self-loop   ┌────────┐
//! │ Connecting │ ─────────► │ Active │ ───────────► │ Closed │
//! └─────┬──────┘            └────────┘              └────────┘
//!       │ AuthError                                     ▲
//!       └───────────────────────────────────────────────┘
//! ```
//!
//! Every relay goes through [`CollaborationHub::broadcast`]: snapshot the
//! page's members, push the pre-encoded frame to each, and deregister any
//! member whose channel is gone. A failed member never stops delivery to the
//! others.
//!
//! The hub is a relay. Concurrent edits from different senders reach
//! receivers in arrival order with no merging.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionState, Outbound};
use crate::error::{AuthError, ProtocolError, TransportError};
use crate::protocol::{ClientFrame, Envelope, UserIdentity};
use crate::registry::{ConnectionIdentity, ConnectionRegistry};
use crate::services::{IdentityProvider, PermissionChecker, PermissionLevel};

/// WebSocket close code sent to rejected connections (policy violation).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Which members of a page receive a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every member
    All,
    /// Every member except one connection (the sender)
    Except(ConnectionId),
    /// Every member not belonging to this user
    ExceptUser(String),
}

impl Recipients {
    fn excludes(&self, identity: &ConnectionIdentity) -> bool {
        match self {
            Self::All => false,
            Self::Except(id) => identity.connection_id == *id,
            Self::ExceptUser(user_id) => identity.user_id == *user_id,
        }
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members the frame was queued for
    pub delivered: usize,
    /// Members whose channel was closed; they have been deregistered
    pub failed: Vec<ConnectionId>,
}

/// Why an inbound frame was not relayed.
#[derive(Debug)]
pub enum DropReason {
    Protocol(ProtocolError),
    /// `page_update` from a session without write access
    ReadOnly,
    /// Session is not `Active`
    NotActive,
}

#[derive(Debug)]
pub enum FrameOutcome {
    Relayed(BroadcastReport),
    Dropped(DropReason),
}

/// Content of a page changed outside a live connection (e.g. a REST save).
#[derive(Debug, Clone)]
pub struct PageMutation {
    pub page_id: String,
    pub content: String,
    pub author: UserIdentity,
}

/// A comment was persisted by the host application.
#[derive(Debug, Clone)]
pub struct CommentAdded {
    pub page_id: String,
    pub comment_id: String,
    pub content: String,
    pub author: UserIdentity,
}

/// Hub-side state of one connection, held by the transport's reader loop.
#[derive(Debug)]
pub struct Session {
    handle: ConnectionHandle,
    page_id: String,
    user: UserIdentity,
    can_edit: bool,
    state: ConnectionState,
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn can_edit(&self) -> bool {
        self.can_edit
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }
}

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
}

/// Lock-free counters, read via [`CollaborationHub::stats`].
#[derive(Default)]
struct AtomicHubStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// The collaboration hub.
pub struct CollaborationHub {
    registry: Arc<ConnectionRegistry>,
    identity: Arc<dyn IdentityProvider>,
    permissions: Arc<dyn PermissionChecker>,
    stats: AtomicHubStats,
}

impl CollaborationHub {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        identity: Arc<dyn IdentityProvider>,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        Self {
            registry,
            identity,
            permissions,
            stats: AtomicHubStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Admit a connection to a page.
    ///
    /// Resolves the token, checks read access, registers the connection,
    /// announces `user_joined` to the other members and sends the joiner a
    /// private `page_users` snapshot taken after its own insertion.
    ///
    /// On failure the connection is told to close and is never registered.
    pub async fn connect(
        &self,
        handle: ConnectionHandle,
        page_id: &str,
        token: &str,
    ) -> Result<Session, AuthError> {
        let user = match self.admit(page_id, token).await {
            Ok(user) => user,
            Err(e) => {
                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                log::info!("Rejected connection {} to page {page_id:?}: {e}", handle.id());
                let _ = handle.send(Outbound::Close {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let can_edit = self
            .permissions
            .check_permission(page_id, &user.user_id, PermissionLevel::Write)
            .await;

        let mut session = Session {
            handle,
            page_id: page_id.to_string(),
            user,
            can_edit,
            state: ConnectionState::Connecting,
        };
        let (handle, user) = (&session.handle, &session.user);

        self.registry
            .register(handle.clone(), page_id, &user.user_id, &user.username)
            .await;
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "{} ({}) joined page {page_id} on connection {}",
            user.username,
            user.user_id,
            handle.id()
        );

        self.broadcast(
            page_id,
            &Envelope::user_joined(page_id, user),
            Recipients::Except(handle.id()),
        )
        .await;

        let users = self.registry.users_on_page(page_id).await;
        if let Err(e) = self.send_to(handle, &Envelope::page_users(page_id, &users)) {
            log::warn!("Could not send page_users to {}: {e}", handle.id());
            self.heal(vec![handle.id()]).await;
        }

        session.state = ConnectionState::Active;
        Ok(session)
    }

    async fn admit(&self, page_id: &str, token: &str) -> Result<UserIdentity, AuthError> {
        if page_id.is_empty() {
            return Err(AuthError::MissingPage);
        }
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let user = self.identity.identify(token).await?;
        let allowed = self
            .permissions
            .check_permission(page_id, &user.user_id, PermissionLevel::Read)
            .await;
        if !allowed {
            return Err(AuthError::Forbidden {
                page_id: page_id.to_string(),
                user_id: user.user_id,
            });
        }
        Ok(user)
    }

    /// Dispatch one inbound text frame from an active session.
    ///
    /// Malformed, unknown and server-only frames are dropped; the session
    /// stays active either way.
    pub async fn handle_frame(&self, session: &Session, text: &str) -> FrameOutcome {
        if !session.is_active() {
            return FrameOutcome::Dropped(DropReason::NotActive);
        }
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Dropping frame from {}: {e}", session.id());
                return self.drop_frame(DropReason::Protocol(e));
            }
        };

        let page_id = session.page_id();
        log::trace!(
            "Relaying {} from {} on page {page_id}",
            frame.msg_type(),
            session.user.username
        );
        let envelope = match frame {
            ClientFrame::PageUpdate { content } => {
                if !session.can_edit {
                    log::debug!(
                        "Dropping page_update from read-only user {} on page {page_id}",
                        session.user.user_id
                    );
                    return self.drop_frame(DropReason::ReadOnly);
                }
                Envelope::page_update(page_id, &content, &session.user)
            }
            ClientFrame::CursorPosition { position } => {
                Envelope::cursor_position(page_id, position, &session.user)
            }
            ClientFrame::TypingStart => Envelope::typing(page_id, true, &session.user),
            ClientFrame::TypingStop => Envelope::typing(page_id, false, &session.user),
        };

        let report = self
            .broadcast(page_id, &envelope, Recipients::Except(session.id()))
            .await;
        FrameOutcome::Relayed(report)
    }

    /// Tell the hub a frame arrived that could not be read as text.
    pub fn reject_binary(&self, session: &Session) -> FrameOutcome {
        if !session.is_active() {
            return FrameOutcome::Dropped(DropReason::NotActive);
        }
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        log::debug!("Dropping non-text frame from {}", session.id());
        self.drop_frame(DropReason::Protocol(ProtocolError::NonText))
    }

    fn drop_frame(&self, reason: DropReason) -> FrameOutcome {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        FrameOutcome::Dropped(reason)
    }

    /// Close a session: deregister it and, if it was active and still
    /// registered, announce `user_left`. Safe to call more than once.
    pub async fn disconnect(&self, session: &mut Session) {
        let was_active = session.is_active();
        session.state = ConnectionState::Closed;

        let Some(identity) = self.registry.deregister(&session.id()).await else {
            return;
        };
        log::info!(
            "{} ({}) left page {} on connection {}",
            identity.username,
            identity.user_id,
            identity.page_id,
            identity.connection_id
        );
        if was_active {
            self.announce_departure(&identity).await;
        }
    }

    async fn announce_departure(&self, identity: &ConnectionIdentity) {
        self.broadcast(
            &identity.page_id,
            &Envelope::user_left(&identity.page_id, &identity.user()),
            Recipients::Except(identity.connection_id),
        )
        .await;
    }

    /// A page's content was saved outside a live connection. Every member
    /// of the page receives the new content.
    pub async fn on_page_mutated(&self, mutation: PageMutation) -> BroadcastReport {
        let envelope = Envelope::page_update(&mutation.page_id, &mutation.content, &mutation.author);
        self.broadcast(&mutation.page_id, &envelope, Recipients::All).await
    }

    /// A comment was persisted. Members other than the author's own
    /// connections are notified.
    pub async fn on_comment_added(&self, comment: CommentAdded) -> BroadcastReport {
        let envelope = Envelope::comment_added(
            &comment.page_id,
            &comment.comment_id,
            &comment.content,
            &comment.author,
        );
        self.broadcast(
            &comment.page_id,
            &envelope,
            Recipients::ExceptUser(comment.author.user_id.clone()),
        )
        .await
    }

    /// Send an envelope to every selected member of a page.
    ///
    /// Members whose channel is closed are deregistered and announced as
    /// having left, as if they had disconnected.
    pub async fn broadcast(
        &self,
        page_id: &str,
        envelope: &Envelope,
        recipients: Recipients,
    ) -> BroadcastReport {
        let report = self.deliver(page_id, envelope, &recipients).await;
        if !report.failed.is_empty() {
            self.heal(report.failed.clone()).await;
        }
        report
    }

    /// Private delivery to a single connection.
    pub fn send_to(&self, handle: &ConnectionHandle, envelope: &Envelope) -> Result<(), TransportError> {
        match handle.send_frame(Arc::from(envelope.encode())) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn deliver(
        &self,
        page_id: &str,
        envelope: &Envelope,
        recipients: &Recipients,
    ) -> BroadcastReport {
        let frame: Arc<str> = Arc::from(envelope.encode());
        let mut report = BroadcastReport::default();
        for (handle, identity) in self.registry.members_with_identity(page_id).await {
            if recipients.excludes(&identity) {
                continue;
            }
            match handle.send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("Send of {} to {} failed: {e}", envelope.msg_type, identity.connection_id);
                    report.failed.push(identity.connection_id);
                }
            }
        }

        self.stats
            .messages_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .send_failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        report
    }

    /// Deregister unreachable connections and announce their departure.
    /// Announcements can uncover more dead members; those are queued too.
    async fn heal(&self, failed: Vec<ConnectionId>) {
        let mut queue: VecDeque<ConnectionId> = failed.into();
        while let Some(id) = queue.pop_front() {
            let Some(identity) = self.registry.deregister(&id).await else {
                continue;
            };
            log::warn!(
                "Removed unreachable connection {id} ({}) from page {}",
                identity.username,
                identity.page_id
            );
            let leave = Envelope::user_left(&identity.page_id, &identity.user());
            let report = self
                .deliver(&identity.page_id, &leave, &Recipients::Except(id))
                .await;
            queue.extend(report.failed);
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections_accepted: self.stats.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.stats.connections_rejected.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
        }
    }
}
