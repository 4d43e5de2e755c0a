use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use vroom_core::{ConnectionId, ParticipantId, SessionId};

/// Why a connection ended. The first reason recorded wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientGone,
    TransportError,
    Evicted,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientGone => "client_gone",
            Self::TransportError => "transport_error",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry-side handle on one live stream.
///
/// Cloning is cheap; every clone controls the same lifetime token.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    session_id: SessionId,
    participant_id: Option<ParticipantId>,
    lifetime: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl ConnectionHandle {
    pub fn new(
        session_id: SessionId,
        participant_id: Option<ParticipantId>,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            session_id,
            participant_id,
            lifetime,
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn participant_id(&self) -> Option<&ParticipantId> {
        self.participant_id.as_ref()
    }

    /// Record `reason` (unless one is already set) and cancel the lifetime.
    /// Returns false when the connection had already been closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.lifetime.cancel();
        first
    }

    /// The recorded close reason. A lifetime cancelled from a parent token
    /// without an explicit reason is a shutdown.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.reason.get() {
            Some(reason) => Some(*reason),
            None if self.lifetime.is_cancelled() => Some(CloseReason::Shutdown),
            None => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    pub async fn closed(&self) {
        self.lifetime.cancelled().await;
    }
}

/// Live connections grouped by session, oldest first.
///
/// Each session's check-evict-insert runs under that session's shard lock, so
/// the per-session cap holds under concurrent registrations.
pub struct ConnectionRegistry {
    sessions: DashMap<SessionId, VecDeque<ConnectionHandle>>,
    max_per_session: usize,
}

impl ConnectionRegistry {
    pub fn new(max_per_session: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_per_session: max_per_session.max(1),
        }
    }

    pub fn max_per_session(&self) -> usize {
        self.max_per_session
    }

    /// Insert `handle`, evicting the session's oldest connection when the cap
    /// is already reached. The evicted connection is closed before returning.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let evicted = {
            let mut set = self.sessions.entry(handle.session_id.clone()).or_default();
            let evicted = if set.len() >= self.max_per_session {
                set.pop_front()
            } else {
                None
            };
            set.push_back(handle.clone());
            evicted
        };

        if let Some(old) = &evicted {
            if !old.close(CloseReason::Evicted) {
                tracing::debug!(
                    session_id = %old.session_id,
                    connection_id = %old.id,
                    "evicted connection was already closing"
                );
            }
            tracing::info!(
                session_id = %handle.session_id,
                evicted = %old.id,
                replacement = %handle.id,
                cap = self.max_per_session,
                "session at capacity, evicted oldest connection"
            );
        }
        evicted
    }

    /// Remove a connection. Drops the session entry once it is empty.
    /// Unknown sessions or connections are a no-op.
    pub fn unregister(&self, session_id: &SessionId, connection_id: &ConnectionId) -> bool {
        let removed = match self.sessions.get_mut(session_id) {
            Some(mut set) => match set.iter().position(|c| &c.id == connection_id) {
                Some(pos) => set.remove(pos).is_some(),
                None => false,
            },
            None => false,
        };
        self.sessions.remove_if(session_id, |_, set| set.is_empty());
        removed
    }

    /// Live connection count for one session (0 if absent).
    pub fn count(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |set| set.len())
    }

    /// Live connections across every session.
    pub fn total(&self) -> usize {
        self.sessions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of sessions with at least one live connection.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connection ids for a session, oldest first.
    pub fn connections(&self, session_id: &SessionId) -> Vec<ConnectionId> {
        self.sessions
            .get(session_id)
            .map(|set| set.iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default()
    }
}
