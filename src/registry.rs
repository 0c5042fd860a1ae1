//! Connection registry.
//!
//! Maps broker sessions to backend connection identities and back. Each
//! entry carries an explicit lifecycle state so that a registration which
//! completes after its socket already went away can be told apart from one
//! that never started.
//!
//! ```text
//! begin ──> Unregistered ──complete──> Registered ──begin_close──> Closing ──finish_close──> (removed)
//!               │                                                    ▲
//!               └──────────────begin_close───────────────────────────┘
//! ```

use crate::backend::{ClientConnection, ConnectionId};
use crate::broker::{BrokerClient, SessionId};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle state of one broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, backend registration pending.
    Unregistered,
    /// Backend identity assigned; requests and pushes flow.
    Registered,
    /// Disconnect seen; waiting for the backend to release the identity.
    Closing,
}

/// Outcome of a finished backend registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The entry is now live.
    Registered,
    /// The session went away meanwhile; the caller must release the identity.
    Abandoned,
}

/// Registry entry for one broker session.
pub struct Connection {
    pub client: Arc<dyn BrokerClient>,
    pub state: ConnectionState,
    /// Backend context, present once registration completed.
    pub backend: Option<ClientConnection>,
}

impl Connection {
    pub fn is_alive(&self) -> bool {
        self.state == ConnectionState::Registered
    }
}

/// Two-way map between broker sessions and backend connection ids.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<SessionId, Connection>,
    ids: HashMap<ConnectionId, SessionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted client. Returns false if the session is already known.
    pub fn begin(&mut self, client: Arc<dyn BrokerClient>) -> bool {
        let session = client.session_id();
        if self.sessions.contains_key(&session) {
            return false;
        }
        self.sessions.insert(
            session,
            Connection {
                client,
                state: ConnectionState::Unregistered,
                backend: None,
            },
        );
        true
    }

    /// Commit a backend registration if the session is still waiting for it.
    pub fn complete(&mut self, session: SessionId, backend: ClientConnection) -> Completion {
        let current = self
            .sessions
            .get(&session)
            .map(|entry| (entry.state, entry.backend.is_some()));

        match current {
            Some((ConnectionState::Unregistered, _)) => {
                if let Some(entry) = self.sessions.get_mut(&session) {
                    self.ids.insert(backend.id.clone(), session);
                    entry.backend = Some(backend);
                    entry.state = ConnectionState::Registered;
                }
                Completion::Registered
            }
            Some((ConnectionState::Closing, false)) => {
                self.sessions.remove(&session);
                Completion::Abandoned
            }
            _ => Completion::Abandoned,
        }
    }

    /// Drop a session whose registration failed.
    pub fn abort(&mut self, session: SessionId) {
        if let Some(entry) = self.sessions.get(&session) {
            if entry.backend.is_none() {
                self.sessions.remove(&session);
            }
        }
    }

    /// Start disconnect processing.
    ///
    /// Returns the backend context to release when the session was
    /// registered. A second call for the same session, or a call for a
    /// session still registering, returns `None`.
    pub fn begin_close(&mut self, session: SessionId) -> Option<ClientConnection> {
        let entry = self.sessions.get_mut(&session)?;
        match entry.state {
            ConnectionState::Registered => {
                entry.state = ConnectionState::Closing;
                entry.backend.clone()
            }
            ConnectionState::Unregistered => {
                entry.state = ConnectionState::Closing;
                None
            }
            ConnectionState::Closing => None,
        }
    }

    /// Forget a closed session once the backend released it.
    pub fn finish_close(&mut self, session: SessionId) {
        let closing = self
            .sessions
            .get(&session)
            .is_some_and(|entry| entry.state == ConnectionState::Closing);
        if !closing {
            return;
        }
        if let Some(entry) = self.sessions.remove(&session) {
            if let Some(backend) = entry.backend {
                self.ids.remove(&backend.id);
            }
        }
    }

    /// Backend id of a live session.
    pub fn resolve(&self, session: SessionId) -> Option<&ConnectionId> {
        self.sessions
            .get(&session)
            .filter(|entry| entry.is_alive())
            .and_then(|entry| entry.backend.as_ref())
            .map(|backend| &backend.id)
    }

    /// Broker client behind a live backend id.
    pub fn resolve_by_id(&self, id: &ConnectionId) -> Option<&Arc<dyn BrokerClient>> {
        self.ids
            .get(id)
            .and_then(|session| self.sessions.get(session))
            .filter(|entry| entry.is_alive())
            .map(|entry| &entry.client)
    }

    pub fn state(&self, session: SessionId) -> Option<ConnectionState> {
        self.sessions.get(&session).map(|entry| entry.state)
    }

    /// Whether a backend id belongs to a live session.
    pub fn is_live(&self, id: &ConnectionId) -> bool {
        self.resolve_by_id(id).is_some()
    }

    /// Number of live sessions.
    pub fn live_count(&self) -> usize {
        self.sessions.values().filter(|entry| entry.is_alive()).count()
    }

    /// Number of tracked sessions, whatever their state.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
