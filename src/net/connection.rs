//! Client connection records, the connection registry, and per-client
//! published status
//!
//! The registry is the sole owner of `Connection` records: a connection is
//! created on admission and destroyed on teardown, and registration is
//! idempotent (first registration wins) so duplicate admission attempts are
//! harmless.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::net::protocol::{Lifecycle, PreparedTick, ServerPayload};
use crate::net::transport::BotTransport;
use crate::ClientId;

/// Where a bot runs relative to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// In-process bot runtime
    Local,
    /// Out-of-process bot reached over TCP
    Remote,
}

/// Published lifecycle state of one bot client.
///
/// `Unknown` doubles as the answer for ids that were never registered and
/// ids that have been torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BotStatus {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Running,
    TearingDown,
}

/// One bot client's connection record
pub struct Connection {
    pub client_id: ClientId,
    pub kind: ConnectionKind,
    lifecycle: RwLock<Lifecycle>,
    /// Token the client minted for us during handshake, echoed in every
    /// outbound envelope
    token: RwLock<String>,
    transport: Arc<dyn BotTransport>,
}

impl Connection {
    pub fn new(client_id: ClientId, kind: ConnectionKind, transport: Arc<dyn BotTransport>) -> Self {
        Self {
            client_id,
            kind,
            lifecycle: RwLock::new(Lifecycle::default()),
            token: RwLock::new(String::new()),
            transport,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.write() = lifecycle;
    }

    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: String) {
        *self.token.write() = token;
    }

    pub fn transport(&self) -> &Arc<dyn BotTransport> {
        &self.transport
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }

    pub fn send_tick(&self, tick: &PreparedTick) -> bool {
        self.transport.send_tick(&self.token(), tick)
    }

    pub fn send_payload(&self, payload: &ServerPayload) -> bool {
        self.transport.send_payload(&self.token(), payload)
    }

    pub fn send_teardown(&self) -> bool {
        self.send_payload(&ServerPayload::Teardown)
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

type StatusListener = Arc<dyn Fn(BotStatus) + Send + Sync>;

/// Per-client published status plus change listeners.
///
/// Listeners are additive, receive every subsequent transition, and are
/// discarded when the client is torn down. They are invoked synchronously
/// and must be cheap and thread-safe.
#[derive(Default)]
pub struct StatusBoard {
    states: RwLock<HashMap<ClientId, BotStatus>>,
    listeners: RwLock<HashMap<ClientId, Vec<StatusListener>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, client_id: ClientId) -> BotStatus {
        self.states
            .read()
            .get(&client_id)
            .copied()
            .unwrap_or(BotStatus::Unknown)
    }

    /// Publish a status. Transitioning to the current status is a no-op and
    /// listeners are not re-notified.
    pub fn set_status(&self, client_id: ClientId, status: BotStatus) {
        {
            let mut states = self.states.write();
            match states.get(&client_id) {
                Some(current) if *current == status => return,
                _ => {
                    states.insert(client_id, status);
                }
            }
        }

        let listeners: Vec<StatusListener> = self
            .listeners
            .read()
            .get(&client_id)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        for listener in listeners {
            listener(status);
        }
    }

    pub fn add_listener(
        &self,
        client_id: ClientId,
        listener: impl Fn(BotStatus) + Send + Sync + 'static,
    ) {
        self.listeners
            .write()
            .entry(client_id)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Forget a client entirely: status reverts to `Unknown` and its
    /// listeners are discarded
    pub fn remove_client(&self, client_id: ClientId) {
        self.states.write().remove(&client_id);
        self.listeners.write().remove(&client_id);
    }

    pub fn clear(&self) {
        self.states.write().clear();
        self.listeners.write().clear();
    }
}

/// Owns the set of active connections keyed by client id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ClientId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent registration: if the id already exists the existing
    /// record is returned and `make` is never called
    pub fn add_with(
        &self,
        client_id: ClientId,
        make: impl FnOnce() -> Connection,
    ) -> Arc<Connection> {
        self.connections
            .write()
            .entry(client_id)
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    pub fn get(&self, client_id: ClientId) -> Option<Arc<Connection>> {
        self.connections.read().get(&client_id).cloned()
    }

    pub fn remove(&self, client_id: ClientId) -> Option<Arc<Connection>> {
        self.connections.write().remove(&client_id)
    }

    /// Stable snapshot of current client ids; enumeration during teardown
    /// must not observe concurrent registrations
    pub fn ids(&self) -> Vec<ClientId> {
        self.connections.read().keys().copied().collect()
    }

    /// Snapshot of (id, connection) pairs for iteration outside the lock
    pub fn snapshot(&self) -> Vec<(ClientId, Arc<Connection>)> {
        self.connections
            .read()
            .iter()
            .map(|(id, conn)| (*id, conn.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn clear(&self) {
        self.connections.write().clear();
    }
}
