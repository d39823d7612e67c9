//! Agent bindings and bot spawning
//!
//! A binding authorizes a client to act through a set of entities. Binding
//! sets for distinct clients are disjoint, with one exception: the scene's
//! overlay entity is shared into a menu/persistent bot's binding, and a
//! human-controlled player spawned by such a bot is adopted into the same
//! binding during state gathering.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::net::protocol::{AgentSpawned, ServerPayload};
use crate::server::BotServer;
use crate::sim::scene::{SimScene, SpawnRequest};
use crate::{ClientId, EntityId};

/// Which entities each client may act through
#[derive(Default)]
pub struct AgentBindings {
    map: RwLock<HashMap<ClientId, HashSet<EntityId>>>,
}

impl AgentBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client to an empty set, populated later as entities spawn
    pub fn bind_empty(&self, client_id: ClientId) {
        self.map.write().insert(client_id, HashSet::new());
    }

    /// Bind a client directly to the overlay entity (menu/persistent bots)
    pub fn bind_overlay(&self, client_id: ClientId, overlay: EntityId) {
        let mut set = HashSet::new();
        set.insert(overlay);
        self.map.write().insert(client_id, set);
    }

    /// Add an entity to an existing binding; false when the client has no
    /// binding at all
    pub fn add_entity(&self, client_id: ClientId, entity_id: EntityId) -> bool {
        match self.map.write().get_mut(&client_id) {
            Some(set) => {
                set.insert(entity_id);
                true
            }
            None => false,
        }
    }

    /// Entities bound to a client; `None` when the client was never bound
    /// (a handshake-level invariant violation for connected clients)
    pub fn entities_for(&self, client_id: ClientId) -> Option<Vec<EntityId>> {
        self.map
            .read()
            .get(&client_id)
            .map(|set| set.iter().copied().collect())
    }

    /// First client whose binding contains the entity
    pub fn owner_of(&self, entity_id: EntityId) -> Option<ClientId> {
        self.map
            .read()
            .iter()
            .find(|(_, set)| set.contains(&entity_id))
            .map(|(client_id, _)| *client_id)
    }

    pub fn remove(&self, client_id: ClientId) -> Option<HashSet<EntityId>> {
        self.map.write().remove(&client_id)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.map.read().contains_key(&client_id)
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

/// A client waiting to have its entity spawned
#[derive(Debug, Clone)]
pub struct BotSeat {
    pub client_id: ClientId,
    pub bot_name: String,
    pub character_config: BTreeMap<String, Value>,
}

/// Seated-but-not-yet-spawned clients plus the entities spawned so far
#[derive(Default)]
pub struct SpawnQueue {
    pending: Mutex<VecDeque<BotSeat>>,
    spawned: RwLock<HashMap<ClientId, EntityId>>,
}

impl SpawnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seat(&self, seat: BotSeat) {
        self.pending.lock().push_back(seat);
    }

    pub fn drain_pending(&self) -> Vec<BotSeat> {
        self.pending.lock().drain(..).collect()
    }

    pub fn clear_pending(&self) {
        self.pending.lock().clear();
    }

    pub fn record(&self, client_id: ClientId, entity_id: EntityId) {
        self.spawned.write().insert(client_id, entity_id);
    }

    pub fn spawned_entity(&self, client_id: ClientId) -> Option<EntityId> {
        self.spawned.read().get(&client_id).copied()
    }

    pub fn take(&self, client_id: ClientId) -> Option<EntityId> {
        self.spawned.write().remove(&client_id)
    }

    pub fn take_all(&self) -> Vec<(ClientId, EntityId)> {
        self.spawned.write().drain().collect()
    }
}

impl BotServer {
    /// Acknowledge the handshake and queue the client for spawning on a
    /// later control task
    pub(crate) fn seat_bot(&self, seat: BotSeat) {
        if let Some(conn) = self.registry.get(seat.client_id) {
            debug!(
                "Sending handshake response to client id: {}",
                seat.client_id
            );
            conn.send_payload(&ServerPayload::Handshake(
                self.handshake_ack(seat.character_config.clone()),
            ));
        }
        self.spawns.seat(seat);
    }

    /// Spawn every seated client that is still connected, bind the new
    /// entity, and tell the client which entity is theirs
    pub(crate) fn spawn_pending_now(&self, scene: &mut dyn SimScene) {
        for seat in self.spawns.drain_pending() {
            let client_id = seat.client_id;
            if !self.is_client_connected(client_id) {
                debug!("Skipping spawn for disconnected client {}", client_id);
                continue;
            }

            let request = SpawnRequest {
                client_id,
                bot_name: seat.bot_name,
                character_config: seat.character_config,
            };
            match scene.spawn_agent(&request) {
                Ok(entity_id) => {
                    if !self.bindings.add_entity(client_id, entity_id) {
                        warn!(
                            "Spawned entity {} for client {} with no binding; binding fresh",
                            entity_id, client_id
                        );
                        self.bindings.bind_empty(client_id);
                        self.bindings.add_entity(client_id, entity_id);
                    }
                    self.spawns.record(client_id, entity_id);
                    info!("Sending entity id {} to client: {}", entity_id, client_id);
                    if let Some(conn) = self.registry.get(client_id) {
                        conn.send_payload(&ServerPayload::AgentSpawned(AgentSpawned { entity_id }));
                    }
                }
                Err(e) => {
                    error!("ERROR seating player for client {}: {e:#}", client_id);
                }
            }
        }
    }

    /// Remove a client's spawned entity from the scene, if any
    pub(crate) fn teardown_bot_now(&self, scene: &mut dyn SimScene, client_id: ClientId) {
        if let Some(entity_id) = self.spawns.take(client_id) {
            scene.despawn_agent(entity_id);
        }
    }

    /// End-of-run cleanup: anything still spawned is despawned and its
    /// connection ended; pending seats are dropped
    pub(crate) fn stop_spawned_now(&self, scene: &mut dyn SimScene) {
        for (client_id, entity_id) in self.spawns.take_all() {
            self.end_connection(client_id);
            scene.despawn_agent(entity_id);
        }
        self.spawns.clear_pending();
    }

    /// The entity spawned for a client, if one exists
    pub fn spawned_entity(&self, client_id: ClientId) -> Option<EntityId> {
        self.spawns.spawned_entity(client_id)
    }

    /// Enqueue a control task that spawns any pending seats (run must have
    /// started)
    pub fn request_spawn_pending(&self) {
        self.tasks.enqueue(
            crate::CONTROL_CLIENT,
            Box::new(|ctx| {
                let crate::server::tasks::TaskContext { server, scene } = &mut *ctx;
                if server.run_started() {
                    server.spawn_pending_now(&mut **scene);
                }
                Ok(())
            }),
        );
    }
}
