//! The simulation collaborator surface
//!
//! The server core never touches scene internals; an embedding simulation
//! implements `SimScene` and all mutation happens through it, on the
//! simulation thread only.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::net::protocol::ActionRequest;
use crate::sim::state::{
    CustomStateSet, EntityState, FIELD_ID, FIELD_IS_PLAYER, FIELD_NAME, FIELD_POSITION,
    FIELD_ROTATION, FIELD_TYPE,
};
use crate::util::vec3::{Quat, Vec3};
use crate::{ClientId, EntityId};

/// The deterministic server-computed portion of one entity's state
#[derive(Debug, Clone)]
pub struct CoreEntityState {
    pub id: EntityId,
    pub name: String,
    pub entity_type: String,
    pub position: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub is_player: bool,
}

impl CoreEntityState {
    /// Build the core state record; clientId is filled in later by the
    /// broadcaster from the agent bindings
    pub fn into_state(self) -> EntityState {
        let mut state = EntityState::new();
        state.insert(FIELD_ID, Value::from(self.id));
        state.insert(FIELD_NAME, Value::from(self.name));
        state.insert(FIELD_TYPE, Value::from(self.entity_type));
        state.insert(FIELD_IS_PLAYER, Value::from(self.is_player));
        if let Some(position) = self.position {
            state.insert(
                FIELD_POSITION,
                serde_json::to_value(position).unwrap_or(Value::Null),
            );
        }
        if let Some(rotation) = self.rotation {
            state.insert(
                FIELD_ROTATION,
                serde_json::to_value(rotation).unwrap_or(Value::Null),
            );
        }
        state
    }
}

/// One trackable entity as the scene reports it during state gathering:
/// core fields plus zero or more custom field sets from state providers
#[derive(Debug, Clone)]
pub struct EntityStateSource {
    pub core: CoreEntityState,
    pub custom: Vec<CustomStateSet>,
}

/// Everything the scene needs to spawn an entity for a client
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub client_id: ClientId,
    pub bot_name: String,
    pub character_config: BTreeMap<String, Value>,
}

/// Contract between the server core and the live simulation.
///
/// Called exclusively from the simulation thread.
pub trait SimScene: Send {
    /// Identifier of the currently active scene, stamped on snapshots
    fn scene_id(&self) -> String;

    /// Walk all trackable entities once and report their state sources
    fn gather_entities(&self) -> Vec<EntityStateSource>;

    /// The single pre-existing human-controlled entity that menu/persistent
    /// bots are bound to
    fn overlay_entity(&self) -> EntityId;

    /// Spawn a controllable entity for a client
    fn spawn_agent(&mut self, request: &SpawnRequest) -> anyhow::Result<EntityId>;

    /// Remove a previously spawned entity; must tolerate ids that are
    /// already gone
    fn despawn_agent(&mut self, entity_id: EntityId);

    /// Look up `request.action`'s handler on the entity and invoke it.
    /// Returns false when the entity has no handler for that action name;
    /// the caller drops the request silently in that case.
    fn perform_action(&mut self, entity_id: EntityId, request: &ActionRequest) -> bool;
}
