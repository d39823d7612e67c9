//! A minimal built-in scene
//!
//! Lets the server run and be tested end to end without an embedding
//! simulation: entities are plain records with positions, bot players can
//! be spawned and despawned, and a couple of action handlers (`teleport`,
//! `emote`) exercise the dispatch path.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use rand::Rng;
use serde_json::Value;

use crate::net::protocol::ActionRequest;
use crate::sim::scene::{CoreEntityState, EntityStateSource, SimScene, SpawnRequest};
use crate::sim::state::CustomStateSet;
use crate::util::vec3::{Quat, Vec3};
use crate::EntityId;

type ProviderFn = Box<dyn Fn(EntityId) -> Option<CustomStateSet> + Send>;

struct HeadlessEntity {
    id: EntityId,
    name: String,
    entity_type: String,
    position: Vec3,
    rotation: Quat,
    is_player: bool,
    extra: BTreeMap<String, Value>,
}

pub struct HeadlessScene {
    id: String,
    entities: HashMap<EntityId, HeadlessEntity>,
    providers: Vec<ProviderFn>,
    next_id: EntityId,
    overlay: EntityId,
    spawn_point: Vec3,
}

impl HeadlessScene {
    pub fn new(id: impl Into<String>) -> Self {
        let mut scene = Self {
            id: id.into(),
            entities: HashMap::new(),
            providers: Vec::new(),
            next_id: 2,
            overlay: 1,
            spawn_point: Vec3::ZERO,
        };
        scene.entities.insert(
            scene.overlay,
            HeadlessEntity {
                id: scene.overlay,
                name: "overlay".into(),
                entity_type: "Overlay".into(),
                position: Vec3::ZERO,
                rotation: Quat::IDENTITY,
                is_player: false,
                extra: BTreeMap::new(),
            },
        );
        scene
    }

    /// Register an extra state provider consulted for every entity during
    /// gathering
    pub fn add_state_provider(
        &mut self,
        provider: impl Fn(EntityId) -> Option<CustomStateSet> + Send + 'static,
    ) {
        self.providers.push(Box::new(provider));
    }

    /// Spawn a named bot player directly (tests and tools)
    pub fn spawn_named(&mut self, name: &str) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;
        let jitter = rand::thread_rng().gen_range(-5.0..5.0);
        self.entities.insert(
            id,
            HeadlessEntity {
                id,
                name: name.to_string(),
                entity_type: "BotPlayer".into(),
                position: self.spawn_point + Vec3::new(jitter, 0.0, 0.0),
                rotation: Quat::IDENTITY,
                is_player: true,
                extra: BTreeMap::new(),
            },
        );
        id
    }

    pub fn position_of(&self, entity_id: EntityId) -> Option<Vec3> {
        self.entities.get(&entity_id).map(|e| e.position)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn teleport(entity: &mut HeadlessEntity, input: &BTreeMap<String, Value>) {
        let component = |key: &str, current: f32| {
            input
                .get(key)
                .and_then(Value::as_f64)
                .map(|v| v as f32)
                .unwrap_or(current)
        };
        entity.position = Vec3::new(
            component("x", entity.position.x),
            component("y", entity.position.y),
            component("z", entity.position.z),
        );
    }
}

impl SimScene for HeadlessScene {
    fn scene_id(&self) -> String {
        self.id.clone()
    }

    fn gather_entities(&self) -> Vec<EntityStateSource> {
        self.entities
            .values()
            .map(|entity| {
                let mut custom: Vec<CustomStateSet> = self
                    .providers
                    .iter()
                    .filter_map(|provider| provider(entity.id))
                    .collect();
                if !entity.extra.is_empty() {
                    custom.push(CustomStateSet {
                        provider: "scene".into(),
                        fields: entity.extra.clone(),
                    });
                }
                EntityStateSource {
                    core: CoreEntityState {
                        id: entity.id,
                        name: entity.name.clone(),
                        entity_type: entity.entity_type.clone(),
                        position: Some(entity.position),
                        rotation: Some(entity.rotation),
                        is_player: entity.is_player,
                    },
                    custom,
                }
            })
            .collect()
    }

    fn overlay_entity(&self) -> EntityId {
        self.overlay
    }

    fn spawn_agent(&mut self, request: &SpawnRequest) -> anyhow::Result<EntityId> {
        Ok(self.spawn_named(&request.bot_name))
    }

    fn despawn_agent(&mut self, entity_id: EntityId) {
        self.entities.remove(&entity_id);
    }

    fn perform_action(&mut self, entity_id: EntityId, request: &ActionRequest) -> bool {
        let Some(entity) = self.entities.get_mut(&entity_id) else {
            return false;
        };
        match request.action.as_str() {
            "teleport" => {
                Self::teleport(entity, &request.input);
                true
            }
            "emote" => {
                let emote = request
                    .input
                    .get("name")
                    .cloned()
                    .unwrap_or(Value::String("wave".into()));
                entity.extra.insert("emote".into(), emote);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(action: &str, input: &[(&str, Value)]) -> ActionRequest {
        ActionRequest {
            action: action.into(),
            input: input
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            target_id: None,
        }
    }

    #[test]
    fn test_scene_starts_with_overlay_only() {
        let scene = HeadlessScene::new("menu");
        assert_eq!(scene.entity_count(), 1);
        assert!(scene.position_of(scene.overlay_entity()).is_some());
    }

    #[test]
    fn test_spawn_and_despawn() {
        let mut scene = HeadlessScene::new("arena");
        let id = scene.spawn_named("runner");
        assert_eq!(scene.entity_count(), 2);

        scene.despawn_agent(id);
        assert_eq!(scene.entity_count(), 1);
        // despawning an id that is already gone is tolerated
        scene.despawn_agent(id);
    }

    #[test]
    fn test_teleport_handler() {
        let mut scene = HeadlessScene::new("arena");
        let id = scene.spawn_named("runner");

        let handled = scene.perform_action(
            id,
            &request("teleport", &[("x", json!(3.0)), ("y", json!(4.0)), ("z", json!(5.0))]),
        );

        assert!(handled);
        assert_eq!(scene.position_of(id).unwrap(), Vec3::new(3.0, 4.0, 5.0));
    }

    #[test]
    fn test_unknown_action_reports_unhandled() {
        let mut scene = HeadlessScene::new("arena");
        let id = scene.spawn_named("runner");
        assert!(!scene.perform_action(id, &request("fly", &[])));
        assert!(!scene.perform_action(999, &request("teleport", &[])));
    }

    #[test]
    fn test_emote_shows_up_in_gathered_state() {
        let mut scene = HeadlessScene::new("arena");
        let id = scene.spawn_named("runner");
        scene.perform_action(id, &request("emote", &[("name", json!("dance"))]));

        let sources = scene.gather_entities();
        let source = sources.iter().find(|s| s.core.id == id).unwrap();
        assert_eq!(source.custom.len(), 1);
        assert_eq!(source.custom[0].fields["emote"], json!("dance"));
    }
}
