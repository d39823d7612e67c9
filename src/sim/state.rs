//! Entity state records and the core/custom merge policy
//!
//! An entity's broadcast state is an open, named-field record: a fixed set
//! of core fields the server computes (id, name, type, position, rotation,
//! isPlayer, clientId) merged with any number of custom field sets supplied
//! by state providers in the scene. Which custom fields may shadow a core
//! field is pure data (`MergePolicy`), not code.

use std::collections::BTreeMap;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::util::vec3::{Quat, Vec3};
use crate::{ClientId, EntityId};

pub const FIELD_ID: &str = "id";
pub const FIELD_NAME: &str = "name";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_POSITION: &str = "position";
pub const FIELD_ROTATION: &str = "rotation";
pub const FIELD_IS_PLAYER: &str = "isPlayer";
pub const FIELD_CLIENT_ID: &str = "clientId";

/// One entity's state as broadcast to clients and stored in replays.
///
/// Ordered mapping so serialized output is deterministic across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityState {
    fields: BTreeMap<String, Value>,
}

impl EntityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Keys currently present; used to snapshot the core field set before a
    /// merge so custom fields added mid-merge are not mistaken for core ones
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn id(&self) -> Option<EntityId> {
        self.fields.get(FIELD_ID).and_then(Value::as_i64)
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get(FIELD_NAME).and_then(Value::as_str)
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.fields.get(FIELD_TYPE).and_then(Value::as_str)
    }

    pub fn is_player(&self) -> bool {
        self.fields
            .get(FIELD_IS_PLAYER)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.fields.get(FIELD_CLIENT_ID).and_then(Value::as_i64)
    }

    pub fn set_client_id(&mut self, client_id: ClientId) {
        self.fields
            .insert(FIELD_CLIENT_ID.to_string(), Value::from(client_id));
    }

    /// Strongly-typed position accessor; `None` when the field is absent or
    /// not a well-formed vector
    pub fn position(&self) -> Option<Vec3> {
        self.fields
            .get(FIELD_POSITION)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn rotation(&self) -> Option<Quat> {
        self.fields
            .get(FIELD_ROTATION)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

/// One provider's contribution of custom fields for a single entity
#[derive(Debug, Clone)]
pub struct CustomStateSet {
    /// Provider name, used only for collision warnings
    pub provider: String,
    pub fields: BTreeMap<String, Value>,
}

impl CustomStateSet {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Which core fields a custom provider is allowed to shadow.
///
/// Everything not on the allow-list is core-wins: the custom value is
/// discarded with a warning.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    overridable: HashSet<String>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        let mut overridable = HashSet::new();
        overridable.insert(FIELD_POSITION.to_string());
        overridable.insert(FIELD_ROTATION.to_string());
        Self { overridable }
    }
}

impl MergePolicy {
    pub fn is_overridable(&self, key: &str) -> bool {
        self.overridable.contains(key)
    }
}

/// Merge custom field sets into a core state record under `policy`.
///
/// - a non-overridable core collision keeps the core value and warns
/// - an overridable core collision takes the custom value; a warning is
///   emitted only when more than one provider set the same field
/// - non-core custom fields merge in as-is (later providers overwrite)
pub fn merge_custom_sets(core: &mut EntityState, sets: &[CustomStateSet], policy: &MergePolicy) {
    let core_keys: HashSet<String> = core.keys().cloned().collect();
    let mut override_sources: hashbrown::HashMap<String, String> = hashbrown::HashMap::new();

    for set in sets {
        for (key, value) in &set.fields {
            if core_keys.contains(key.as_str()) {
                if policy.is_overridable(key) {
                    if let Some(first) = override_sources.get(key) {
                        warn!(
                            "State providers '{}' and '{}' both set '{}'; keeping value from '{}'",
                            first, set.provider, key, set.provider
                        );
                    }
                    override_sources.insert(key.clone(), set.provider.clone());
                    core.insert(key.clone(), value.clone());
                } else {
                    warn!(
                        "State provider '{}' attempted to override core field '{}'; ignoring",
                        set.provider, key
                    );
                }
            } else {
                core.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn core_state(id: EntityId) -> EntityState {
        let mut state = EntityState::new();
        state.insert(FIELD_ID, json!(id));
        state.insert(FIELD_TYPE, json!("BotPlayer"));
        state.insert(FIELD_IS_PLAYER, json!(true));
        state.insert(FIELD_CLIENT_ID, json!(77));
        state.insert(FIELD_POSITION, json!({"x": 1.0, "y": 2.0, "z": 3.0}));
        state
    }

    #[test]
    fn test_typed_accessors() {
        let state = core_state(42);
        assert_eq!(state.id(), Some(42));
        assert_eq!(state.entity_type(), Some("BotPlayer"));
        assert!(state.is_player());
        assert_eq!(state.client_id(), Some(77));
        assert_eq!(state.position(), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(state.rotation(), None);
    }

    #[test]
    fn test_core_field_never_overridden() {
        let mut state = core_state(42);
        let custom = CustomStateSet::new("cheater").with_field(FIELD_CLIENT_ID, json!(999));

        merge_custom_sets(&mut state, &[custom], &MergePolicy::default());

        assert_eq!(state.client_id(), Some(77));
    }

    #[test]
    fn test_overridable_field_takes_custom_value() {
        let mut state = core_state(42);
        let custom = CustomStateSet::new("physics")
            .with_field(FIELD_POSITION, json!({"x": 9.0, "y": 9.0, "z": 9.0}));

        merge_custom_sets(&mut state, &[custom], &MergePolicy::default());

        assert_eq!(state.position(), Some(Vec3::new(9.0, 9.0, 9.0)));
    }

    #[test]
    fn test_second_provider_wins_on_overridable_collision() {
        let mut state = core_state(42);
        let first = CustomStateSet::new("physics")
            .with_field(FIELD_POSITION, json!({"x": 9.0, "y": 9.0, "z": 9.0}));
        let second = CustomStateSet::new("ragdoll")
            .with_field(FIELD_POSITION, json!({"x": 5.0, "y": 5.0, "z": 5.0}));

        merge_custom_sets(&mut state, &[first, second], &MergePolicy::default());

        assert_eq!(state.position(), Some(Vec3::new(5.0, 5.0, 5.0)));
    }

    #[test]
    fn test_plain_custom_fields_merge_in() {
        let mut state = core_state(42);
        let custom = CustomStateSet::new("vitals")
            .with_field("health", json!(80))
            .with_field("mana", json!(20));

        merge_custom_sets(&mut state, &[custom], &MergePolicy::default());

        assert_eq!(state.get("health"), Some(&json!(80)));
        assert_eq!(state.get("mana"), Some(&json!(20)));
        // core fields untouched
        assert_eq!(state.id(), Some(42));
    }

    #[test]
    fn test_serde_transparent_map() {
        let state = core_state(1);
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.is_object());
        assert_eq!(json["type"], json!("BotPlayer"));

        let back: EntityState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
