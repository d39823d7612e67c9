//! Tick-indexed replay timeline
//!
//! Per-entity sparse history: a growable positional array indexed by tick
//! (1-based) where a `None` entry means the entity was absent that tick.
//! Spawn and despawn are derived by diffing adjacent entries, never stored
//! as events, which is why this must stay a positional array rather than a
//! map keyed by tick: the queries depend on O(1) lookbehind.
//!
//! Records are created lazily on first ingestion, grow monotonically for
//! the life of one loaded archive, and are discarded wholesale on `reset`.

use hashbrown::HashMap;

use crate::net::protocol::{ActionRequest, TickSnapshot, ValidationResult};
use crate::sim::state::EntityState;
use crate::util::vec3::Vec3;
use crate::EntityId;

/// Everything known about one entity at one tick it was present
#[derive(Debug, Clone, Default)]
pub struct TickInfo {
    pub state: EntityState,
    pub actions: Vec<ActionRequest>,
    pub validations: Vec<ValidationResult>,
}

/// Visualization defaults for one entity's record
#[derive(Debug, Clone)]
pub struct RecordFlags {
    pub enabled: bool,
    pub show_path: bool,
    pub show_actions: bool,
    pub show_highlight: bool,
}

impl Default for RecordFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            show_path: false,
            show_actions: false,
            show_highlight: false,
        }
    }
}

/// One entity's tick-indexed history
#[derive(Debug, Clone)]
pub struct EntityHistory {
    pub entity_id: EntityId,
    pub display_name: String,
    /// Type tags observed for this entity, first-seen order
    pub types: Vec<String>,
    pub is_player: bool,
    pub flags: RecordFlags,
    tick_info: Vec<Option<TickInfo>>,
}

impl EntityHistory {
    fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            display_name: format!("entity_{entity_id}"),
            types: Vec::new(),
            is_player: false,
            flags: RecordFlags::default(),
            tick_info: Vec::new(),
        }
    }

    /// Number of ticks this record spans (highest tick ingested)
    pub fn tick_count(&self) -> i64 {
        self.tick_info.len() as i64
    }

    /// The entry for a 1-based tick; `None` for gaps and out-of-range
    /// ticks alike
    pub fn tick_info(&self, tick: i64) -> Option<&TickInfo> {
        if tick < 1 || tick > self.tick_count() {
            return None;
        }
        self.tick_info[(tick - 1) as usize].as_ref()
    }

    pub fn primary_type(&self) -> Option<&str> {
        self.types.first().map(String::as_str)
    }

    /// Grow the sparse array with explicit absent markers up to `tick` and
    /// return that tick's entry, creating it if the slot was a gap
    fn ensure_tick(&mut self, tick: i64) -> &mut TickInfo {
        assert!(tick >= 1, "ticks are 1-based");
        while self.tick_info.len() < tick as usize {
            self.tick_info.push(None);
        }
        self.tick_info[(tick - 1) as usize].get_or_insert_with(TickInfo::default)
    }

    fn update_identity(&mut self, state: &EntityState) {
        self.is_player = state.is_player();
        if let Some(entity_type) = state.entity_type() {
            if !self.types.iter().any(|t| t == entity_type) {
                self.types.push(entity_type.to_string());
            }
        }
        if let Some(name) = state.name() {
            self.display_name = name.to_string();
        } else if let Some(entity_type) = state.entity_type() {
            self.display_name = format!("{}_{}", entity_type, self.entity_id);
        }
    }
}

/// Point-in-time view of one entity
#[derive(Debug, Clone, Copy)]
pub struct TickQuery<'a> {
    pub record: &'a EntityHistory,
    pub tick_info: Option<&'a TickInfo>,
    pub just_spawned: bool,
    pub just_despawned: bool,
}

/// The whole replay: per-entity histories for one loaded archive
#[derive(Default)]
pub struct ReplayTimeline {
    entities: HashMap<EntityId, EntityHistory>,
}

impl ReplayTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard every record; called before loading a new archive
    pub fn reset(&mut self) {
        self.entities.clear();
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityHistory> {
        self.entities.values()
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&EntityHistory> {
        self.entities.get(&entity_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn ensure_record(&mut self, entity_id: EntityId) -> &mut EntityHistory {
        self.entities
            .entry(entity_id)
            .or_insert_with(|| EntityHistory::new(entity_id))
    }

    /// Ingest one tick's snapshot: every present entity gets its state set
    /// for `tick` and its cached identity fields refreshed. Ticks must
    /// arrive in ascending order; entries below the current tick are never
    /// rewritten by snapshots from later ticks.
    pub fn process_tick(&mut self, tick: i64, snapshot: &TickSnapshot) {
        for (&entity_id, state) in &snapshot.entities {
            let record = self.ensure_record(entity_id);
            record.update_identity(state);
            record.ensure_tick(tick).state = state.clone();
        }
    }

    /// Merge one entity's recorded actions/validations into a tick. An
    /// entity with a non-empty action list is assumed interesting enough
    /// to visualize: it is marked as a player and its path/action overlays
    /// default on.
    pub fn process_action_data(
        &mut self,
        tick: i64,
        entity_id: EntityId,
        actions: &[ActionRequest],
        validations: &[ValidationResult],
    ) {
        let record = self.ensure_record(entity_id);
        let info = record.ensure_tick(tick);
        info.actions = actions.to_vec();
        info.validations = validations.to_vec();

        if !actions.is_empty() {
            record.is_player = true;
            record.flags.show_path = true;
            record.flags.show_actions = true;
            record.flags.show_highlight = true;
        }
    }

    /// Point-in-time query with spawn/despawn detection.
    ///
    /// `just_spawned` holds when the entity is present at `tick` and was
    /// absent the tick before. `just_despawned` is intentionally checked
    /// against `tick - 2`, so a despawn is reported one tick later than
    /// the first absent tick; this matches the recorded behavior the
    /// external visualizer is built around.
    pub fn info_for_tick(&self, tick: i64, entity_id: EntityId) -> Option<TickQuery<'_>> {
        if tick < 1 {
            return None;
        }
        let record = self.entities.get(&entity_id)?;
        let tick_info = record.tick_info(tick);

        let just_spawned = tick_info.is_some() && (tick < 2 || record.tick_info(tick - 1).is_none());
        let just_despawned = tick_info.is_none()
            && tick > 1
            && tick - 2 >= 1
            && tick - 2 <= record.tick_count()
            && record.tick_info(tick - 2).is_some();

        Some(TickQuery {
            record,
            tick_info,
            just_spawned,
            just_despawned,
        })
    }

    /// The entity's contiguous path up to and including `tick`, oldest
    /// first: walk backward while entries are present and carry positions,
    /// stop at the first gap or the start of the record. Empty when the
    /// entity is absent at `tick`. Recomputed from scratch per call.
    pub fn path_for_entity(&self, tick: i64, entity_id: EntityId) -> Vec<Vec3> {
        let Some(record) = self.entities.get(&entity_id) else {
            return Vec::new();
        };
        if record.tick_info(tick).is_none() {
            return Vec::new();
        }

        let mut path = Vec::new();
        let mut current = tick;
        while current >= 1 {
            let Some(info) = record.tick_info(current) else {
                break;
            };
            let Some(position) = info.state.position() else {
                break;
            };
            path.push(position);
            current -= 1;
        }
        path.reverse();
        path
    }
}
