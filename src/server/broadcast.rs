//! Tick snapshot gathering and broadcast
//!
//! Every `tick_rate` simulation steps the driver asks for one full
//! snapshot: all trackable entities are walked once, core fields are
//! merged with custom provider sets, and player entities get the owning
//! client's id stamped in. The snapshot is serialized once; each client is
//! then tried in turn and a failed send never aborts the pass.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::net::protocol::{PreparedTick, TickSnapshot};
use crate::server::BotServer;
use crate::sim::scene::SimScene;
use crate::sim::state::merge_custom_sets;
use crate::ClientId;

impl BotServer {
    /// Walk the scene and assemble one immutable snapshot for `tick`
    pub fn gather_snapshot(&self, tick: i64, scene: &dyn SimScene) -> TickSnapshot {
        let overlay_id = scene.overlay_entity();
        let mut snapshot = TickSnapshot {
            tick,
            scene_id: scene.scene_id(),
            entities: Default::default(),
        };

        for source in scene.gather_entities() {
            let entity_id = source.core.id;
            let is_player = source.core.is_player;
            let mut state = source.core.into_state();

            if is_player {
                match self.bindings.owner_of(entity_id) {
                    Some(owner) => state.set_client_id(owner),
                    None => {
                        // a player nobody owns was spawned by a menu bot
                        // holding the overlay entity; hand the player to
                        // that client and adopt the entity into its
                        // binding so its actions reach the player
                        if let Some(menu_client) = self.bindings.owner_of(overlay_id) {
                            state.set_client_id(menu_client);
                            if entity_id != overlay_id {
                                self.bindings.add_entity(menu_client, entity_id);
                            }
                        }
                    }
                }
            }

            merge_custom_sets(&mut state, &source.custom, &self.merge_policy);
            snapshot.entities.insert(entity_id, state);
        }

        snapshot
    }

    /// Gather, serialize once, and try-send to every connected client.
    /// Individual send failures are recorded and skipped; the pass never
    /// raises to its caller.
    pub fn broadcast_tick(&self, tick: i64, scene: &dyn SimScene) {
        if self.registry.is_empty() {
            return;
        }

        let snapshot = self.gather_snapshot(tick, scene);
        let entity_count = snapshot.entities.len();
        let prepared = match PreparedTick::new(snapshot) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Failed to serialize tick snapshot: {}", e);
                return;
            }
        };

        let mut sent_to: SmallVec<[ClientId; 8]> = SmallVec::new();
        for (client_id, conn) in self.registry.snapshot() {
            if conn.send_tick(&prepared) {
                sent_to.push(client_id);
            }
        }

        if !sent_to.is_empty() {
            debug!(
                "Sent tick {} state from {} entities to clients: {:?}",
                tick, entity_count, sent_to
            );
        }

        self.flush_tick_activity(prepared.snapshot());
    }
}
