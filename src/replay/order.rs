//! Presentation ordering for replay entities
//!
//! The tie-break chain for listing entities at a given tick: entities
//! present at the tick come first; within the same presence status,
//! entities of the same type sort by ascending absolute id with positive
//! ids grouped before negative ones; across types, players come before
//! non-players, then type names sort lexicographically with untyped
//! entities last.

use std::cmp::Ordering;

use crate::replay::store::{EntityHistory, ReplayTimeline, TickInfo};

pub fn presentation_order(
    a: &EntityHistory,
    a_info: Option<&TickInfo>,
    b: &EntityHistory,
    b_info: Option<&TickInfo>,
) -> Ordering {
    match (a_info.is_some(), b_info.is_some()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    if a.primary_type() == b.primary_type() {
        // group positive ids before negative, ascending as though unsigned
        match (a.entity_id >= 0, b.entity_id >= 0) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        return a.entity_id.abs().cmp(&b.entity_id.abs());
    }

    match (a.is_player, b.is_player) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    match (a.primary_type(), b.primary_type()) {
        (Some(a_type), Some(b_type)) => a_type.cmp(b_type),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// All records ordered for presentation at `tick`
pub fn sorted_for_tick(timeline: &ReplayTimeline, tick: i64) -> Vec<&EntityHistory> {
    let mut rows: Vec<(&EntityHistory, Option<&TickInfo>)> = timeline
        .entities()
        .map(|record| (record, record.tick_info(tick)))
        .collect();
    rows.sort_by(|(a, a_info), (b, b_info)| presentation_order(a, *a_info, b, *b_info));
    rows.into_iter().map(|(record, _)| record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::TickSnapshot;
    use crate::sim::state::{EntityState, FIELD_ID, FIELD_IS_PLAYER, FIELD_TYPE};
    use crate::EntityId;
    use serde_json::json;

    fn state(id: EntityId, entity_type: Option<&str>, is_player: bool) -> EntityState {
        let mut state = EntityState::new();
        state.insert(FIELD_ID, json!(id));
        if let Some(entity_type) = entity_type {
            state.insert(FIELD_TYPE, json!(entity_type));
        }
        state.insert(FIELD_IS_PLAYER, json!(is_player));
        state
    }

    fn timeline_with(entries: &[(EntityId, Option<&str>, bool, &[i64])]) -> ReplayTimeline {
        let mut timeline = ReplayTimeline::new();
        for (id, entity_type, is_player, ticks) in entries {
            for tick in *ticks {
                let mut snapshot = TickSnapshot {
                    tick: *tick,
                    scene_id: "test".into(),
                    entities: Default::default(),
                };
                snapshot
                    .entities
                    .insert(*id, state(*id, *entity_type, *is_player));
                timeline.process_tick(*tick, &snapshot);
            }
        }
        timeline
    }

    fn ids_at(timeline: &ReplayTimeline, tick: i64) -> Vec<EntityId> {
        sorted_for_tick(timeline, tick)
            .iter()
            .map(|r| r.entity_id)
            .collect()
    }

    #[test]
    fn test_present_entities_sort_first() {
        let timeline = timeline_with(&[
            (1, Some("Crate"), false, &[1]),
            (2, Some("Crate"), false, &[1, 2]),
        ]);
        assert_eq!(ids_at(&timeline, 2), vec![2, 1]);
    }

    #[test]
    fn test_same_type_groups_positive_before_negative() {
        let timeline = timeline_with(&[
            (-3, Some("Crate"), false, &[1]),
            (2, Some("Crate"), false, &[1]),
            (-2, Some("Crate"), false, &[1]),
            (3, Some("Crate"), false, &[1]),
        ]);
        assert_eq!(ids_at(&timeline, 1), vec![2, 3, -2, -3]);
    }

    #[test]
    fn test_players_sort_before_non_players() {
        let timeline = timeline_with(&[
            (1, Some("Crate"), false, &[1]),
            (2, Some("BotPlayer"), true, &[1]),
        ]);
        assert_eq!(ids_at(&timeline, 1), vec![2, 1]);
    }

    #[test]
    fn test_types_sort_lexicographically_untyped_last() {
        let timeline = timeline_with(&[
            (1, None, false, &[1]),
            (2, Some("Wall"), false, &[1]),
            (3, Some("Crate"), false, &[1]),
        ]);
        assert_eq!(ids_at(&timeline, 1), vec![3, 2, 1]);
    }

    #[test]
    fn test_presence_outranks_player_status() {
        let timeline = timeline_with(&[
            (1, Some("BotPlayer"), true, &[1]),
            (2, Some("Crate"), false, &[1, 2]),
        ]);
        assert_eq!(ids_at(&timeline, 2), vec![2, 1]);
    }
}
