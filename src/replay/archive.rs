//! Replay archive ingestion
//!
//! An archive is an ordered set of tick-named records (one JSON document
//! per broadcast tick, as written by the history writer). Tick numbers
//! come from record names and must ascend. A gap between consecutive
//! records is logged (bots that process too slowly skip ticks) but never
//! aborts the load. Records are replayed into the timeline under a dense
//! 1-based index.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::net::protocol::{ActionRequest, TickSnapshot, ValidationResult};
use crate::replay::store::ReplayTimeline;
use crate::EntityId;

/// One broadcast tick's durable record for one client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickDataRecord {
    pub tick_info: TickSnapshot,
    #[serde(default)]
    pub actions: Vec<ActionRequest>,
    #[serde(default)]
    pub validations: Vec<ValidationResult>,
    /// The entity whose actions these are, when the client had one
    #[serde(default)]
    pub player_id: Option<EntityId>,
    /// Steps per broadcast tick at record time; overrides the configured
    /// rate during ingestion
    #[serde(default)]
    pub tick_rate: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive contains no tick-numbered records")]
    Empty,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid record '{name}': {source}")]
    InvalidRecord {
        name: String,
        source: serde_json::Error,
    },
}

/// A named record as read from an archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Source of archive entries (directory, zip, in-memory fixture)
pub trait ReplayArchive {
    fn read_entries(&mut self) -> Result<Vec<ArchiveEntry>, ArchiveError>;
}

/// Reads every `.json` record in one directory
pub struct DirectoryArchive {
    path: PathBuf,
}

impl DirectoryArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReplayArchive for DirectoryArchive {
    fn read_entries(&mut self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(&self.path)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") {
                continue;
            }
            entries.push(ArchiveEntry {
                bytes: std::fs::read(dir_entry.path())?,
                name,
            });
        }
        Ok(entries)
    }
}

/// Fixed set of records, for tests and embedded fixtures
pub struct MemoryArchive {
    entries: Vec<ArchiveEntry>,
}

impl MemoryArchive {
    pub fn new(entries: Vec<ArchiveEntry>) -> Self {
        Self { entries }
    }
}

impl ReplayArchive for MemoryArchive {
    fn read_entries(&mut self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        Ok(self.entries.clone())
    }
}

/// Extract the tick number from a record name: the last run of digits in
/// the file stem (`tick_00000150.json` → 150)
pub fn tick_number_from_name(name: &str) -> Option<i64> {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    let mut digits: Option<(usize, usize)> = None;
    let mut start = None;
    for (i, c) in stem.char_indices() {
        if c.is_ascii_digit() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            digits = Some((s, i));
        }
    }
    if let Some(s) = start {
        digits = Some((s, stem.len()));
    }
    let (s, e) = digits?;
    stem[s..e].parse().ok()
}

/// What one load produced
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSummary {
    pub records: usize,
    pub first_tick: i64,
    pub last_tick: i64,
    pub tick_rate: i64,
}

/// Replace the timeline's contents with one archive, strictly in
/// ascending tick order
pub fn load_archive(
    timeline: &mut ReplayTimeline,
    archive: &mut dyn ReplayArchive,
    default_tick_rate: i64,
) -> Result<ArchiveSummary, ArchiveError> {
    let mut numbered: Vec<(i64, ArchiveEntry)> = Vec::new();
    for entry in archive.read_entries()? {
        match tick_number_from_name(&entry.name) {
            Some(tick) => numbered.push((tick, entry)),
            None => warn!("Skipping archive entry with no tick number: {}", entry.name),
        }
    }
    if numbered.is_empty() {
        return Err(ArchiveError::Empty);
    }
    numbered.sort_by_key(|(tick, _)| *tick);

    timeline.reset();

    let first_tick = numbered[0].0;
    let last_tick = numbered[numbered.len() - 1].0;
    let mut tick_rate = default_tick_rate;
    let mut last_processed: Option<i64> = None;
    let mut index = 1;

    for (tick_number, entry) in numbered {
        if let Some(last) = last_processed {
            if tick_number != last + tick_rate {
                warn!(
                    "Tick info missing for tick(s) {} -> {}; ticks were skipped",
                    last + 1,
                    tick_number - 1
                );
            }
        }

        let record: TickDataRecord =
            serde_json::from_slice(&entry.bytes).map_err(|source| ArchiveError::InvalidRecord {
                name: entry.name.clone(),
                source,
            })?;

        if let Some(rate) = record.tick_rate {
            tick_rate = rate;
        }

        timeline.process_tick(index, &record.tick_info);
        if let Some(player_id) = record.player_id {
            timeline.process_action_data(index, player_id, &record.actions, &record.validations);
        }

        last_processed = Some(tick_number);
        index += 1;
    }

    let summary = ArchiveSummary {
        records: (index - 1) as usize,
        first_tick,
        last_tick,
        tick_rate,
    };
    info!(
        "Replay archive loaded: {} records, ticks {}..={}",
        summary.records, summary.first_tick, summary.last_tick
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::state::{EntityState, FIELD_ID, FIELD_POSITION, FIELD_TYPE};
    use serde_json::json;

    fn record(tick: i64, entity_id: EntityId, with_action: bool) -> TickDataRecord {
        let mut state = EntityState::new();
        state.insert(FIELD_ID, json!(entity_id));
        state.insert(FIELD_TYPE, json!("BotPlayer"));
        state.insert(FIELD_POSITION, json!({"x": tick as f32, "y": 0.0, "z": 0.0}));
        let mut snapshot = TickSnapshot {
            tick,
            scene_id: "arena".into(),
            entities: Default::default(),
        };
        snapshot.entities.insert(entity_id, state);

        TickDataRecord {
            tick_info: snapshot,
            actions: if with_action {
                vec![ActionRequest {
                    action: "teleport".into(),
                    input: Default::default(),
                    target_id: None,
                }]
            } else {
                Vec::new()
            },
            validations: Vec::new(),
            player_id: Some(entity_id),
            tick_rate: Some(50),
        }
    }

    fn entry(tick: i64, record: &TickDataRecord) -> ArchiveEntry {
        ArchiveEntry {
            name: format!("tick_{tick:08}.json"),
            bytes: serde_json::to_vec(record).unwrap(),
        }
    }

    #[test]
    fn test_tick_number_from_name() {
        assert_eq!(tick_number_from_name("tick_00000150.json"), Some(150));
        assert_eq!(tick_number_from_name("replay_data_50.json"), Some(50));
        assert_eq!(tick_number_from_name("history.json"), None);
        assert_eq!(tick_number_from_name("tick_5_part_250.json"), Some(250));
    }

    #[test]
    fn test_load_maps_archive_ticks_to_dense_index() {
        let mut timeline = ReplayTimeline::new();
        let records: Vec<ArchiveEntry> = [50, 100, 150]
            .iter()
            .map(|&t| entry(t, &record(t, 7, true)))
            .collect();

        let summary = load_archive(&mut timeline, &mut MemoryArchive::new(records), 50).unwrap();

        assert_eq!(summary.records, 3);
        assert_eq!(summary.first_tick, 50);
        assert_eq!(summary.last_tick, 150);

        let history = timeline.get(7).unwrap();
        assert_eq!(history.tick_count(), 3);
        assert!(history.tick_info(1).is_some());
        assert!(history.tick_info(2).is_some());
        assert!(history.tick_info(3).is_some());
        assert_eq!(history.tick_info(2).unwrap().actions.len(), 1);
    }

    #[test]
    fn test_entries_are_sorted_by_tick_number() {
        let mut timeline = ReplayTimeline::new();
        let records = vec![
            entry(100, &record(100, 7, false)),
            entry(50, &record(50, 7, false)),
        ];

        load_archive(&mut timeline, &mut MemoryArchive::new(records), 50).unwrap();

        // dense tick 1 is archive tick 50
        let history = timeline.get(7).unwrap();
        assert_eq!(history.tick_info(1).unwrap().state.position().unwrap().x, 50.0);
    }

    #[test]
    fn test_gap_does_not_abort_ingestion() {
        let mut timeline = ReplayTimeline::new();
        // tick 150 missing: logged, not fatal
        let records = vec![
            entry(50, &record(50, 7, false)),
            entry(100, &record(100, 7, false)),
            entry(200, &record(200, 7, false)),
        ];

        let summary = load_archive(&mut timeline, &mut MemoryArchive::new(records), 50).unwrap();
        assert_eq!(summary.records, 3);
        assert_eq!(timeline.get(7).unwrap().tick_count(), 3);
    }

    #[test]
    fn test_record_tick_rate_overrides_default() {
        let mut timeline = ReplayTimeline::new();
        let mut first = record(10, 7, false);
        first.tick_rate = Some(10);
        let records = vec![entry(10, &first), entry(20, &record(20, 7, false))];

        let summary = load_archive(&mut timeline, &mut MemoryArchive::new(records), 50).unwrap();
        // second record carries 50 again
        assert_eq!(summary.tick_rate, 50);
        assert_eq!(summary.records, 2);
    }

    #[test]
    fn test_empty_archive_is_an_error() {
        let mut timeline = ReplayTimeline::new();
        let result = load_archive(&mut timeline, &mut MemoryArchive::new(Vec::new()), 50);
        assert!(matches!(result, Err(ArchiveError::Empty)));
    }

    #[test]
    fn test_unnumbered_entries_are_skipped() {
        let mut timeline = ReplayTimeline::new();
        let records = vec![
            ArchiveEntry {
                name: "history.json".into(),
                bytes: b"not a record".to_vec(),
            },
            entry(50, &record(50, 7, false)),
        ];

        let summary = load_archive(&mut timeline, &mut MemoryArchive::new(records), 50).unwrap();
        assert_eq!(summary.records, 1);
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        let mut timeline = ReplayTimeline::new();
        let records = vec![ArchiveEntry {
            name: "tick_50.json".into(),
            bytes: b"{broken".to_vec(),
        }];

        let result = load_archive(&mut timeline, &mut MemoryArchive::new(records), 50);
        assert!(matches!(result, Err(ArchiveError::InvalidRecord { .. })));
    }

    #[test]
    fn test_directory_archive_reads_json_records() {
        let dir = std::env::temp_dir().join(format!("replay-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for tick in [50, 100] {
            std::fs::write(
                dir.join(format!("tick_{tick:08}.json")),
                serde_json::to_vec(&record(tick, 7, false)).unwrap(),
            )
            .unwrap();
        }
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let mut timeline = ReplayTimeline::new();
        let summary =
            load_archive(&mut timeline, &mut DirectoryArchive::new(&dir), 50).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(timeline.get(7).unwrap().tick_count(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reload_replaces_previous_archive() {
        let mut timeline = ReplayTimeline::new();
        load_archive(
            &mut timeline,
            &mut MemoryArchive::new(vec![entry(50, &record(50, 7, false))]),
            50,
        )
        .unwrap();
        load_archive(
            &mut timeline,
            &mut MemoryArchive::new(vec![entry(50, &record(50, 8, false))]),
            50,
        )
        .unwrap();

        assert!(timeline.get(7).is_none());
        assert!(timeline.get(8).is_some());
    }
}
