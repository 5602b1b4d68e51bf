//! Sync message schema.
//!
//! Every fog broadcast is a [`FogSyncData`] envelope carrying either a full
//! snapshot or a run-length delta against the sender's previous broadcast.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FogError, SyncError};
use crate::grid::{FogStateSnapshot, VISIBLE};
use crate::settings::FogSettings;

/// Version of the envelope layout. Bumped on incompatible changes.
pub const SCHEMA_VERSION: u16 = 1;

/// Broadcast event name fog envelopes are published under.
pub const FOG_UPDATE_EVENT: &str = "fog_update";

/// Broadcast event a peer sends when it needs a full snapshot.
pub const FOG_RESYNC_EVENT: &str = "fog_resync";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Last-write-wins ordering key: wall-clock time, then sender id as a tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp {
    pub at: u64,
    pub by: String,
}

/// A run of consecutive cells that all take `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRun {
    pub start: u32,
    pub len: u32,
    pub state: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FogPayload {
    Snapshot {
        snapshot: FogStateSnapshot,
    },
    /// Changes since the sender's previous broadcast of the map, stamped `base`.
    Delta {
        cols: u32,
        rows: u32,
        base: u64,
        runs: Vec<CellRun>,
    },
}

impl FogPayload {
    pub fn is_snapshot(&self) -> bool {
        matches!(self, FogPayload::Snapshot { .. })
    }
}

/// Transport envelope for one fog broadcast. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FogSyncData {
    pub schema: u16,
    pub session_id: String,
    pub map_id: String,
    pub payload: FogPayload,
    #[serde(default)]
    pub fog_settings: FogSettings,
    pub last_updated: u64,
    pub updated_by: String,
}

impl FogSyncData {
    pub fn stamp(&self) -> Stamp {
        Stamp {
            at: self.last_updated,
            by: self.updated_by.clone(),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, SyncError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode an envelope, rejecting schema versions this build does not speak.
    pub fn from_json(value: serde_json::Value) -> Result<Self, FogError> {
        let schema = value
            .get("schema")
            .and_then(|s| s.as_u64())
            .ok_or_else(|| FogError::Wire("missing schema version".into()))?;
        if schema != SCHEMA_VERSION as u64 {
            return Err(FogError::Wire(format!(
                "unsupported schema version {schema}, expected {SCHEMA_VERSION}"
            )));
        }
        serde_json::from_value(value).map_err(|e| FogError::Wire(e.to_string()))
    }
}

/// Ask peers for a full snapshot of one map, or of every map when `map_id` is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_id: Option<String>,
}

impl ResyncRequest {
    pub fn covers(&self, map_id: &str) -> bool {
        self.map_id.as_deref().map_or(true, |m| m == map_id)
    }
}

/// Runs of cells whose value in `new` differs from `old`.
///
/// Both buffers must have the same length; a length change calls for a snapshot.
pub fn diff_runs(old: &[u8], new: &[u8]) -> Vec<CellRun> {
    debug_assert_eq!(old.len(), new.len());
    let mut runs: Vec<CellRun> = Vec::new();
    for (i, (&before, &after)) in old.iter().zip(new).enumerate() {
        if before == after {
            continue;
        }
        let i = i as u32;
        match runs.last_mut() {
            Some(run) if run.start + run.len == i && run.state == after => run.len += 1,
            _ => runs.push(CellRun {
                start: i,
                len: 1,
                state: after,
            }),
        }
    }
    runs
}

/// Write `runs` into `cells`. All runs are validated before anything is written.
pub fn apply_runs(cells: &mut [u8], runs: &[CellRun]) -> Result<(), FogError> {
    for run in runs {
        if run.state > VISIBLE {
            return Err(FogError::UnknownCellState(run.state));
        }
        let end = run.start as usize + run.len as usize;
        if end > cells.len() {
            return Err(FogError::Wire(format!(
                "run {}..{} past end of {} cells",
                run.start,
                end,
                cells.len()
            )));
        }
    }
    for run in runs {
        let start = run.start as usize;
        cells[start..start + run.len as usize].fill(run.state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: FogPayload) -> FogSyncData {
        FogSyncData {
            schema: SCHEMA_VERSION,
            session_id: "s1".into(),
            map_id: "m1".into(),
            payload,
            fog_settings: FogSettings::default(),
            last_updated: 1_700_000_000_000,
            updated_by: "gm".into(),
        }
    }

    #[test]
    fn runs_merge_adjacent_equal_changes() {
        let old = [0, 0, 0, 2, 2, 1, 0];
        let new = [2, 2, 0, 1, 1, 1, 2];
        assert_eq!(
            diff_runs(&old, &new),
            vec![
                CellRun { start: 0, len: 2, state: 2 },
                CellRun { start: 3, len: 2, state: 1 },
                CellRun { start: 6, len: 1, state: 2 },
            ]
        );
        assert!(diff_runs(&new, &new).is_empty());
    }

    #[test]
    fn applying_diff_reproduces_target() {
        let old = vec![0, 1, 2, 2, 0, 0, 1, 1];
        let new = vec![2, 1, 1, 1, 0, 2, 2, 1];
        let mut cells = old.clone();
        apply_runs(&mut cells, &diff_runs(&old, &new)).unwrap();
        assert_eq!(cells, new);
    }

    #[test]
    fn bad_runs_leave_cells_untouched() {
        let mut cells = vec![0u8; 4];
        let runs = [
            CellRun { start: 0, len: 2, state: 2 },
            CellRun { start: 3, len: 2, state: 1 },
        ];
        assert!(apply_runs(&mut cells, &runs).is_err());
        assert_eq!(cells, vec![0; 4]);

        let runs = [CellRun { start: 0, len: 1, state: 9 }];
        assert!(matches!(
            apply_runs(&mut cells, &runs),
            Err(FogError::UnknownCellState(9))
        ));
    }

    #[test]
    fn payload_is_tagged_by_kind() {
        let data = envelope(FogPayload::Delta {
            cols: 2,
            rows: 2,
            base: 1_699_999_999_000,
            runs: vec![CellRun { start: 1, len: 1, state: 2 }],
        });
        let json = data.to_json().unwrap();
        assert_eq!(json["payload"]["kind"], "delta");
        assert_eq!(json["payload"]["base"], 1_699_999_999_000u64);
        assert_eq!(json["schema"], 1);
        assert_eq!(FogSyncData::from_json(json).unwrap(), data);
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let snapshot = FogStateSnapshot {
            cols: 1,
            rows: 1,
            cell_size: 1.0,
            buffer: vec![0],
        };
        let mut json = envelope(FogPayload::Snapshot { snapshot }).to_json().unwrap();
        json["schema"] = serde_json::json!(99);
        assert!(matches!(FogSyncData::from_json(json), Err(FogError::Wire(_))));

        assert!(FogSyncData::from_json(serde_json::json!({"kind": "snapshot"})).is_err());
    }

    #[test]
    fn resync_request_scope() {
        let all: ResyncRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(all.covers("cave"));
        let one = ResyncRequest {
            map_id: Some("cave".into()),
        };
        assert!(one.covers("cave"));
        assert!(!one.covers("keep"));
    }

    #[test]
    fn stamps_order_by_time_then_sender() {
        let a = Stamp { at: 10, by: "b".into() };
        let b = Stamp { at: 11, by: "a".into() };
        let c = Stamp { at: 11, by: "z".into() };
        assert!(a < b);
        assert!(b < c);
    }
}
