//! Conflict detection and resolution between two replicas of a record.
//!
//! Everything here is pure: the resolver only decides, the caller applies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConflictError;
use crate::sync::{AckOutcome, Operation, RemoteChange, RemoteRow, SyncMeta, SyncPayload, SyncRecord};

/// How to settle diverged replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    LocalWins,
    RemoteWins,
    Manual,
    /// Field-level union; differing fields take the last-write-wins side.
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last-write-wins",
            Self::LocalWins => "local-wins",
            Self::RemoteWins => "remote-wins",
            Self::Manual => "manual",
            Self::Merge => "merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last-write-wins" => Some(Self::LastWriteWins),
            "local-wins" => Some(Self::LocalWins),
            "remote-wins" => Some(Self::RemoteWins),
            "manual" => Some(Self::Manual),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

/// Two diverged copies of the same record.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub local: SyncPayload,
    pub remote: SyncPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Winner,
    /// The record the caller should store.
    pub merged_data: SyncPayload,
}

/// True iff the replicas carry different versions.
///
/// Equal versions are treated as equal content even when payloads differ.
pub fn detect_conflict<L, R>(local: &L, remote: &R) -> bool
where
    L: SyncRecord + ?Sized,
    R: SyncRecord + ?Sized,
{
    local.sync_meta().sync_version != remote.sync_meta().sync_version
}

/// Last-write-wins comparison. The remote copy wins exact ties.
pub fn last_write_winner(local: &SyncMeta, remote: &SyncMeta) -> Winner {
    if local.last_modified_at > remote.last_modified_at {
        Winner::Local
    } else {
        Winner::Remote
    }
}

/// Whether the cloud should take `incoming` over what it already stores.
///
/// The stored copy wins ties, so replaying a push is a no-op.
pub fn remote_accepts(existing: Option<&SyncMeta>, incoming: &SyncMeta) -> bool {
    match existing {
        None => true,
        Some(stored) => last_write_winner(incoming, stored) == Winner::Local,
    }
}

/// What a remote store does with one pushed change.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
    /// Store this row under a fresh sequence.
    Store(SyncPayload),
    /// Leave storage untouched and acknowledge with this outcome.
    Ack(AckOutcome),
}

/// Decide a pushed change against the stored row, if any.
///
/// Accepted rows keep the higher of the stored and incoming versions, and
/// deletes are stored as tombstones.
pub fn plan_remote_write(existing: Option<&RemoteRow>, change: &RemoteChange) -> RemoteWrite {
    let incoming = &change.payload;
    if incoming.record_id().is_empty() {
        return RemoteWrite::Ack(AckOutcome::Rejected {
            reason: "empty record id".to_string(),
        });
    }
    if incoming.sync_meta().sync_version < 0 {
        return RemoteWrite::Ack(AckOutcome::Rejected {
            reason: format!("negative sync_version {}", incoming.sync_meta().sync_version),
        });
    }

    let stored_version = match existing {
        None if change.operation == Operation::Delete => {
            return RemoteWrite::Ack(AckOutcome::NotFound)
        }
        None => 0,
        Some(row) => {
            if !remote_accepts(Some(row.payload.sync_meta()), incoming.sync_meta()) {
                return RemoteWrite::Ack(AckOutcome::Superseded { seq: row.seq });
            }
            row.payload.sync_meta().sync_version
        }
    };

    let mut stored = incoming.clone();
    let meta = stored.sync_meta_mut();
    meta.sync_version = meta.sync_version.max(stored_version);
    if change.operation == Operation::Delete {
        meta.deleted = true;
    }
    RemoteWrite::Store(stored)
}

pub fn resolve_conflict(
    conflict: &Conflict,
    strategy: ConflictStrategy,
) -> Result<Resolution, ConflictError> {
    let (local, remote) = (&conflict.local, &conflict.remote);
    if local.table() != remote.table() {
        return Err(ConflictError::TableMismatch {
            local: local.table(),
            remote: remote.table(),
        });
    }

    let pick = |winner: Winner| {
        let merged_data = match winner {
            Winner::Local => local.clone(),
            _ => remote.clone(),
        };
        Resolution {
            winner,
            merged_data,
        }
    };

    match strategy {
        ConflictStrategy::LastWriteWins => Ok(pick(last_write_winner(
            local.sync_meta(),
            remote.sync_meta(),
        ))),
        ConflictStrategy::LocalWins => Ok(pick(Winner::Local)),
        ConflictStrategy::RemoteWins => Ok(pick(Winner::Remote)),
        ConflictStrategy::Manual => Err(ConflictError::ManualResolutionRequired {
            table: local.table(),
            record_id: local.record_id().to_string(),
        }),
        ConflictStrategy::Merge => merge(local, remote).map(|merged_data| Resolution {
            winner: Winner::Merged,
            merged_data,
        }),
    }
}

fn merge(local: &SyncPayload, remote: &SyncPayload) -> Result<SyncPayload, ConflictError> {
    let lww = last_write_winner(local.sync_meta(), remote.sync_meta());
    let (winner, loser) = match lww {
        Winner::Local => (local, remote),
        _ => (remote, local),
    };

    let to_value = |p: &SyncPayload| {
        serde_json::to_value(p).map_err(|e| ConflictError::Merge(e.to_string()))
    };
    let mut merged = to_value(loser)?;
    union_into(&mut merged, to_value(winner)?);

    let mut payload: SyncPayload =
        serde_json::from_value(merged).map_err(|e| ConflictError::Merge(e.to_string()))?;

    let (a, b) = (local.sync_meta(), remote.sync_meta());
    let meta = payload.sync_meta_mut();
    *meta = winner.sync_meta().clone();
    meta.sync_version = a.sync_version.max(b.sync_version);
    meta.last_modified_at = a.last_modified_at.max(b.last_modified_at);
    Ok(payload)
}

/// Overlay `top` onto `base`, recursing into objects present on both sides.
fn union_into(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base), Value::Object(top)) => union_objects(base, top),
        (base, top) => *base = top,
    }
}

fn union_objects(base: &mut Map<String, Value>, top: Map<String, Value>) {
    for (key, value) in top {
        match base.get_mut(&key) {
            Some(existing) if !value.is_null() || existing.is_null() => union_into(existing, value),
            Some(_) => {}
            None => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Syncable;
    use crate::types::{CardState, PracticeRecord};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn record(version: i64, at: DateTime<Utc>, quality: u8) -> SyncPayload {
        let mut r = PracticeRecord::new_card("p1".into(), "r1", "t1", at);
        r.quality = Some(quality);
        r.practiced = Some(at);
        r.state = CardState::Review;
        r.sync.sync_version = version;
        r.sync.last_modified_at = at;
        r.into_payload()
    }

    fn lww(local: SyncPayload, remote: SyncPayload) -> Winner {
        resolve_conflict(&Conflict { local, remote }, ConflictStrategy::LastWriteWins)
            .unwrap()
            .winner
    }

    fn change(operation: Operation, payload: SyncPayload) -> RemoteChange {
        RemoteChange { operation, payload }
    }

    #[test]
    fn remote_write_stores_new_rows_and_skips_stale_ones() {
        let fresh = record(2, t0(), 3);
        assert_eq!(
            plan_remote_write(None, &change(Operation::Insert, fresh.clone())),
            RemoteWrite::Store(fresh.clone())
        );

        let stored = RemoteRow {
            seq: 9,
            payload: record(2, t0() + Duration::minutes(1), 4),
        };
        assert_eq!(
            plan_remote_write(Some(&stored), &change(Operation::Update, fresh)),
            RemoteWrite::Ack(AckOutcome::Superseded { seq: 9 })
        );
        assert_eq!(
            plan_remote_write(Some(&stored), &change(Operation::Update, stored.payload.clone())),
            RemoteWrite::Ack(AckOutcome::Superseded { seq: 9 })
        );
    }

    #[test]
    fn remote_write_keeps_the_higher_version() {
        let stored = RemoteRow {
            seq: 1,
            payload: record(6, t0(), 3),
        };
        let later = record(2, t0() + Duration::hours(1), 1);
        let RemoteWrite::Store(written) =
            plan_remote_write(Some(&stored), &change(Operation::Update, later))
        else {
            panic!("expected a store");
        };
        assert_eq!(written.sync_meta().sync_version, 6);
        assert_eq!(written.sync_meta().last_modified_at, t0() + Duration::hours(1));
    }

    #[test]
    fn remote_deletes() {
        let tombstone = record(3, t0(), 3);
        assert_eq!(
            plan_remote_write(None, &change(Operation::Delete, tombstone.clone())),
            RemoteWrite::Ack(AckOutcome::NotFound)
        );
        let stored = RemoteRow {
            seq: 4,
            payload: record(2, t0() - Duration::hours(1), 3),
        };
        let RemoteWrite::Store(written) =
            plan_remote_write(Some(&stored), &change(Operation::Delete, tombstone))
        else {
            panic!("expected a store");
        };
        assert!(written.sync_meta().deleted);
    }

    #[test]
    fn remote_write_rejects_malformed_rows() {
        let mut bad = record(1, t0(), 3);
        bad.sync_meta_mut().sync_version = -1;
        assert!(matches!(
            plan_remote_write(None, &change(Operation::Insert, bad)),
            RemoteWrite::Ack(AckOutcome::Rejected { .. })
        ));
    }

    #[test]
    fn equal_versions_are_not_a_conflict() {
        assert!(!detect_conflict(&record(3, t0(), 2), &record(3, t0(), 3)));
        assert!(detect_conflict(&record(3, t0(), 3), &record(4, t0(), 3)));
    }

    #[test]
    fn newer_remote_wins() {
        let t1 = t0();
        let t2 = t1 + Duration::minutes(5);
        assert_eq!(lww(record(5, t1, 3), record(6, t2, 3)), Winner::Remote);
    }

    #[test]
    fn newer_local_wins() {
        let t2 = t0();
        let t1 = t2 + Duration::minutes(5);
        assert_eq!(lww(record(5, t1, 3), record(6, t2, 3)), Winner::Local);
    }

    #[test]
    fn tie_goes_to_remote() {
        assert_eq!(lww(record(5, t0(), 3), record(6, t0(), 2)), Winner::Remote);
    }

    #[test]
    fn overrides_ignore_timestamps() {
        let conflict = Conflict {
            local: record(1, t0(), 3),
            remote: record(2, t0() + Duration::days(1), 2),
        };
        let local = resolve_conflict(&conflict, ConflictStrategy::LocalWins).unwrap();
        assert_eq!(local.winner, Winner::Local);
        assert_eq!(local.merged_data, conflict.local);

        let remote = resolve_conflict(&conflict, ConflictStrategy::RemoteWins).unwrap();
        assert_eq!(remote.merged_data, conflict.remote);
    }

    #[test]
    fn manual_never_resolves() {
        let conflict = Conflict {
            local: record(1, t0(), 3),
            remote: record(2, t0(), 2),
        };
        assert_eq!(
            resolve_conflict(&conflict, ConflictStrategy::Manual),
            Err(ConflictError::ManualResolutionRequired {
                table: crate::sync::SyncTable::PracticeRecord,
                record_id: "p1".into(),
            })
        );
    }

    #[test]
    fn merge_keeps_non_conflicting_fields_and_max_meta() {
        let t1 = t0() + Duration::hours(1);
        let mut local = PracticeRecord::new_card("p1".into(), "r1", "t1", t0());
        local.technique = Some("motor_skills".into());
        local.quality = Some(2);
        local.sync.sync_version = 7;
        local.sync.last_modified_at = t0();

        let mut remote = local.clone();
        remote.technique = None;
        remote.quality = Some(3);
        remote.sync.sync_version = 4;
        remote.sync.last_modified_at = t1;

        let resolution = resolve_conflict(
            &Conflict {
                local: local.into_payload(),
                remote: remote.into_payload(),
            },
            ConflictStrategy::Merge,
        )
        .unwrap();
        assert_eq!(resolution.winner, Winner::Merged);

        let merged = PracticeRecord::from_payload(resolution.merged_data).unwrap();
        assert_eq!(merged.quality, Some(3));
        assert_eq!(merged.technique.as_deref(), Some("motor_skills"));
        assert_eq!(merged.sync.sync_version, 7);
        assert_eq!(merged.sync.last_modified_at, t1);
    }

    #[test]
    fn cloud_keeps_its_copy_on_ties() {
        let stored = SyncMeta::new(t0());
        let mut incoming = stored.clone();
        assert!(!remote_accepts(Some(&stored), &incoming));
        incoming.last_modified_at = t0() + Duration::seconds(1);
        assert!(remote_accepts(Some(&stored), &incoming));
        assert!(remote_accepts(None, &stored));
    }
}
