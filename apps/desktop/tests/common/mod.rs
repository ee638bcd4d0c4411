#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard};
use repertoire_core::{FixedClock, PracticeRecord, Repertoire, RepertoireTune, SyncMeta, Tune};
use repertoire_desktop::practice::practice_record_id;
use repertoire_desktop::sync::{MemoryRemote, SharedRepository};
use repertoire_desktop::{SqliteRepository, SyncConfig, SyncEngine};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 7, 9, 0, 0).unwrap()
}

/// One replica: its own store, clock and engine.
pub struct Device {
    pub clock: Arc<FixedClock>,
    pub repo: SharedRepository,
    pub engine: SyncEngine,
}

impl Device {
    pub fn new(name: &str, remote: &Arc<MemoryRemote>, config: SyncConfig) -> Self {
        let clock = Arc::new(FixedClock::new(t0()));
        let repo = SqliteRepository::open_in_memory()
            .unwrap()
            .with_clock(clock.clone())
            .with_device_id(name)
            .unwrap();
        let repo = Arc::new(Mutex::new(repo));
        let engine = SyncEngine::new(repo.clone(), remote.clone(), config);
        Self {
            clock,
            repo,
            engine,
        }
    }

    pub fn store(&self) -> MutexGuard<'_, SqliteRepository> {
        self.repo.lock()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

pub fn tune(id: &str, title: &str) -> Tune {
    Tune {
        id: id.into(),
        title: title.into(),
        genre: Some("reel".into()),
        sync: SyncMeta::new(t0()),
    }
}

/// Repertoire `r1` of user `u1` holding `tunes`.
pub fn seed_repertoire(repo: &SqliteRepository, tunes: &[&str]) {
    repo.save(Repertoire {
        id: "r1".into(),
        user_ref: "u1".into(),
        name: "Session".into(),
        sync: SyncMeta::new(t0()),
    })
    .unwrap();
    for id in tunes {
        repo.save(tune(id, &format!("The {id} reel"))).unwrap();
        repo.save(RepertoireTune {
            id: format!("r1-{id}"),
            repertoire_ref: "r1".into(),
            tune_ref: id.to_string(),
            scheduled: None,
            added_at: t0(),
            sync: SyncMeta::new(t0()),
        })
        .unwrap();
    }
}

pub fn new_card(repo: &SqliteRepository, tune_ref: &str) -> PracticeRecord {
    repo.save(PracticeRecord::new_card(
        practice_record_id("r1", tune_ref),
        "r1",
        tune_ref,
        t0(),
    ))
    .unwrap()
}
