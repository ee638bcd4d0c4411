mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use pretty_assertions::assert_eq;
use repertoire_core::{
    AckOutcome, ConflictStrategy, Operation, PracticeRecord, RemoteChange, SyncMeta, SyncPayload,
    SyncTable, Tune,
};
use repertoire_core::SyncRecord;
use repertoire_desktop::db::{OutboxRepository, PracticeRepository, SyncStateRepository};
use repertoire_desktop::sync::{ManualChoice, MemoryRemote, RemoteStore, RetryConfig};
use repertoire_desktop::{SyncConfig, SyncError, SyncStatus};

use common::{new_card, seed_repertoire, t0, tune, Device};

fn remote() -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::new())
}

fn set_quality(device: &Device, quality: u8) -> PracticeRecord {
    let store = device.store();
    let mut record = store.get_practice_record("r1", "t1").unwrap().unwrap();
    record.quality = Some(quality);
    store.save(record).unwrap()
}

#[tokio::test]
async fn diverged_devices_converge_on_the_later_write() {
    let remote = remote();
    let a = Device::new("device-a", &remote, SyncConfig::default());
    let b = Device::new("device-b", &remote, SyncConfig::default());

    {
        let store = a.store();
        seed_repertoire(&store, &["t1"]);
        new_card(&store, "t1");
    }
    assert_eq!(a.engine.sync().await.unwrap().pushed, 4);
    assert_eq!(b.engine.sync().await.unwrap().pulled, 4);

    // B edits first while offline, A edits later.
    b.advance(Duration::hours(1));
    let hard = set_quality(&b, 2);
    a.advance(Duration::hours(2));
    let good = set_quality(&a, 3);
    assert_eq!(hard.sync.sync_version, good.sync.sync_version);

    assert_eq!(a.engine.sync().await.unwrap().pushed, 1);
    let report = b.engine.sync().await.unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let on_a = a.store().get_practice_record("r1", "t1").unwrap().unwrap();
    let on_b = b.store().get_practice_record("r1", "t1").unwrap().unwrap();
    assert_eq!(on_b.quality, Some(3));
    assert_eq!(on_a, on_b);
    assert_eq!(
        remote.get(SyncTable::PracticeRecord, &on_a.id),
        Some(SyncPayload::PracticeRecord(on_a))
    );

    let settled = a.engine.sync().await.unwrap();
    assert_eq!((settled.pushed, settled.pulled), (0, 0));
    assert_eq!(b.store().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn replaying_a_push_changes_nothing() {
    let remote = remote();
    let device = Device::new("device-a", &remote, SyncConfig::default());
    let saved = device.store().save(tune("t1", "Drowsy Maggie")).unwrap();
    device.engine.sync().await.unwrap();
    let seq = remote.current_seq();

    let change = RemoteChange {
        operation: Operation::Update,
        payload: SyncPayload::Tune(saved.clone()),
    };
    let acks = remote.push_batch(&[change.clone(), change]).await.unwrap();
    assert!(acks
        .iter()
        .all(|ack| matches!(ack.outcome, AckOutcome::Superseded { .. })));
    assert_eq!(remote.current_seq(), seq);
    assert_eq!(
        remote.get(SyncTable::Tune, "t1"),
        Some(SyncPayload::Tune(saved))
    );
}

#[tokio::test]
async fn versions_never_go_backwards() {
    let remote = remote();
    let a = Device::new("device-a", &remote, SyncConfig::default());
    let b = Device::new("device-b", &remote, SyncConfig::default());

    a.store().save(tune("t1", "v1")).unwrap();
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();

    // A bumps the version several times, B edits once but later.
    for title in ["v2", "v3", "v4"] {
        a.advance(Duration::minutes(1));
        let mut t = a.store().get::<Tune>("t1").unwrap().unwrap();
        t.title = title.into();
        a.store().save(t).unwrap();
    }
    a.engine.sync().await.unwrap();
    let peak = remote.get(SyncTable::Tune, "t1").unwrap().sync_meta().sync_version;

    b.advance(Duration::hours(1));
    let mut t = b.store().get::<Tune>("t1").unwrap().unwrap();
    t.title = "from b".into();
    b.store().save(t).unwrap();
    b.engine.sync().await.unwrap();
    a.engine.sync().await.unwrap();

    for device in [&a, &b] {
        let stored = device.store().get::<Tune>("t1").unwrap().unwrap();
        assert_eq!(stored.title, "from b");
        assert!(stored.sync.sync_version >= peak);
    }
    assert!(remote.get(SyncTable::Tune, "t1").unwrap().sync_meta().sync_version >= peak);
}

#[tokio::test]
async fn repeated_edits_push_once() {
    let remote = remote();
    let device = Device::new("device-a", &remote, SyncConfig::default());
    {
        let store = device.store();
        let mut t = store.save(tune("t1", "first")).unwrap();
        for title in ["second", "third"] {
            t.title = title.into();
            t = store.save(t).unwrap();
        }
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    let report = device.engine.sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(remote.current_seq(), 1);
    let stored = remote.get(SyncTable::Tune, "t1").unwrap();
    assert!(matches!(stored, SyncPayload::Tune(ref t) if t.title == "third"));
}

#[tokio::test]
async fn concurrent_sync_is_refused() {
    let remote = remote();
    remote.set_latency(StdDuration::from_millis(100));
    let device = Device::new("device-a", &remote, SyncConfig::default());
    device.store().save(tune("t1", "Kesh")).unwrap();

    let engine = device.engine.clone();
    let running = tokio::spawn(async move { engine.sync().await });
    tokio::time::sleep(StdDuration::from_millis(30)).await;

    assert!(device.engine.is_syncing());
    assert!(matches!(
        device.engine.sync().await,
        Err(SyncError::AlreadyInProgress)
    ));

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.pushed, 1);
    assert!(!device.engine.is_syncing());
    assert!(matches!(device.engine.status(), SyncStatus::Completed { .. }));
}

#[tokio::test]
async fn timed_out_push_is_retried_after_backoff() {
    let remote = remote();
    remote.set_latency(StdDuration::from_millis(200));
    let config = SyncConfig::new()
        .with_timeout(StdDuration::from_millis(20))
        .with_retry(RetryConfig::new(5).with_initial_delay(StdDuration::from_secs(10)));
    let device = Device::new("device-a", &remote, config);
    device.store().save(tune("t1", "Banish Misfortune")).unwrap();

    let report = device.engine.sync().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.failed, 1);
    assert!(matches!(device.engine.status(), SyncStatus::Failed { .. }));

    let entry = device.store().pending_entries(10).unwrap().remove(0);
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.next_retry_at, Some(t0() + Duration::seconds(10)));

    remote.set_latency(StdDuration::ZERO);
    assert_eq!(device.engine.sync().await.unwrap().pushed, 0);

    device.advance(Duration::seconds(10));
    assert_eq!(device.engine.sync().await.unwrap().pushed, 1);
    assert_eq!(device.store().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn exhausted_entries_get_stuck_until_requeued() {
    let remote = remote();
    let config = SyncConfig::new().with_retry(RetryConfig::immediate(2));
    let device = Device::new("device-a", &remote, config);
    device.store().save(tune("t1", "Cooley's")).unwrap();
    remote.fail_next_pushes(10);

    assert_eq!(device.engine.sync().await.unwrap().stuck, 0);
    assert_eq!(device.engine.sync().await.unwrap().stuck, 1);

    let calls = remote.push_calls();
    let idle = device.engine.sync().await.unwrap();
    assert_eq!((idle.pushed, idle.failed, idle.stuck), (0, 0, 1));
    assert_eq!(remote.push_calls(), calls);

    remote.fail_next_pushes(0);
    assert_eq!(device.engine.retry_stuck().unwrap(), 1);
    let report = device.engine.sync().await.unwrap();
    assert_eq!((report.pushed, report.stuck), (1, 0));
}

#[tokio::test]
async fn refused_record_is_parked_without_retries() {
    let remote = remote();
    remote.reject_record("t1");
    let device = Device::new("device-a", &remote, SyncConfig::default());
    device.store().save(tune("t1", "Out on the Ocean")).unwrap();
    device.store().save(tune("t2", "Lilting Banshee")).unwrap();

    let report = device.engine.sync().await.unwrap();
    assert_eq!((report.pushed, report.failed, report.stuck), (1, 1, 1));
    let stuck = device.engine.stuck_entries().unwrap();
    assert_eq!(stuck[0].record_id, "t1");
    assert!(stuck[0].last_error.as_deref().unwrap_or("").contains("refused"));
}

#[tokio::test]
async fn failed_push_does_not_block_pull() {
    let remote = remote();
    remote.seed(SyncPayload::Tune(Tune {
        sync: SyncMeta {
            sync_version: 1,
            last_modified_at: t0(),
            device_id: Some("elsewhere".into()),
            deleted: false,
        },
        ..tune("t9", "Toss the Feathers")
    }));
    let device = Device::new("device-a", &remote, SyncConfig::default());
    device.store().save(tune("t1", "Maid Behind the Bar")).unwrap();
    remote.fail_next_pushes(1);

    let report = device.engine.sync().await.unwrap();
    assert_eq!((report.pushed, report.pulled), (0, 1));
    assert_eq!(report.errors.len(), 1);
    assert!(device.store().get::<Tune>("t9").unwrap().is_some());
    assert_eq!(device.store().get_cursor(SyncTable::Tune).unwrap(), 1);
    assert!(matches!(device.engine.status(), SyncStatus::Completed { .. }));
}

async fn diverged_under_manual(remote: &Arc<MemoryRemote>) -> (Device, Device) {
    let config = SyncConfig::new().with_strategy(ConflictStrategy::Manual);
    let a = Device::new("device-a", remote, config.clone());
    let b = Device::new("device-b", remote, config);

    a.store().save(tune("t1", "original")).unwrap();
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();

    a.advance(Duration::minutes(10));
    let mut t = a.store().get::<Tune>("t1").unwrap().unwrap();
    t.title = "from a".into();
    a.store().save(t).unwrap();
    a.engine.sync().await.unwrap();

    b.advance(Duration::minutes(5));
    let mut t = b.store().get::<Tune>("t1").unwrap().unwrap();
    t.title = "from b".into();
    b.store().save(t).unwrap();
    (a, b)
}

#[tokio::test]
async fn manual_conflicts_wait_for_a_choice() {
    let remote = remote();
    let (_a, b) = diverged_under_manual(&remote).await;

    remote.fail_next_pushes(1);
    let report = b.engine.sync().await.unwrap();
    assert_eq!(report.conflicts_parked, 1);
    assert_eq!(b.store().get::<Tune>("t1").unwrap().unwrap().title, "from b");
    assert_eq!(
        b.store().get_cursor(SyncTable::Tune).unwrap(),
        remote.current_seq()
    );

    let conflict = b.store().pending_conflicts().unwrap().remove(0);
    b.engine
        .resolve_conflict(conflict.id, ManualChoice::TakeRemote)
        .unwrap();
    assert_eq!(b.store().get::<Tune>("t1").unwrap().unwrap().title, "from a");
    assert!(b.store().pending_conflicts().unwrap().is_empty());
    assert_eq!(b.store().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn keeping_the_local_side_wins_on_the_next_push() {
    let remote = remote();
    let (a, b) = diverged_under_manual(&remote).await;

    remote.fail_next_pushes(1);
    b.engine.sync().await.unwrap();
    let conflict = b.store().pending_conflicts().unwrap().remove(0);
    b.engine
        .resolve_conflict(conflict.id, ManualChoice::KeepLocal)
        .unwrap();

    // Past the backoff left by the failed push.
    b.advance(Duration::seconds(10));
    assert_eq!(b.engine.sync().await.unwrap().pushed, 1);
    a.engine.sync().await.unwrap();
    assert_eq!(a.store().get::<Tune>("t1").unwrap().unwrap().title, "from b");
}
