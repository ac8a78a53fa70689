mod common;

use std::sync::Arc;

use chrono::{Duration, NaiveTime};
use common::{FixedClock, RecordingMailer, RecordingSink, TestDb, add_user, at, config, naive};
use taberna_server::maintenance::schedule::{BusyHours, Cadence, Schedule, TaskKind};
use taberna_server::maintenance::{
    HEARTBEAT_KEY, Maintenance, SkipReason, TaskOutcome, TaskSummary, lock_name,
};
use taberna_server::server::ScheduleConfig;
use taberna_server::storage::models::NewMesa;

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn maintenance(db: &TestDb, clock: Arc<FixedClock>, extra: &str) -> Maintenance {
    Maintenance::from_config(
        &config(extra),
        db.store.clone(),
        clock,
        RecordingSink::new(),
        RecordingMailer::new(),
        None,
    )
    .unwrap()
}

#[test]
fn default_cadences() {
    let schedule = Schedule::from_config(&ScheduleConfig::default()).unwrap();

    let due = schedule.due(naive(2024, 1, 1, 3, 15, 0));
    assert_eq!(
        due,
        vec![
            TaskKind::AutoClose,
            TaskKind::OpenNotifications,
            TaskKind::HonorDecay,
            TaskKind::Heartbeat
        ]
    );

    let due = schedule.due(naive(2024, 1, 1, 3, 16, 0));
    assert_eq!(due, vec![TaskKind::OpenNotifications, TaskKind::Heartbeat]);

    assert!(Cadence::EveryMinutes(15).is_due(naive(2024, 1, 1, 0, 0, 0)));
    assert!(!Cadence::EveryMinutes(15).is_due(naive(2024, 1, 1, 0, 7, 0)));
    assert!(Cadence::DailyAt(hm(3, 15)).is_due(naive(2024, 1, 1, 3, 15, 0)));
    assert!(!Cadence::DailyAt(hm(3, 15)).is_due(naive(2024, 1, 1, 15, 3, 0)));
}

#[test]
fn busy_hours_may_wrap_midnight() {
    let evening = BusyHours {
        start: hm(18, 0),
        end: hm(23, 0),
    };
    assert!(evening.contains(hm(18, 0)));
    assert!(evening.contains(hm(22, 59)));
    assert!(!evening.contains(hm(23, 0)));
    assert!(!evening.contains(hm(9, 0)));

    let night = BusyHours {
        start: hm(22, 0),
        end: hm(2, 0),
    };
    assert!(night.contains(hm(23, 30)));
    assert!(night.contains(hm(1, 59)));
    assert!(!night.contains(hm(2, 0)));
    assert!(!night.contains(hm(12, 0)));
}

#[tokio::test]
async fn locks_exclude_until_released_or_expired() {
    let db = TestDb::new().await;
    let now = at(2024, 1, 1, 10, 0, 0).naive_utc();
    let later = now + Duration::minutes(10);

    assert!(db.store.try_acquire_lock("job", "a", now, later).await.unwrap());
    assert!(!db.store.try_acquire_lock("job", "b", now, later).await.unwrap());
    assert!(!db.store.release_lock("job", "b").await.unwrap());

    let after_expiry = now + Duration::minutes(11);
    assert!(
        db.store
            .try_acquire_lock("job", "b", after_expiry, after_expiry + Duration::minutes(10))
            .await
            .unwrap()
    );
    assert!(!db.store.release_lock("job", "a").await.unwrap());
    assert!(db.store.release_lock("job", "b").await.unwrap());
}

#[tokio::test]
async fn held_lock_skips_the_run() {
    let db = TestDb::new().await;
    let clock = FixedClock::new(at(2024, 1, 1, 10, 0, 0));
    let maint = maintenance(&db, clock.clone(), "");
    let now = at(2024, 1, 1, 10, 0, 0).naive_utc();
    let lock = lock_name(TaskKind::AutoClose);

    assert!(
        db.store
            .try_acquire_lock(&lock, "other-run", now, now + Duration::minutes(10))
            .await
            .unwrap()
    );
    assert_eq!(
        maint.run_task(TaskKind::AutoClose).await.unwrap(),
        TaskOutcome::Skipped(SkipReason::Locked)
    );
    // Other tasks have their own locks.
    assert!(matches!(
        maint.run_task(TaskKind::Heartbeat).await.unwrap(),
        TaskOutcome::Completed(TaskSummary::Heartbeat)
    ));

    db.store.release_lock(&lock, "other-run").await.unwrap();
    assert!(matches!(
        maint.run_task(TaskKind::AutoClose).await.unwrap(),
        TaskOutcome::Completed(TaskSummary::AutoClose(_))
    ));
}

#[tokio::test]
async fn completed_runs_release_their_lock() {
    let db = TestDb::new().await;
    let manager = add_user(&db.store, "Manu").await;
    let mesa_id = db
        .store
        .insert_mesa(NewMesa::open("Catan", naive(2024, 1, 1, 0, 30, 0), manager))
        .await
        .unwrap();
    let clock = FixedClock::new(at(2024, 1, 1, 10, 0, 0));
    let maint = maintenance(&db, clock.clone(), "lifecycle:\n  throttle_ms: 0\n");

    match maint.run_task(TaskKind::AutoClose).await.unwrap() {
        TaskOutcome::Completed(TaskSummary::AutoClose(report)) => assert_eq!(report.closed, 1),
        other => panic!("unexpected outcome {other:?}"),
    }
    match maint.run_task(TaskKind::AutoClose).await.unwrap() {
        TaskOutcome::Completed(TaskSummary::AutoClose(report)) => assert_eq!(report.closed, 0),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!db.store.get_mesa(mesa_id).await.unwrap().unwrap().is_open);
}

#[tokio::test]
async fn busy_hours_hold_back_flagged_tasks() {
    let db = TestDb::new().await;
    // 02:15 in Madrid.
    let clock = FixedClock::new(at(2024, 1, 1, 1, 15, 0));
    let maint = maintenance(
        &db,
        clock.clone(),
        "schedule:\n  busy_hours:\n    start: \"02:00\"\n    end: \"04:00\"\n",
    );

    assert_eq!(
        maint.run_task(TaskKind::HonorDecay).await.unwrap(),
        TaskOutcome::Skipped(SkipReason::BusyHours)
    );
    assert!(matches!(
        maint.run_task(TaskKind::AutoClose).await.unwrap(),
        TaskOutcome::Completed(_)
    ));

    clock.set(at(2024, 1, 1, 3, 30, 0));
    assert!(matches!(
        maint.run_task(TaskKind::HonorDecay).await.unwrap(),
        TaskOutcome::Completed(TaskSummary::HonorDecay(_))
    ));
}

#[tokio::test]
async fn heartbeat_expires_after_its_ttl() {
    let db = TestDb::new().await;
    let clock = FixedClock::new(at(2024, 1, 1, 10, 0, 0));
    let maint = maintenance(&db, clock.clone(), "");

    assert_eq!(maint.last_heartbeat().await.unwrap(), None);
    maint.run_task(TaskKind::Heartbeat).await.unwrap();
    assert_eq!(
        maint.last_heartbeat().await.unwrap().as_deref(),
        Some("2024-01-01T11:00:00+01:00")
    );

    let tasks = maint.task_heartbeats().await.unwrap();
    assert_eq!(
        tasks.get("heartbeat").cloned().flatten().as_deref(),
        Some("2024-01-01T11:00:00+01:00")
    );
    assert_eq!(tasks.get("auto_close"), Some(&None));

    let raw = db
        .store
        .cache_get(HEARTBEAT_KEY, at(2024, 1, 1, 10, 1, 0).naive_utc())
        .await
        .unwrap();
    assert!(raw.is_some());

    clock.set(at(2024, 1, 1, 10, 5, 1));
    assert_eq!(maint.last_heartbeat().await.unwrap(), None);
}

#[tokio::test]
async fn lost_heartbeat_does_not_fail_finished_work() {
    let db = TestDb::new().await;
    let manager = add_user(&db.store, "Manu").await;
    let mesa_id = db
        .store
        .insert_mesa(NewMesa::open("Catan", naive(2024, 1, 1, 0, 30, 0), manager))
        .await
        .unwrap();
    let clock = FixedClock::new(at(2024, 1, 1, 10, 0, 0));
    let maint = maintenance(&db, clock.clone(), "lifecycle:\n  throttle_ms: 0\n");
    db.drop_table("cache_entries");

    match maint.run_task(TaskKind::AutoClose).await.unwrap() {
        TaskOutcome::Completed(TaskSummary::AutoClose(report)) => assert_eq!(report.closed, 1),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!db.store.get_mesa(mesa_id).await.unwrap().unwrap().is_open);

    // Writing the beat is all the heartbeat task does.
    assert!(maint.run_task(TaskKind::Heartbeat).await.is_err());
}
