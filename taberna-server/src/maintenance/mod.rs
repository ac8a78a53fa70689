//! Recurring maintenance: auto-close, open notifications, honor decay and the
//! liveness heartbeat.
//!
//! Every task run takes a named, time-boxed lock in storage so a slow run
//! and the next tick never overlap, even across processes. Triggers may still
//! arrive late, twice or concurrently; the tasks themselves are idempotent.

pub mod honor;
pub mod lifecycle;
pub mod notify;
pub mod schedule;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use mockable::Clock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::server::events::EventSink;
use crate::server::mail::MailTransport;
use crate::server::push::PushSender;
use crate::server::{AppConfig, ConfigError};
use crate::storage::{StorageError, Store};
use honor::{DecayReport, HonorLedger};
use lifecycle::{AutoCloseReport, MesaLifecycle};
use notify::{DispatchReport, OpenNotifier};
use schedule::{Schedule, TaskKind};

/// Key of the scheduler-wide liveness value.
pub const HEARTBEAT_KEY: &str = "scheduler:heartbeat";

pub fn task_heartbeat_key(kind: TaskKind) -> String {
    format!("{HEARTBEAT_KEY}:{}", kind.name())
}

pub fn lock_name(kind: TaskKind) -> String {
    format!("maintenance:{}", kind.name())
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another run holds the task's lock.
    Locked,
    BusyHours,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSummary {
    AutoClose(AutoCloseReport),
    OpenNotifications(DispatchReport),
    HonorDecay(DecayReport),
    Heartbeat,
}

impl fmt::Display for TaskSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskSummary::AutoClose(r) => write!(
                f,
                "scanned={} closed={} lost_races={} failed={} events_failed={}",
                r.scanned, r.closed, r.lost_races, r.failed, r.events_failed
            ),
            TaskSummary::OpenNotifications(r) if r.nothing_to_do() => f.write_str("nothing to do"),
            TaskSummary::OpenNotifications(r) => {
                write!(
                    f,
                    "groups={} mesas={} recipients={} sent={} failed={} marked={}",
                    r.groups, r.mesas, r.recipients, r.sent, r.failed, r.marked
                )?;
                if let Some(push) = &r.push {
                    write!(
                        f,
                        " push_sent={} push_deleted={} push_total={}",
                        push.sent, push.deleted, push.total
                    )?;
                }
                Ok(())
            }
            TaskSummary::HonorDecay(r) => write!(
                f,
                "scanned={} penalized={} already={} failed={}",
                r.scanned, r.penalized, r.already_penalized, r.failed
            ),
            TaskSummary::Heartbeat => f.write_str("alive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(TaskSummary),
    Skipped(SkipReason),
}

pub struct Maintenance {
    store: Store,
    clock: Arc<dyn Clock + Send + Sync>,
    tz: Tz,
    schedule: Schedule,
    lifecycle: MesaLifecycle,
    notifier: OpenNotifier,
    ledger: HonorLedger,
    heartbeat_ttl: Duration,
}

impl Maintenance {
    pub fn from_config(
        cfg: &AppConfig,
        store: Store,
        clock: Arc<dyn Clock + Send + Sync>,
        events: Arc<dyn EventSink>,
        mailer: Arc<dyn MailTransport>,
        push: Option<PushSender>,
    ) -> Result<Self, ConfigError> {
        let tz = cfg.tz()?;
        let schedule = Schedule::from_config(&cfg.schedule)?;
        Ok(Self {
            lifecycle: MesaLifecycle::new(store.clone(), events, tz, cfg.lifecycle.clone()),
            notifier: OpenNotifier::new(
                store.clone(),
                mailer,
                push,
                cfg.notifications.clone(),
                cfg.app_url.clone(),
                tz,
            ),
            ledger: HonorLedger::new(store.clone(), tz, cfg.honor.clone()),
            store,
            clock,
            tz,
            schedule,
            heartbeat_ttl: Duration::seconds(cfg.schedule.heartbeat_ttl_seconds.max(1)),
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn ledger(&self) -> &HonorLedger {
        &self.ledger
    }

    /// Runs one task now, honoring busy hours and the overlap lock. A
    /// completed run refreshes the scheduler heartbeat; failing to write it
    /// is only logged, except for the heartbeat task itself.
    pub async fn run_task(&self, kind: TaskKind) -> Result<TaskOutcome, TaskError> {
        let now = self.clock.utc();
        let local = now.with_timezone(&self.tz);
        if self.schedule.suppressed(kind, local.time()) {
            info!(task = %kind, "maintenance: skipped during busy hours");
            return Ok(TaskOutcome::Skipped(SkipReason::BusyHours));
        }

        let plan = self.schedule.plan(kind);
        let lock = lock_name(kind);
        let run_id = Uuid::new_v4();
        let owner = run_id.to_string();
        let acquired = self
            .store
            .try_acquire_lock(&lock, &owner, now.naive_utc(), (now + plan.lock).naive_utc())
            .await?;
        if !acquired {
            info!(task = %kind, "maintenance: previous run still holds the lock");
            return Ok(TaskOutcome::Skipped(SkipReason::Locked));
        }

        let span = info_span!("task", name = kind.name(), run_id = %run_id);
        let result = self.execute(kind, now).instrument(span.clone()).await;

        if let Err(err) = self.store.release_lock(&lock, &owner).await {
            // The lock expires on its own.
            warn!(task = %kind, error = %err, "maintenance: lock release failed");
        }

        let summary = result?;
        if let Err(err) = self.beat(kind, now).instrument(span.clone()).await {
            // For the heartbeat task the beat is the work.
            if kind == TaskKind::Heartbeat {
                return Err(err.into());
            }
            span.in_scope(|| warn!(error = %err, "maintenance: heartbeat write failed"));
        }
        span.in_scope(|| info!(summary = %summary, "maintenance: task done"));
        Ok(TaskOutcome::Completed(summary))
    }

    async fn execute(&self, kind: TaskKind, now: DateTime<Utc>) -> Result<TaskSummary, TaskError> {
        let summary = match kind {
            TaskKind::AutoClose => {
                TaskSummary::AutoClose(self.lifecycle.auto_close_pass(now).await?)
            }
            TaskKind::OpenNotifications => {
                TaskSummary::OpenNotifications(self.notifier.dispatch(now).await?)
            }
            TaskKind::HonorDecay => TaskSummary::HonorDecay(self.ledger.decay_inactive(now).await?),
            TaskKind::Heartbeat => TaskSummary::Heartbeat,
        };
        Ok(summary)
    }

    async fn beat(&self, kind: TaskKind, now: DateTime<Utc>) -> Result<(), StorageError> {
        let value = now.with_timezone(&self.tz).to_rfc3339();
        let expires_at = (now + self.heartbeat_ttl).naive_utc();
        self.store.cache_put(HEARTBEAT_KEY, &value, expires_at).await?;
        self.store
            .cache_put(&task_heartbeat_key(kind), &value, expires_at)
            .await?;
        debug!(task = %kind, at = %value, "maintenance: heartbeat");
        Ok(())
    }

    /// Latest heartbeat, RFC 3339 in the display timezone. `None` once it
    /// outlived its TTL, which means the trigger source stalled.
    pub async fn last_heartbeat(&self) -> Result<Option<String>, StorageError> {
        self.store
            .cache_get(HEARTBEAT_KEY, self.clock.utc().naive_utc())
            .await
    }

    /// Latest per-task heartbeats; expired entries map to `None`.
    pub async fn task_heartbeats(&self) -> Result<BTreeMap<String, Option<String>>, StorageError> {
        let now = self.clock.utc().naive_utc();
        let mut beats = BTreeMap::new();
        for kind in TaskKind::ALL {
            let value = self.store.cache_get(&task_heartbeat_key(kind), now).await?;
            beats.insert(kind.name().to_string(), value);
        }
        Ok(beats)
    }

    /// Fires due tasks at the top of every local minute until `shutdown` is
    /// cancelled, then waits for in-flight runs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut running: JoinSet<(TaskKind, Result<TaskOutcome, TaskError>)> = JoinSet::new();
        let mut last_tick: Option<NaiveDateTime> = None;
        info!(tz = %self.tz.name(), "maintenance: scheduler started");

        loop {
            let wait = until_next_minute(self.clock.utc());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let local = self.clock.utc().with_timezone(&self.tz).naive_local();
            let Some(minute) = local.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
                continue;
            };
            if last_tick == Some(minute) {
                continue;
            }
            last_tick = Some(minute);

            for kind in self.schedule.due(minute) {
                let this = Arc::clone(&self);
                running.spawn(async move { (kind, this.run_task(kind).await) });
            }
            while let Some(joined) = running.try_join_next() {
                log_finished(joined);
            }
        }

        info!(in_flight = running.len(), "maintenance: scheduler stopping");
        while let Some(joined) = running.join_next().await {
            log_finished(joined);
        }
    }
}

fn until_next_minute(now: DateTime<Utc>) -> StdDuration {
    let into_minute = now.timestamp_millis().rem_euclid(60_000) as u64;
    StdDuration::from_millis(60_000 - into_minute)
}

fn log_finished(
    joined: Result<(TaskKind, Result<TaskOutcome, TaskError>), tokio::task::JoinError>,
) {
    match joined {
        Ok((_, Ok(_))) => {}
        Ok((kind, Err(err))) => {
            error!(task = %kind, error = %err, "maintenance: task failed; retrying next tick")
        }
        Err(err) => error!(error = %err, "maintenance: task panicked"),
    }
}
