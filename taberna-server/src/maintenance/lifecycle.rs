//! Time-driven mesa state machine: `Scheduled -> Open -> Closed`.
//!
//! Transitions are detected from wall-clock comparisons only, so every pass
//! has to be safe to run late, twice, or concurrently with another pass. The
//! guarded update in [`Store::close_mesa_if_open`] decides which run owns a
//! transition; only that run emits the [`MesaClosed`] event.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use taberna_shared::domain::{MesaClosed, MesaId, MesaSnapshot};
use tracing::{debug, info, warn};

use crate::server::LifecycleConfig;
use crate::server::events::EventSink;
use crate::storage::models::Mesa;
use crate::storage::{MesaSummary, StorageError, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesaState {
    Scheduled,
    Open,
    Closed,
}

impl MesaState {
    pub fn at(mesa: &Mesa, now: NaiveDateTime) -> Self {
        if mesa.closed_at.is_some() || !mesa.is_open {
            return MesaState::Closed;
        }
        match mesa.opens_at {
            Some(opens_at) if opens_at > now => MesaState::Scheduled,
            _ => MesaState::Open,
        }
    }
}

/// Truncates `t` to the start of its minute.
pub fn minute_floor(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Opening times a run at `now` announces, as the half-open range
/// `[from, to)`. Only minutes that already ended are included, so mesas
/// sharing a minute always travel together. `tolerance` (at least one
/// minute) reaches back over late or missed ticks.
pub fn notification_window(
    now: NaiveDateTime,
    tolerance: Duration,
) -> (NaiveDateTime, NaiveDateTime) {
    let to = minute_floor(now);
    let from = minute_floor(to - tolerance.max(Duration::minutes(1)));
    (from, to)
}

/// Whether the opening of `mesa` has to be announced by a run at `now`.
pub fn due_for_open_notification(mesa: &Mesa, now: NaiveDateTime, tolerance: Duration) -> bool {
    if mesa.opens_notified_at.is_some() {
        return false;
    }
    let (from, to) = notification_window(now, tolerance);
    mesa.opens_at.is_some_and(|opens_at| opens_at >= from && opens_at < to)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AutoCloseReport {
    pub scanned: usize,
    pub closed: usize,
    /// Candidates another run closed first.
    pub lost_races: usize,
    pub failed: usize,
    pub events_failed: usize,
}

enum CloseOutcome {
    Closed { event_published: bool },
    LostRace,
    Failed,
}

pub struct MesaLifecycle {
    store: Store,
    events: Arc<dyn EventSink>,
    tz: Tz,
    cfg: LifecycleConfig,
}

impl MesaLifecycle {
    pub fn new(store: Store, events: Arc<dyn EventSink>, tz: Tz, cfg: LifecycleConfig) -> Self {
        Self {
            store,
            events,
            tz,
            cfg,
        }
    }

    /// Closes every mesa that has been open longer than the configured
    /// window. Only a failure to list candidates aborts the pass.
    pub async fn auto_close_pass(&self, now: DateTime<Utc>) -> Result<AutoCloseReport, StorageError> {
        let cutoff = (now - Duration::hours(self.cfg.auto_close_after_hours)).naive_utc();
        let chunk = self.cfg.chunk_size.max(1);
        let mut report = AutoCloseReport::default();
        let mut after_id = 0;

        loop {
            let ids = self
                .store
                .list_auto_close_candidates(cutoff, after_id, chunk)
                .await?;
            let Some(&last) = ids.last() else {
                break;
            };
            after_id = last;

            for id in &ids {
                report.scanned += 1;
                match self.close_one(*id, now).await {
                    CloseOutcome::Closed { event_published } => {
                        report.closed += 1;
                        if !event_published {
                            report.events_failed += 1;
                        }
                    }
                    CloseOutcome::LostRace => report.lost_races += 1,
                    CloseOutcome::Failed => report.failed += 1,
                }
            }

            if (ids.len() as i64) < chunk {
                break;
            }
            if self.cfg.throttle_ms > 0 {
                tokio::time::sleep(StdDuration::from_millis(self.cfg.throttle_ms)).await;
            }
        }

        info!(
            scanned = report.scanned,
            closed = report.closed,
            lost_races = report.lost_races,
            failed = report.failed,
            "lifecycle: auto-close pass done"
        );
        Ok(report)
    }

    async fn close_one(&self, mesa_id: i32, now: DateTime<Utc>) -> CloseOutcome {
        match self.store.close_mesa_if_open(mesa_id, now.naive_utc()).await {
            Ok(1) => {}
            Ok(_) => {
                debug!(mesa_id, "lifecycle: already closed by another run");
                return CloseOutcome::LostRace;
            }
            Err(err) => {
                warn!(mesa_id, error = %err, "lifecycle: close failed");
                return CloseOutcome::Failed;
            }
        }

        // The close is committed; nothing below may undo or abort it.
        let event_published = match self.closed_event(mesa_id, now).await {
            Ok(event) => match self.events.publish(&event).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(mesa_id, event_id = %event.event_id, error = %err, "lifecycle: event delivery failed");
                    false
                }
            },
            Err(err) => {
                warn!(mesa_id, error = %err, "lifecycle: snapshot after close failed");
                false
            }
        };
        CloseOutcome::Closed { event_published }
    }

    async fn closed_event(&self, mesa_id: i32, now: DateTime<Utc>) -> Result<MesaClosed, StorageError> {
        let summary = self
            .store
            .mesa_summary(mesa_id)
            .await?
            .ok_or_else(|| StorageError::InvalidInput(format!("mesa {mesa_id} vanished")))?;
        let snapshot = self.snapshot(summary);
        let closed_at = now.with_timezone(&self.tz).fixed_offset();
        Ok(MesaClosed::from_snapshot(snapshot, closed_at, true, self.tz.name()))
    }

    fn snapshot(&self, summary: MesaSummary) -> MesaSnapshot {
        let MesaSummary {
            mesa,
            confirmed_count,
        } = summary;
        MesaSnapshot {
            id: MesaId(mesa.id),
            jornada_id: mesa.jornada_id,
            manager_id: mesa.manager_id,
            title: mesa.title,
            capacity: mesa.capacity,
            is_open: mesa.is_open,
            closed_at: mesa
                .closed_at
                .map(|t| t.and_utc().with_timezone(&self.tz).fixed_offset()),
            confirmed_count,
        }
    }
}
