use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use taberna_shared::domain::inactivity_slug;
use tracing::{debug, info, warn};

use crate::server::HonorConfig;
use crate::storage::models::{HonorEvent, NewHonorEvent};
use crate::storage::{StorageError, Store};

pub const INACTIVITY_REASON: &str = "inactivity";

/// One ledger entry to append. With a `slug`, the entry is recorded at most
/// once per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Award {
    pub user_id: i32,
    pub delta: i32,
    pub reason: String,
    pub mesa_id: Option<i32>,
    pub slug: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AwardOutcome {
    Recorded(HonorEvent),
    /// The `(user, slug)` pair was already in the ledger; nothing was written.
    AlreadyRecorded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecayReport {
    pub scanned: usize,
    pub penalized: usize,
    pub already_penalized: usize,
    pub failed: usize,
}

pub struct HonorLedger {
    store: Store,
    tz: Tz,
    cfg: HonorConfig,
}

impl HonorLedger {
    pub fn new(store: Store, tz: Tz, cfg: HonorConfig) -> Self {
        Self { store, tz, cfg }
    }

    pub async fn award(&self, award: Award, now: DateTime<Utc>) -> Result<AwardOutcome, StorageError> {
        let row = NewHonorEvent {
            user_id: award.user_id,
            delta: award.delta,
            reason: award.reason,
            mesa_id: award.mesa_id,
            occurred_at: now.naive_utc(),
            slug: award.slug,
        };
        match self.store.append_honor_event(row).await {
            Ok(event) => Ok(AwardOutcome::Recorded(event)),
            Err(err) if err.is_duplicate() => Ok(AwardOutcome::AlreadyRecorded),
            Err(err) => Err(err),
        }
    }

    pub async fn balance(&self, user_id: i32) -> Result<i64, StorageError> {
        self.store.honor_balance(user_id).await
    }

    /// Penalizes every user without ledger activity in the trailing window.
    /// The local calendar day keys the penalty, so repeated runs on one day
    /// write at most one row per user.
    pub async fn decay_inactive(&self, now: DateTime<Utc>) -> Result<DecayReport, StorageError> {
        let since = (now - Duration::days(self.cfg.inactivity_days)).naive_utc();
        let slug = inactivity_slug(now.with_timezone(&self.tz).date_naive());
        let chunk = self.cfg.chunk_size.max(1);
        let mut report = DecayReport::default();
        let mut after_id = 0;

        loop {
            let ids = self
                .store
                .list_inactive_user_ids(since, after_id, chunk)
                .await?;
            let Some(&last) = ids.last() else {
                break;
            };
            after_id = last;

            for user_id in &ids {
                report.scanned += 1;
                let award = Award {
                    user_id: *user_id,
                    delta: self.cfg.decay_delta,
                    reason: INACTIVITY_REASON.to_string(),
                    mesa_id: None,
                    slug: Some(slug.clone()),
                };
                match self.award(award, now).await {
                    Ok(AwardOutcome::Recorded(_)) => report.penalized += 1,
                    Ok(AwardOutcome::AlreadyRecorded) => {
                        debug!(user_id, slug = %slug, "honor: decay already applied");
                        report.already_penalized += 1;
                    }
                    Err(err) => {
                        warn!(user_id, error = %err, "honor: decay failed");
                        report.failed += 1;
                    }
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
            slug = %slug,
            scanned = report.scanned,
            penalized = report.penalized,
            already = report.already_penalized,
            failed = report.failed,
            "honor: decay pass done"
        );
        Ok(report)
    }
}
