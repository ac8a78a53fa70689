use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MesaId(pub i32);

impl fmt::Display for MesaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Idempotency key of the automatic close of `mesa` on `day`.
pub fn close_slug(mesa: MesaId, day: NaiveDate) -> String {
    format!("close:{}:{}", mesa, day.format("%Y%m%d"))
}

/// Idempotency key of the inactivity decay applied on `day`.
pub fn inactivity_slug(day: NaiveDate) -> String {
    format!("inact:{}", day.format("%Y%m%d"))
}

/// State of a mesa as read back right after a transition committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MesaSnapshot {
    pub id: MesaId,
    pub jornada_id: Option<i32>,
    pub manager_id: i32,
    pub title: String,
    pub capacity: i32,
    pub is_open: bool,
    pub closed_at: Option<DateTime<FixedOffset>>,
    pub confirmed_count: i64,
}

/// Emitted once per won auto-close transition.
///
/// Delivery is at-least-once from the consumer's point of view: listeners
/// must dedupe on `event_id` or `slug`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MesaClosed {
    pub event_id: Uuid,
    pub slug: String,
    pub mesa_id: MesaId,
    pub jornada_id: Option<i32>,
    pub manager_id: i32,
    pub title: String,
    pub capacity: i32,
    pub is_open: bool,
    pub closed_at: DateTime<FixedOffset>,
    pub confirmed_count: i64,
    pub first_close: bool,
    pub timezone: String,
}

impl MesaClosed {
    pub fn from_snapshot(
        snapshot: MesaSnapshot,
        closed_at: DateTime<FixedOffset>,
        first_close: bool,
        timezone: &str,
    ) -> Self {
        let closed_at = snapshot.closed_at.unwrap_or(closed_at);
        Self {
            event_id: Uuid::new_v4(),
            slug: close_slug(snapshot.id, closed_at.date_naive()),
            mesa_id: snapshot.id,
            jornada_id: snapshot.jornada_id,
            manager_id: snapshot.manager_id,
            title: snapshot.title,
            capacity: snapshot.capacity,
            is_open: snapshot.is_open,
            closed_at,
            confirmed_count: snapshot.confirmed_count,
            first_close,
            timezone: timezone.to_string(),
        }
    }
}

/// Aggregate outcome of one push fan-out batch.
///
/// `total - sent - deleted` subscriptions ended in an unknown state and are
/// left for a later attempt.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushBatchResult {
    pub sent: usize,
    pub deleted: usize,
    pub total: usize,
}

impl PushBatchResult {
    pub fn unknown(&self) -> usize {
        self.total.saturating_sub(self.sent + self.deleted)
    }
}

impl AddAssign for PushBatchResult {
    fn add_assign(&mut self, rhs: Self) {
        self.sent += rhs.sent;
        self.deleted += rhs.deleted;
        self.total += rhs.total;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    Sent,
    Gone,
    Unknown,
}

impl PushOutcome {
    /// Maps a push service response status to an outcome. 404/410 mean the
    /// endpoint is permanently gone.
    pub fn from_status(status: u16) -> Self {
        match status {
            201 | 202 | 204 => PushOutcome::Sent,
            404 | 410 => PushOutcome::Gone,
            _ => PushOutcome::Unknown,
        }
    }
}
