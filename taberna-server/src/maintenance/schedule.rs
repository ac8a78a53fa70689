use std::fmt;

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;

use crate::server::{ConfigError, ScheduleConfig, TaskSchedule, parse_clock_time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    AutoClose,
    OpenNotifications,
    HonorDecay,
    Heartbeat,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::AutoClose,
        TaskKind::OpenNotifications,
        TaskKind::HonorDecay,
        TaskKind::Heartbeat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::AutoClose => "auto_close",
            TaskKind::OpenNotifications => "open_notifications",
            TaskKind::HonorDecay => "honor_decay",
            TaskKind::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a task fires, evaluated on local wall-clock minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Every `n` minutes counted from local midnight.
    EveryMinutes(u32),
    DailyAt(NaiveTime),
}

impl Cadence {
    pub fn is_due(&self, local: NaiveDateTime) -> bool {
        match *self {
            Cadence::EveryMinutes(n) => {
                let minute_of_day = local.hour() * 60 + local.minute();
                n > 0 && minute_of_day % n == 0
            }
            Cadence::DailyAt(at) => local.hour() == at.hour() && local.minute() == at.minute(),
        }
    }
}

/// Local time window, `[start, end)`, that may wrap past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl BusyHours {
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPlan {
    pub cadence: Cadence,
    /// Hold time of the overlap lock.
    pub lock: Duration,
    pub skip_during_busy_hours: bool,
}

impl TaskPlan {
    fn from_config(cfg: &TaskSchedule) -> Result<Self, ConfigError> {
        let cadence = match (cfg.every_minutes, cfg.daily_at.as_deref()) {
            (Some(n), None) if n > 0 => Cadence::EveryMinutes(n),
            (None, Some(at)) => Cadence::DailyAt(parse_clock_time(at)?),
            _ => {
                return Err(ConfigError::Invalid(
                    "task needs exactly one of every_minutes or daily_at".into(),
                ));
            }
        };
        Ok(Self {
            cadence,
            lock: Duration::minutes(cfg.lock_minutes),
            skip_during_busy_hours: cfg.skip_during_busy_hours,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Schedule {
    auto_close: TaskPlan,
    open_notifications: TaskPlan,
    honor_decay: TaskPlan,
    heartbeat: TaskPlan,
    busy_hours: Option<BusyHours>,
}

impl Schedule {
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self, ConfigError> {
        let busy_hours = match &cfg.busy_hours {
            Some(b) => Some(BusyHours {
                start: parse_clock_time(&b.start)?,
                end: parse_clock_time(&b.end)?,
            }),
            None => None,
        };
        Ok(Self {
            auto_close: TaskPlan::from_config(&cfg.auto_close)?,
            open_notifications: TaskPlan::from_config(&cfg.open_notifications)?,
            honor_decay: TaskPlan::from_config(&cfg.honor_decay)?,
            heartbeat: TaskPlan::from_config(&cfg.heartbeat)?,
            busy_hours,
        })
    }

    pub fn plan(&self, kind: TaskKind) -> &TaskPlan {
        match kind {
            TaskKind::AutoClose => &self.auto_close,
            TaskKind::OpenNotifications => &self.open_notifications,
            TaskKind::HonorDecay => &self.honor_decay,
            TaskKind::Heartbeat => &self.heartbeat,
        }
    }

    pub fn is_busy(&self, local: NaiveTime) -> bool {
        self.busy_hours.is_some_and(|b| b.contains(local))
    }

    /// Whether `kind` should be held back at `local` because of busy hours.
    pub fn suppressed(&self, kind: TaskKind, local: NaiveTime) -> bool {
        self.plan(kind).skip_during_busy_hours && self.is_busy(local)
    }

    /// Tasks whose cadence matches the local minute `local`.
    pub fn due(&self, local: NaiveDateTime) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| self.plan(*kind).cadence.is_due(local))
            .collect()
    }
}
