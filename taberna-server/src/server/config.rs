use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use std::{env, fs, ops::RangeInclusive, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Public base URL used to build deep links in notifications.
    pub app_url: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub honor: HonorConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub mail: MailConfig,
    pub push: Option<PushConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub auto_close_after_hours: i64,
    pub chunk_size: i64,
    pub throttle_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_close_after_hours: 8,
            chunk_size: 200,
            throttle_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HonorConfig {
    pub inactivity_days: i64,
    pub chunk_size: i64,
    pub throttle_ms: u64,
    pub decay_delta: i32,
}

impl Default for HonorConfig {
    fn default() -> Self {
        Self {
            inactivity_days: 30,
            chunk_size: 500,
            throttle_ms: 50,
            decay_delta: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipientPolicy {
    /// Every approved, unlocked user.
    Broadcast,
    /// Approved, unlocked users that keep `notify_open_mesas` on.
    OptIn,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub tolerance_seconds: i64,
    pub recipients: RecipientPolicy,
    pub recipient_chunk_size: i64,
    pub concurrency: usize,
    pub push_on_open: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            tolerance_seconds: 60,
            recipients: RecipientPolicy::Broadcast,
            recipient_chunk_size: 500,
            concurrency: 4,
            push_on_open: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailDriver {
    Log,
    Relay,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub driver: MailDriver,
    pub from: String,
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    pub timeout_secs: u64,
    pub queue: bool,
    pub queue_capacity: usize,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            driver: MailDriver::Log,
            from: "La Taberna <no-reply@localhost>".into(),
            relay_url: None,
            relay_token: None,
            timeout_secs: 10,
            queue: false,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub vapid_public: Option<String>,
    pub vapid_private: Option<String>,
    /// Contact URI placed in the token's `sub` claim (`mailto:` or `https:`).
    pub subject: String,
    #[serde(default = "default_push_ttl")]
    pub ttl_seconds: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_push_chunk")]
    pub chunk_size: i64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSchedule {
    pub every_minutes: Option<u32>,
    /// Local wall-clock time, `HH:MM`.
    pub daily_at: Option<String>,
    #[serde(default = "default_lock_minutes")]
    pub lock_minutes: i64,
    #[serde(default)]
    pub skip_during_busy_hours: bool,
}

impl TaskSchedule {
    fn every(minutes: u32, lock_minutes: i64) -> Self {
        Self {
            every_minutes: Some(minutes),
            daily_at: None,
            lock_minutes,
            skip_during_busy_hours: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusyHoursConfig {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub auto_close: TaskSchedule,
    pub open_notifications: TaskSchedule,
    pub honor_decay: TaskSchedule,
    pub heartbeat: TaskSchedule,
    pub busy_hours: Option<BusyHoursConfig>,
    pub heartbeat_ttl_seconds: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            auto_close: TaskSchedule::every(15, 10),
            open_notifications: TaskSchedule::every(1, 5),
            honor_decay: TaskSchedule {
                every_minutes: None,
                daily_at: Some("03:15".into()),
                lock_minutes: 60,
                skip_during_busy_hours: true,
            },
            heartbeat: TaskSchedule::every(1, 1),
            busy_hours: None,
            heartbeat_ttl_seconds: 300,
        }
    }
}

fn default_timezone() -> String {
    "Europe/Madrid".into()
}

fn default_lock_minutes() -> i64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_push_ttl() -> u32 {
    86_400
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_push_chunk() -> i64 {
    100
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Yaml(e) => write!(f, "YAML error: {}", e),
            ConfigError::Invalid(m) => write!(f, "invalid config: {}", m),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        ConfigError::Yaml(value)
    }
}

/// Parses `HH:MM` (or `HH:MM:SS`).
pub fn parse_clock_time(value: &str) -> Result<NaiveTime, ConfigError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::Invalid(format!("expected HH:MM, got {value:?}")))
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load_from_path(path)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::Invalid(format!("timezone {:?}: {e}", self.timezone)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;
        url::Url::parse(&self.app_url)
            .map_err(|e| ConfigError::Invalid(format!("app_url: {e}")))?;

        let s = &self.schedule;
        for (name, task) in [
            ("auto_close", &s.auto_close),
            ("open_notifications", &s.open_notifications),
            ("honor_decay", &s.honor_decay),
            ("heartbeat", &s.heartbeat),
        ] {
            match (task.every_minutes, task.daily_at.as_deref()) {
                (Some(0), _) => {
                    return Err(ConfigError::Invalid(format!(
                        "schedule.{name}.every_minutes must be positive"
                    )));
                }
                (Some(_), None) => {}
                (None, Some(at)) => {
                    parse_clock_time(at)?;
                }
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "schedule.{name} needs exactly one of every_minutes or daily_at"
                    )));
                }
            }
            check_range(
                &format!("schedule.{name}.lock_minutes"),
                task.lock_minutes,
                1..=MAX_LOCK_MINUTES,
            )?;
        }
        if let Some(busy) = &s.busy_hours {
            parse_clock_time(&busy.start)?;
            parse_clock_time(&busy.end)?;
        }

        if self.mail.driver == MailDriver::Relay && self.mail.relay_url.is_none() {
            return Err(ConfigError::Invalid(
                "mail.relay_url is required for the relay driver".into(),
            ));
        }
        if self.lifecycle.chunk_size <= 0 || self.honor.chunk_size <= 0 {
            return Err(ConfigError::Invalid("chunk sizes must be positive".into()));
        }

        check_range(
            "lifecycle.auto_close_after_hours",
            self.lifecycle.auto_close_after_hours,
            1..=MAX_AUTO_CLOSE_HOURS,
        )?;
        check_range(
            "honor.inactivity_days",
            self.honor.inactivity_days,
            1..=MAX_INACTIVITY_DAYS,
        )?;
        check_range(
            "notifications.tolerance_seconds",
            self.notifications.tolerance_seconds,
            0..=MAX_TOLERANCE_SECONDS,
        )?;
        check_range(
            "schedule.heartbeat_ttl_seconds",
            s.heartbeat_ttl_seconds,
            1..=MAX_HEARTBEAT_TTL_SECONDS,
        )?;
        Ok(())
    }
}

const MAX_AUTO_CLOSE_HOURS: i64 = 24 * 365;
const MAX_INACTIVITY_DAYS: i64 = 3650;
const MAX_LOCK_MINUTES: i64 = 24 * 60;
const MAX_TOLERANCE_SECONDS: i64 = 24 * 3600;
const MAX_HEARTBEAT_TTL_SECONDS: i64 = 7 * 24 * 3600;

fn check_range(name: &str, value: i64, range: RangeInclusive<i64>) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must be within {}..={}, got {value}",
            range.start(),
            range.end()
        )))
    }
}
