#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use diesel::{Connection, RunQueryDsl, SqliteConnection};
use mockable::Clock;
use taberna_server::server::events::{EventError, EventSink};
use taberna_server::server::mail::{MailError, MailMessage, MailTransport};
use taberna_server::server::AppConfig;
use taberna_server::storage::Store;
use taberna_server::storage::models::NewUser;
use taberna_shared::domain::MesaClosed;

pub const APP_URL: &str = "https://taberna.test";

pub struct TestDb {
    pub store: Store,
    path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::connect_sqlite(path.to_str().unwrap())
            .await
            .expect("db");
        Self {
            store,
            path,
            _dir: dir,
        }
    }

    /// Drops `table` behind the store's back to make its writes fail.
    pub fn drop_table(&self, table: &str) {
        let mut conn = SqliteConnection::establish(self.path.to_str().unwrap()).unwrap();
        diesel::sql_query(format!("DROP TABLE {table}"))
            .execute(&mut conn)
            .unwrap();
    }
}

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
}

pub fn naive(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, s)
        .unwrap()
}

pub async fn add_user(store: &Store, name: &str) -> i32 {
    add_user_with(store, name, true, false, true).await
}

pub async fn add_user_with(
    store: &Store,
    name: &str,
    approved: bool,
    locked: bool,
    notify_open_mesas: bool,
) -> i32 {
    store
        .insert_user(NewUser {
            name: name.into(),
            email: format!("{}@taberna.test", name.to_lowercase()),
            approved,
            locked,
            notify_open_mesas,
        })
        .await
        .unwrap()
}

/// Config with defaults plus `extra` YAML appended at top level.
pub fn config(extra: &str) -> AppConfig {
    let yaml = format!("app_url: \"{APP_URL}\"\n{extra}");
    AppConfig::from_yaml(&yaml).expect("test config")
}

/// Clock pinned to a settable instant.
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(now)))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Keeps every message; fails delivery for addresses listed in `failing`.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<MailMessage>>,
    failing: Vec<String>,
}

impl RecordingMailer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(addresses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            failing: addresses.iter().map(|a| a.to_string()).collect(),
        })
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<MailMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.to == address)
            .collect()
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(&self, message: MailMessage) -> Result<(), MailError> {
        if self.failing.contains(&message.to) {
            return Err(MailError::Status(503));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MesaClosed>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records the event, then reports a listener failure.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn events(&self) -> Vec<MesaClosed> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &MesaClosed) -> Result<(), EventError> {
        self.events.lock().unwrap().push(event.clone());
        if self.fail {
            return Err(EventError::Listener {
                listener: "recording".into(),
                reason: "boom".into(),
            });
        }
        Ok(())
    }
}
