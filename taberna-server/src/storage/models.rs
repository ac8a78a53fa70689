use crate::storage::schema::{
    honor_events, mesa_registrations, mesas, push_subscriptions, users,
};
use chrono::NaiveDateTime;
use diesel::prelude::*;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub approved: bool,
    pub locked: bool,
    pub notify_open_mesas: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub approved: bool,
    pub locked: bool,
    pub notify_open_mesas: bool,
}

/// Columns needed to address a notification.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable)]
#[diesel(table_name = users)]
pub struct Recipient {
    pub id: i32,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = mesas)]
pub struct Mesa {
    pub id: i32,
    pub jornada_id: Option<i32>,
    pub title: String,
    pub capacity: i32,
    pub opens_at: Option<NaiveDateTime>,
    pub is_open: bool,
    pub closed_at: Option<NaiveDateTime>,
    pub opens_notified_at: Option<NaiveDateTime>,
    pub manager_id: i32,
    pub created_by: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = mesas)]
pub struct NewMesa {
    pub jornada_id: Option<i32>,
    pub title: String,
    pub capacity: i32,
    pub opens_at: Option<NaiveDateTime>,
    pub is_open: bool,
    pub closed_at: Option<NaiveDateTime>,
    pub opens_notified_at: Option<NaiveDateTime>,
    pub manager_id: i32,
    pub created_by: i32,
}

impl NewMesa {
    /// An open mesa created by its own manager.
    pub fn open(title: impl Into<String>, opens_at: NaiveDateTime, manager_id: i32) -> Self {
        Self {
            jornada_id: None,
            title: title.into(),
            capacity: 6,
            opens_at: Some(opens_at),
            is_open: true,
            closed_at: None,
            opens_notified_at: None,
            manager_id,
            created_by: manager_id,
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = mesa_registrations)]
#[diesel(belongs_to(Mesa, foreign_key = mesa_id))]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct MesaRegistration {
    pub id: i32,
    pub mesa_id: i32,
    pub user_id: i32,
    pub status: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = mesa_registrations)]
pub struct NewMesaRegistration<'a> {
    pub mesa_id: i32,
    pub user_id: i32,
    pub status: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = honor_events)]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct HonorEvent {
    pub id: i32,
    pub user_id: i32,
    pub delta: i32,
    pub reason: String,
    pub mesa_id: Option<i32>,
    pub occurred_at: NaiveDateTime,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = honor_events)]
pub struct NewHonorEvent {
    pub user_id: i32,
    pub delta: i32,
    pub reason: String,
    pub mesa_id: Option<i32>,
    pub occurred_at: NaiveDateTime,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = push_subscriptions)]
pub struct PushSubscription {
    pub id: i32,
    pub user_id: Option<i32>,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub content_encoding: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = push_subscriptions)]
pub struct NewPushSubscription<'a> {
    pub user_id: Option<i32>,
    pub endpoint: &'a str,
    pub p256dh: &'a str,
    pub auth: &'a str,
    pub content_encoding: &'a str,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
