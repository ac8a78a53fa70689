pub mod models;
pub mod schema;

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::DatabaseErrorKind;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use models::{
    HonorEvent, Mesa, NewHonorEvent, NewMesa, NewMesaRegistration, NewPushSubscription, NewUser,
    PushSubscription, Recipient,
};
use tracing::trace;

/// Registration status counted towards a mesa's attendance.
pub const REGISTRATION_CONFIRMED: &str = "confirmed";

/// Structured error type for all storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// The caller supplied invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A unique key rejected the write. For idempotency keys this means the
    /// logical event was already recorded.
    #[error("duplicate key: {0}")]
    Duplicate(String),
}

impl StorageError {
    /// Lifts unique violations out of the generic database error.
    fn from_write(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StorageError::Duplicate(info.message().to_string())
            }
            other => StorageError::Database(other),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::Duplicate(_))
    }
}

/// A mesa plus the number of confirmed registrations, read in one
/// transaction.
#[derive(Debug, Clone)]
pub struct MesaSummary {
    pub mesa: Mesa,
    pub confirmed_count: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(Store { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            f(&mut *conn)
        })
        .await?
    }

    // Users

    pub async fn insert_user(&self, user: NewUser) -> Result<i32, StorageError> {
        use schema::users::dsl as u;
        self.with_conn(move |conn| {
            diesel::insert_into(u::users)
                .values(&user)
                .returning(u::id)
                .get_result::<i32>(conn)
                .map_err(StorageError::from_write)
        })
        .await
    }

    /// Approved, unlocked users with `id > after_id`, ascending.
    pub async fn list_recipients(
        &self,
        opted_in_only: bool,
        after_id: i32,
        limit: i64,
    ) -> Result<Vec<Recipient>, StorageError> {
        use schema::users::dsl as u;
        self.with_conn(move |conn| {
            let mut query = u::users
                .select(Recipient::as_select())
                .filter(u::approved.eq(true))
                .filter(u::locked.eq(false))
                .filter(u::id.gt(after_id))
                .into_boxed();
            if opted_in_only {
                query = query.filter(u::notify_open_mesas.eq(true));
            }
            Ok(query
                .order(u::id.asc())
                .limit(limit)
                .load::<Recipient>(conn)?)
        })
        .await
    }

    /// Users without any honor event at or after `since`, keyset-paginated by id.
    pub async fn list_inactive_user_ids(
        &self,
        since: NaiveDateTime,
        after_id: i32,
        limit: i64,
    ) -> Result<Vec<i32>, StorageError> {
        use schema::honor_events::dsl as h;
        use schema::users::dsl as u;
        self.with_conn(move |conn| {
            let recent = h::honor_events
                .filter(h::occurred_at.ge(since))
                .select(h::user_id);
            Ok(u::users
                .filter(u::id.gt(after_id))
                .filter(u::id.ne_all(recent))
                .order(u::id.asc())
                .limit(limit)
                .select(u::id)
                .load::<i32>(conn)?)
        })
        .await
    }

    // Mesas

    pub async fn insert_mesa(&self, mesa: NewMesa) -> Result<i32, StorageError> {
        use schema::mesas::dsl as m;
        self.with_conn(move |conn| {
            Ok(diesel::insert_into(m::mesas)
                .values(&mesa)
                .returning(m::id)
                .get_result::<i32>(conn)?)
        })
        .await
    }

    pub async fn get_mesa(&self, mesa_id: i32) -> Result<Option<Mesa>, StorageError> {
        use schema::mesas::dsl as m;
        self.with_conn(move |conn| {
            Ok(m::mesas
                .filter(m::id.eq(mesa_id))
                .select(Mesa::as_select())
                .first::<Mesa>(conn)
                .optional()?)
        })
        .await
    }

    pub async fn insert_registration(
        &self,
        mesa_id: i32,
        user_id: i32,
        status: &str,
    ) -> Result<(), StorageError> {
        use schema::mesa_registrations;
        let status = status.to_string();
        self.with_conn(move |conn| {
            let row = NewMesaRegistration {
                mesa_id,
                user_id,
                status: &status,
            };
            diesel::insert_into(mesa_registrations::table)
                .values(&row)
                .execute(conn)
                .map_err(StorageError::from_write)?;
            Ok(())
        })
        .await
    }

    /// Open mesas whose opening is older than `cutoff` and that were never
    /// closed, keyset-paginated by id.
    pub async fn list_auto_close_candidates(
        &self,
        cutoff: NaiveDateTime,
        after_id: i32,
        limit: i64,
    ) -> Result<Vec<i32>, StorageError> {
        use schema::mesas::dsl as m;
        self.with_conn(move |conn| {
            Ok(m::mesas
                .filter(m::is_open.eq(true))
                .filter(m::opens_at.is_not_null())
                .filter(m::opens_at.lt(cutoff))
                .filter(m::closed_at.is_null())
                .filter(m::id.gt(after_id))
                .order(m::id.asc())
                .limit(limit)
                .select(m::id)
                .load::<i32>(conn)?)
        })
        .await
    }

    /// Guarded close. Returns the number of rows the update touched: 1 when
    /// this caller performed the transition, 0 when someone else already did.
    pub async fn close_mesa_if_open(
        &self,
        mesa_id: i32,
        now: NaiveDateTime,
    ) -> Result<usize, StorageError> {
        use schema::mesas::dsl as m;
        self.with_conn(move |conn| {
            let updated = diesel::update(
                m::mesas
                    .filter(m::id.eq(mesa_id))
                    .filter(m::is_open.eq(true))
                    .filter(m::closed_at.is_null()),
            )
            .set((m::is_open.eq(false), m::closed_at.eq(Some(now))))
            .execute(conn)?;
            trace!(mesa_id, updated, "close_mesa_if_open");
            Ok(updated)
        })
        .await
    }

    pub async fn mesa_summary(&self, mesa_id: i32) -> Result<Option<MesaSummary>, StorageError> {
        use schema::mesa_registrations::dsl as r;
        use schema::mesas::dsl as m;
        self.with_conn(move |conn| {
            conn.transaction(|conn| -> Result<Option<MesaSummary>, StorageError> {
                let Some(mesa) = m::mesas
                    .filter(m::id.eq(mesa_id))
                    .select(Mesa::as_select())
                    .first::<Mesa>(conn)
                    .optional()?
                else {
                    return Ok(None);
                };
                let confirmed_count = r::mesa_registrations
                    .filter(r::mesa_id.eq(mesa_id))
                    .filter(r::status.eq(REGISTRATION_CONFIRMED))
                    .count()
                    .get_result::<i64>(conn)?;
                Ok(Some(MesaSummary {
                    mesa,
                    confirmed_count,
                }))
            })
        })
        .await
    }

    /// Mesas opening within `[from, to)` whose opening was not announced yet,
    /// ordered by opening time.
    pub async fn list_due_open_notifications(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Mesa>, StorageError> {
        use schema::mesas::dsl as m;
        self.with_conn(move |conn| {
            Ok(m::mesas
                .filter(m::opens_notified_at.is_null())
                .filter(m::opens_at.is_not_null())
                .filter(m::opens_at.ge(from))
                .filter(m::opens_at.lt(to))
                .order((m::opens_at.asc(), m::id.asc()))
                .select(Mesa::as_select())
                .load::<Mesa>(conn)?)
        })
        .await
    }

    /// Stamps `opens_notified_at` on the given mesas that do not carry it yet.
    pub async fn mark_open_notified(
        &self,
        mesa_ids: &[i32],
        now: NaiveDateTime,
    ) -> Result<usize, StorageError> {
        use schema::mesas::dsl as m;
        if mesa_ids.is_empty() {
            return Ok(0);
        }
        let ids = mesa_ids.to_vec();
        self.with_conn(move |conn| {
            Ok(diesel::update(
                m::mesas
                    .filter(m::id.eq_any(ids))
                    .filter(m::opens_notified_at.is_null()),
            )
            .set(m::opens_notified_at.eq(Some(now)))
            .execute(conn)?)
        })
        .await
    }

    // Honor ledger

    /// Appends a ledger row. A repeated `(user_id, slug)` yields
    /// [`StorageError::Duplicate`] and writes nothing.
    pub async fn append_honor_event(&self, event: NewHonorEvent) -> Result<HonorEvent, StorageError> {
        use schema::honor_events::dsl as h;
        self.with_conn(move |conn| {
            diesel::insert_into(h::honor_events)
                .values(&event)
                .returning(HonorEvent::as_returning())
                .get_result::<HonorEvent>(conn)
                .map_err(StorageError::from_write)
        })
        .await
    }

    pub async fn list_honor_events(&self, user: i32) -> Result<Vec<HonorEvent>, StorageError> {
        use schema::honor_events::dsl as h;
        self.with_conn(move |conn| {
            Ok(h::honor_events
                .filter(h::user_id.eq(user))
                .order(h::id.asc())
                .select(HonorEvent::as_select())
                .load::<HonorEvent>(conn)?)
        })
        .await
    }

    pub async fn honor_balance(&self, user: i32) -> Result<i64, StorageError> {
        use diesel::dsl::sum;
        use schema::honor_events::dsl as h;
        self.with_conn(move |conn| {
            let total: Option<i64> = h::honor_events
                .filter(h::user_id.eq(user))
                .select(sum(h::delta))
                .first::<Option<i64>>(conn)?;
            Ok(total.unwrap_or(0))
        })
        .await
    }

    // Push subscriptions

    pub async fn upsert_push_subscription(
        &self,
        user_id: Option<i32>,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        content_encoding: &str,
    ) -> Result<PushSubscription, StorageError> {
        use schema::push_subscriptions::dsl as ps;
        let endpoint_owned = endpoint.to_string();
        let p256dh_owned = p256dh.to_string();
        let auth_owned = auth.to_string();
        let encoding_owned = content_encoding.to_string();
        trace!(endpoint = %endpoint_owned, "upsert_push_subscription starting");
        self.with_conn(move |conn| {
            let now = Utc::now().naive_utc();
            let new_row = NewPushSubscription {
                user_id,
                endpoint: &endpoint_owned,
                p256dh: &p256dh_owned,
                auth: &auth_owned,
                content_encoding: &encoding_owned,
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(ps::push_subscriptions)
                .values(&new_row)
                .on_conflict(ps::endpoint)
                .do_update()
                .set((
                    ps::user_id.eq(user_id),
                    ps::p256dh.eq(&p256dh_owned),
                    ps::auth.eq(&auth_owned),
                    ps::content_encoding.eq(&encoding_owned),
                    ps::updated_at.eq(now),
                ))
                .execute(conn)?;
            Ok(ps::push_subscriptions
                .filter(ps::endpoint.eq(&endpoint_owned))
                .select(PushSubscription::as_select())
                .first::<PushSubscription>(conn)?)
        })
        .await
    }

    pub async fn list_push_subscription_ids(
        &self,
        after_id: i32,
        limit: i64,
    ) -> Result<Vec<i32>, StorageError> {
        use schema::push_subscriptions::dsl as ps;
        self.with_conn(move |conn| {
            Ok(ps::push_subscriptions
                .filter(ps::id.gt(after_id))
                .order(ps::id.asc())
                .limit(limit)
                .select(ps::id)
                .load::<i32>(conn)?)
        })
        .await
    }

    pub async fn get_push_subscriptions(
        &self,
        ids: &[i32],
    ) -> Result<Vec<PushSubscription>, StorageError> {
        use schema::push_subscriptions::dsl as ps;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            Ok(ps::push_subscriptions
                .filter(ps::id.eq_any(ids))
                .order(ps::id.asc())
                .select(PushSubscription::as_select())
                .load::<PushSubscription>(conn)?)
        })
        .await
    }

    pub async fn delete_push_subscription(&self, subscription_id: i32) -> Result<bool, StorageError> {
        use schema::push_subscriptions::dsl as ps;
        self.with_conn(move |conn| {
            let deleted = diesel::delete(ps::push_subscriptions.filter(ps::id.eq(subscription_id)))
                .execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }

    // Shared key-value space (heartbeats)

    pub async fn cache_put(
        &self,
        key: &str,
        value: &str,
        expires_at: NaiveDateTime,
    ) -> Result<(), StorageError> {
        use schema::cache_entries::dsl as c;
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(c::cache_entries)
                .values((
                    c::key.eq(&key),
                    c::value.eq(&value),
                    c::expires_at.eq(expires_at),
                ))
                .on_conflict(c::key)
                .do_update()
                .set((c::value.eq(&value), c::expires_at.eq(expires_at)))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Value under `key` unless it expired before `now`.
    pub async fn cache_get(
        &self,
        key: &str,
        now: NaiveDateTime,
    ) -> Result<Option<String>, StorageError> {
        use schema::cache_entries::dsl as c;
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(c::cache_entries
                .filter(c::key.eq(&key))
                .filter(c::expires_at.gt(now))
                .select(c::value)
                .first::<String>(conn)
                .optional()?)
        })
        .await
    }

    // Named, time-boxed locks

    /// Takes `name` for `owner` until `expires_at` unless another owner holds
    /// an unexpired lock. Expired locks are reclaimed.
    pub async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        now: NaiveDateTime,
        expires_at: NaiveDateTime,
    ) -> Result<bool, StorageError> {
        use schema::scheduler_locks::dsl as l;
        let name = name.to_string();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            conn.immediate_transaction(|conn| -> Result<bool, StorageError> {
                diesel::delete(
                    l::scheduler_locks
                        .filter(l::name.eq(&name))
                        .filter(l::expires_at.le(now)),
                )
                .execute(conn)?;
                let inserted = diesel::insert_into(l::scheduler_locks)
                    .values((
                        l::name.eq(&name),
                        l::owner.eq(&owner),
                        l::expires_at.eq(expires_at),
                    ))
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                Ok(inserted == 1)
            })
        })
        .await
    }

    pub async fn release_lock(&self, name: &str, owner: &str) -> Result<bool, StorageError> {
        use schema::scheduler_locks::dsl as l;
        let name = name.to_string();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let deleted = diesel::delete(
                l::scheduler_locks
                    .filter(l::name.eq(&name))
                    .filter(l::owner.eq(&owner)),
            )
            .execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    Ok(())
}
