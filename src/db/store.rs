//! SQLite-backed archive of events and temperature snapshots.
//!
//! One connection serializes writes; a second one serves reads so dashboards do
//! not queue behind a long insert batch. Both run in WAL mode.

use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::dsl::{count_star, max, min};
use diesel::prelude::*;
use diesel::sqlite::{Sqlite, SqliteConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{info, warn};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::credentials::{EventArchiveSettings, TemperatureLogSettings};
use crate::db::consumption::{Bucket, ConsumptionBucket, integrate};
use crate::db::models::{
    Event, EventArchiveSettingsRow, NewEvent, NewTemperatureSnapshot, TemperatureLogSettingsRow, TemperatureSnapshot,
};
use crate::schema;
use crate::services::fetch::SeenEvents;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;";

#[derive(Debug)]
pub enum StoreError {
    Connection(String),
    /// Schema could not be brought up to date. Fatal at startup.
    Migration(String),
    Query(diesel::result::Error),
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Connection(e) => write!(f, "database connection failed: {}", e),
            StoreError::Migration(e) => write!(f, "applying database migrations failed: {}", e),
            StoreError::Query(e) => write!(f, "database query failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Query(e) => Some(e),
            _ => None,
        }
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Query(value)
    }
}

/// Outcome of a batch save. Failed rows are logged and skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub inserted: usize,
    pub ignored: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub installation_id: Option<String>,
    pub account_id: Option<String>,
    pub device_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub installation_id: Option<String>,
    pub gateway_id: Option<String>,
    pub device_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    pub total: i64,
    pub by_type: Vec<(String, i64)>,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

fn connect(path: &str) -> Result<SqliteConnection, StoreError> {
    let mut conn = SqliteConnection::establish(path).map_err(|e| StoreError::Connection(e.to_string()))?;
    conn.batch_execute(CONNECTION_PRAGMAS)?;
    Ok(conn)
}

fn apply_migrations(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    if applied.is_empty() {
        info!("Store: schema is up to date; no migrations were applied");
    } else {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Store: applied {} migration(s): {}", applied.len(), names);
    }
    Ok(())
}

fn retention_cutoff(retention_days: u32, now: DateTime<Utc>) -> Option<i64> {
    (retention_days > 0).then(|| now.timestamp() - i64::from(retention_days) * 86_400)
}

pub struct Store {
    path: String,
    writer: Mutex<SqliteConnection>,
    reader: Mutex<SqliteConnection>,
}

impl Store {
    /// Opens (creating if needed) the database file and applies pending migrations.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let mut writer = connect(path)?;
        writer.batch_execute("PRAGMA journal_mode = WAL;")?;
        apply_migrations(&mut writer)?;
        let reader = connect(path)?;
        info!("Store: opened {}", path);
        Ok(Store {
            path: path.to_string(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn writer(&self) -> MutexGuard<'_, SqliteConnection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader(&self) -> MutexGuard<'_, SqliteConnection> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts events, ignoring rows whose hash is already stored.
    pub fn save_events(&self, rows: &[NewEvent]) -> Result<SaveReport, StoreError> {
        if rows.is_empty() {
            return Ok(SaveReport::default());
        }
        use schema::events::dsl as E;

        let mut conn = self.writer();
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut report = SaveReport::default();
            for row in rows {
                match diesel::insert_into(E::events)
                    .values(row)
                    .on_conflict(E::hash)
                    .do_nothing()
                    .execute(conn)
                {
                    Ok(0) => report.ignored += 1,
                    Ok(_) => report.inserted += 1,
                    Err(e) => {
                        warn!("Store: event {} not saved: {}", row.hash, e);
                        report.failed += 1;
                    }
                }
            }
            Ok(report)
        })
        .map_err(StoreError::from)
    }

    /// Upserts snapshots; a row with an existing key replaces the stored readings.
    pub fn save_snapshots(&self, rows: &[NewTemperatureSnapshot]) -> Result<SaveReport, StoreError> {
        if rows.is_empty() {
            return Ok(SaveReport::default());
        }
        use schema::temperature_snapshots::dsl as S;

        let mut conn = self.writer();
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let mut report = SaveReport::default();
            for row in rows {
                match diesel::insert_into(S::temperature_snapshots)
                    .values(row)
                    .on_conflict((S::sample_time, S::installation_id, S::gateway_id, S::device_id))
                    .do_update()
                    .set(row)
                    .execute(conn)
                {
                    Ok(_) => report.inserted += 1,
                    Err(e) => {
                        warn!(
                            "Store: snapshot {}/{}/{} at {} not saved: {}",
                            row.installation_id, row.gateway_id, row.device_id, row.sample_time, e
                        );
                        report.failed += 1;
                    }
                }
            }
            Ok(report)
        })
        .map_err(StoreError::from)
    }

    pub fn contains_event_hash(&self, hash: &str) -> Result<bool, StoreError> {
        use schema::events::dsl as E;
        let found = E::events
            .filter(E::hash.eq(hash))
            .select(E::id)
            .first::<i64>(&mut *self.reader())
            .optional()?;
        Ok(found.is_some())
    }

    /// Events matching the filter, newest first.
    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StoreError> {
        use schema::events::dsl as E;

        let mut q = E::events.select(Event::as_select()).into_boxed::<Sqlite>();
        if let Some(from) = filter.from {
            q = q.filter(E::event_time.ge(from.timestamp()));
        }
        if let Some(to) = filter.to {
            q = q.filter(E::event_time.le(to.timestamp()));
        }
        if let Some(v) = &filter.installation_id {
            q = q.filter(E::installation_id.eq(v.clone()));
        }
        if let Some(v) = &filter.account_id {
            q = q.filter(E::account_id.eq(v.clone()));
        }
        if let Some(v) = &filter.device_id {
            q = q.filter(E::device_id.eq(v.clone()));
        }
        if let Some(v) = &filter.event_type {
            q = q.filter(E::event_type.eq(v.clone()));
        }
        if let Some(v) = &filter.severity {
            q = q.filter(E::severity.eq(v.clone()));
        }
        if let Some(limit) = filter.limit {
            q = q.limit(limit);
        }

        Ok(q
            .order((E::event_time.desc(), E::id.desc()))
            .load(&mut *self.reader())?)
    }

    /// Snapshots matching the filter, oldest first.
    pub fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<TemperatureSnapshot>, StoreError> {
        use schema::temperature_snapshots::dsl as S;

        let mut q = S::temperature_snapshots
            .select(TemperatureSnapshot::as_select())
            .into_boxed::<Sqlite>();
        if let Some(from) = filter.from {
            q = q.filter(S::sample_time.ge(from.timestamp()));
        }
        if let Some(to) = filter.to {
            q = q.filter(S::sample_time.le(to.timestamp()));
        }
        if let Some(v) = &filter.installation_id {
            q = q.filter(S::installation_id.eq(v.clone()));
        }
        if let Some(v) = &filter.gateway_id {
            q = q.filter(S::gateway_id.eq(v.clone()));
        }
        if let Some(v) = &filter.device_id {
            q = q.filter(S::device_id.eq(v.clone()));
        }
        if let Some(limit) = filter.limit {
            q = q.limit(limit);
        }

        Ok(q
            .order((S::sample_time.asc(), S::id.asc()))
            .load(&mut *self.reader())?)
    }

    pub fn event_stats(&self) -> Result<EventStats, StoreError> {
        use schema::events::dsl as E;
        let mut conn = self.reader();

        let total = E::events.select(count_star()).first::<i64>(&mut *conn)?;
        let by_type = E::events
            .group_by(E::event_type)
            .select((E::event_type, count_star()))
            .order(E::event_type.asc())
            .load::<(String, i64)>(&mut *conn)?;
        let (oldest, newest) = E::events
            .select((min(E::event_time), max(E::event_time)))
            .first::<(Option<i64>, Option<i64>)>(&mut *conn)?;

        Ok(EventStats {
            total,
            by_type,
            oldest,
            newest,
        })
    }

    /// Hourly or daily energy totals for one device.
    pub fn consumption(
        &self,
        filter: &SnapshotFilter,
        bucket: Bucket,
        default_interval_min: i32,
    ) -> Result<Vec<ConsumptionBucket>, StoreError> {
        let rows = self.query_snapshots(filter)?;
        Ok(integrate(&rows, bucket, default_interval_min))
    }

    /// Deletes events older than the retention window. `0` keeps everything.
    pub fn cleanup_events(&self, retention_days: u32, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let Some(cutoff) = retention_cutoff(retention_days, now) else {
            return Ok(0);
        };
        use schema::events::dsl as E;
        Ok(diesel::delete(E::events.filter(E::event_time.lt(cutoff))).execute(&mut *self.writer())?)
    }

    /// Deletes snapshots older than the retention window. `0` keeps everything.
    pub fn cleanup_snapshots(&self, retention_days: u32, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let Some(cutoff) = retention_cutoff(retention_days, now) else {
            return Ok(0);
        };
        use schema::temperature_snapshots::dsl as S;
        Ok(diesel::delete(S::temperature_snapshots.filter(S::sample_time.lt(cutoff))).execute(&mut *self.writer())?)
    }

    pub fn record_event_archive_settings(&self, s: &EventArchiveSettings, now: DateTime<Utc>) -> Result<(), StoreError> {
        use schema::event_archive_settings::dsl as A;
        let row = EventArchiveSettingsRow {
            id: 1,
            enabled: s.enabled,
            interval_minutes: clamp_i32(s.interval_minutes),
            retention_days: clamp_i32(s.retention_days),
            days_back: clamp_i32(s.days_back),
            updated_at: now.timestamp(),
        };
        diesel::replace_into(A::event_archive_settings)
            .values(&row)
            .execute(&mut *self.writer())?;
        Ok(())
    }

    pub fn record_temperature_log_settings(&self, s: &TemperatureLogSettings, now: DateTime<Utc>) -> Result<(), StoreError> {
        use schema::temperature_log_settings::dsl as T;
        let row = TemperatureLogSettingsRow {
            id: 1,
            enabled: s.enabled,
            sample_interval_minutes: clamp_i32(s.sample_interval_minutes),
            retention_days: clamp_i32(s.retention_days),
            updated_at: now.timestamp(),
        };
        diesel::replace_into(T::temperature_log_settings)
            .values(&row)
            .execute(&mut *self.writer())?;
        Ok(())
    }

    pub fn recorded_event_archive_settings(&self) -> Result<Option<EventArchiveSettingsRow>, StoreError> {
        use schema::event_archive_settings::dsl as A;
        Ok(A::event_archive_settings
            .select(EventArchiveSettingsRow::as_select())
            .first(&mut *self.reader())
            .optional()?)
    }

    pub fn recorded_temperature_log_settings(&self) -> Result<Option<TemperatureLogSettingsRow>, StoreError> {
        use schema::temperature_log_settings::dsl as T;
        Ok(T::temperature_log_settings
            .select(TemperatureLogSettingsRow::as_select())
            .first(&mut *self.reader())
            .optional()?)
    }
}

fn clamp_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

impl SeenEvents for Store {
    fn contains_event_hash(&self, hash: &str) -> Result<bool, StoreError> {
        Store::contains_event_hash(self, hash)
    }
}
