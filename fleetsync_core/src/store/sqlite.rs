//! SQLite persistence for tracking records, reference tables and fact tables.
//!
//! Fact tables carry named foreign keys to the reference tables. SQLite reports a violated
//! foreign key without naming it, so the store resolves the constraint name itself by
//! looking for the missing parent row after the transaction is rolled back.

use crate::entities::{Device, Diagnostic, FactEntity, FaultData, LogRecord, StatusData};
use crate::environment::AdapterVersion;
use crate::models::{FeedVersion, ServiceKind, ServiceTrackingRecord};
use crate::traits::{
    FactStore, LivenessProbe, MaintenanceStore, ReferenceStore, ServiceTracker,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use std::collections::BTreeSet;
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS service_tracking (
    service TEXT PRIMARY KEY,
    adapter_version TEXT,
    adapter_machine_name TEXT,
    last_processed_feed_version INTEGER,
    entities_last_processed_at TEXT,
    started_at TEXT,
    last_heartbeat_at TEXT
);

CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    serial_number TEXT,
    device_type TEXT,
    active_from TEXT,
    active_to TEXT,
    version INTEGER,
    record_last_changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS diagnostics (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    code INTEGER,
    unit_of_measure TEXT,
    source TEXT,
    record_last_changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS log_records (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    date_time TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    speed REAL NOT NULL,
    record_creation_at TEXT NOT NULL,
    CONSTRAINT fk_log_records_devices FOREIGN KEY (device_id) REFERENCES devices(id)
);
CREATE INDEX IF NOT EXISTS idx_log_records_device_time ON log_records(device_id, date_time);

CREATE TABLE IF NOT EXISTS status_data (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    diagnostic_id TEXT NOT NULL,
    date_time TEXT NOT NULL,
    data REAL,
    record_creation_at TEXT NOT NULL,
    CONSTRAINT fk_status_data_devices FOREIGN KEY (device_id) REFERENCES devices(id),
    CONSTRAINT fk_status_data_diagnostics FOREIGN KEY (diagnostic_id) REFERENCES diagnostics(id)
);
CREATE INDEX IF NOT EXISTS idx_status_data_device_time ON status_data(device_id, date_time);

CREATE TABLE IF NOT EXISTS fault_data (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    diagnostic_id TEXT NOT NULL,
    date_time TEXT NOT NULL,
    failure_mode TEXT,
    fault_state TEXT,
    record_creation_at TEXT NOT NULL,
    CONSTRAINT fk_fault_data_devices FOREIGN KEY (device_id) REFERENCES devices(id),
    CONSTRAINT fk_fault_data_diagnostics FOREIGN KEY (diagnostic_id) REFERENCES diagnostics(id)
);
CREATE INDEX IF NOT EXISTS idx_fault_data_device_time ON fault_data(device_id, date_time);
"#;

/// `sqlx` SQLite pool implementing every persistence seam.
#[derive(Clone)]
pub struct SqliteSyncStore {
    pool: SqlitePool,
}

impl SqliteSyncStore {
    /// Connect to `url` (e.g. `sqlite://fleetsync.db`), creating the file and schema if needed.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn new(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::backend("invalid sqlite url", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("connect sqlite", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. One connection, kept for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("invalid sqlite url", e))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("connect sqlite", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::backend("sqlite migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Row count of a fact or reference table.
    pub async fn count(&self, table: &str) -> Result<i64> {
        if !KNOWN_TABLES.contains(&table) {
            return Err(Error::InvalidInput(format!("unknown table '{table}'")));
        }
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i64, _>("n"))
    }

    async fn update_tracking<'q>(
        &self,
        service: ServiceKind,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<()> {
        let done = query.execute(&self.pool).await.map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(Error::ServiceNotRegistered(service));
        }
        Ok(())
    }

    /// Name the constraint a rejected batch violated by finding a parent row that is missing.
    async fn resolve_foreign_key<T: FactRow>(&self, batch: &[T]) -> Result<Option<&'static str>> {
        for fk in T::FOREIGN_KEYS {
            let ids: BTreeSet<&str> = batch.iter().map(|row| (fk.column)(row)).collect();
            for id in ids {
                let found = sqlx::query(&format!("SELECT 1 FROM {} WHERE id = ?1", fk.parent))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?;
                if found.is_none() {
                    return Ok(Some(fk.constraint));
                }
            }
        }
        Ok(None)
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, batch, to_version),
        fields(entity_type = %T::ENTITY_TYPE, count = batch.len(), feed_version = %to_version)
    )]
    async fn persist_rows<T: FactRow>(
        &self,
        service: ServiceKind,
        batch: &[T],
        to_version: FeedVersion,
        processed_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let created_at = processed_at.to_rfc3339();
        let mut written = 0u64;
        for row in batch {
            let result = row
                .bind_insert(sqlx::query(T::INSERT_SQL), &created_at)
                .execute(&mut *tx)
                .await;
            match result {
                Ok(done) => written += done.rows_affected(),
                Err(e) if is_foreign_key_error(&e) => {
                    let message = e.to_string();
                    tx.rollback().await.map_err(db_err)?;
                    let constraint = self.resolve_foreign_key(batch).await?;
                    return Err(Error::ForeignKeyViolation {
                        constraint: constraint.map(str::to_string),
                        message,
                    });
                }
                Err(e) => return Err(db_err(e)),
            }
        }

        let cursor = sqlx::query(
            "UPDATE service_tracking
             SET last_processed_feed_version = ?1, entities_last_processed_at = ?2
             WHERE service = ?3",
        )
        .bind(to_version.0)
        .bind(processed_at.to_rfc3339())
        .bind(service.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if cursor.rows_affected() == 0 {
            return Err(Error::ServiceNotRegistered(service));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }
}

const KNOWN_TABLES: [&str; 6] = [
    "service_tracking",
    "devices",
    "diagnostics",
    "log_records",
    "status_data",
    "fault_data",
];

fn db_err(e: sqlx::Error) -> Error {
    Error::backend("sqlite_sync_store", e)
}

fn is_foreign_key_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation)
                || db.message().contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| Error::backend(format!("invalid timestamp '{s}'"), e))
}

fn parse_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_dt).transpose()
}

fn row_to_tracking(r: &SqliteRow) -> Result<ServiceTrackingRecord> {
    let service: String = r.get("service");
    let version: Option<String> = r.get("adapter_version");
    Ok(ServiceTrackingRecord {
        service: service
            .parse()
            .map_err(|e| Error::backend("service_tracking.service", e))?,
        adapter_version: version.map(|v| v.parse::<AdapterVersion>()).transpose()?,
        adapter_machine_name: r.get("adapter_machine_name"),
        last_processed_feed_version: r
            .get::<Option<i64>, _>("last_processed_feed_version")
            .map(FeedVersion),
        entities_last_processed_at: parse_opt_dt(r.get("entities_last_processed_at"))?,
        started_at: parse_opt_dt(r.get("started_at"))?,
        last_heartbeat_at: parse_opt_dt(r.get("last_heartbeat_at"))?,
    })
}

const TRACKING_COLUMNS: &str = "service, adapter_version, adapter_machine_name, \
     last_processed_feed_version, entities_last_processed_at, started_at, last_heartbeat_at";

struct ForeignKey<T> {
    constraint: &'static str,
    parent: &'static str,
    column: fn(&T) -> &str,
}

/// Table mapping for a fact entity.
trait FactRow: FactEntity {
    const INSERT_SQL: &'static str;
    const FOREIGN_KEYS: &'static [ForeignKey<Self>];

    fn bind_insert<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        created_at: &str,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>>;
}

impl FactRow for LogRecord {
    const INSERT_SQL: &'static str = "INSERT INTO log_records
         (id, device_id, date_time, latitude, longitude, speed, record_creation_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
           device_id = excluded.device_id,
           date_time = excluded.date_time,
           latitude = excluded.latitude,
           longitude = excluded.longitude,
           speed = excluded.speed";
    const FOREIGN_KEYS: &'static [ForeignKey<Self>] = &[ForeignKey {
        constraint: "fk_log_records_devices",
        parent: "devices",
        column: |r| r.device_id.as_str(),
    }];

    fn bind_insert<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        created_at: &str,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.id.clone())
            .bind(self.device_id.clone())
            .bind(self.date_time.to_rfc3339())
            .bind(self.latitude)
            .bind(self.longitude)
            .bind(f64::from(self.speed))
            .bind(created_at.to_string())
    }
}

impl FactRow for StatusData {
    const INSERT_SQL: &'static str = "INSERT INTO status_data
         (id, device_id, diagnostic_id, date_time, data, record_creation_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
           device_id = excluded.device_id,
           diagnostic_id = excluded.diagnostic_id,
           date_time = excluded.date_time,
           data = excluded.data";
    const FOREIGN_KEYS: &'static [ForeignKey<Self>] = &[
        ForeignKey {
            constraint: "fk_status_data_devices",
            parent: "devices",
            column: |r| r.device_id.as_str(),
        },
        ForeignKey {
            constraint: "fk_status_data_diagnostics",
            parent: "diagnostics",
            column: |r| r.diagnostic_id.as_str(),
        },
    ];

    fn bind_insert<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        created_at: &str,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.id.clone())
            .bind(self.device_id.clone())
            .bind(self.diagnostic_id.clone())
            .bind(self.date_time.to_rfc3339())
            .bind(self.data)
            .bind(created_at.to_string())
    }
}

impl FactRow for FaultData {
    const INSERT_SQL: &'static str = "INSERT INTO fault_data
         (id, device_id, diagnostic_id, date_time, failure_mode, fault_state, record_creation_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
           device_id = excluded.device_id,
           diagnostic_id = excluded.diagnostic_id,
           date_time = excluded.date_time,
           failure_mode = excluded.failure_mode,
           fault_state = excluded.fault_state";
    const FOREIGN_KEYS: &'static [ForeignKey<Self>] = &[
        ForeignKey {
            constraint: "fk_fault_data_devices",
            parent: "devices",
            column: |r| r.device_id.as_str(),
        },
        ForeignKey {
            constraint: "fk_fault_data_diagnostics",
            parent: "diagnostics",
            column: |r| r.diagnostic_id.as_str(),
        },
    ];

    fn bind_insert<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        created_at: &str,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.id.clone())
            .bind(self.device_id.clone())
            .bind(self.diagnostic_id.clone())
            .bind(self.date_time.to_rfc3339())
            .bind(self.failure_mode.clone())
            .bind(self.fault_state.clone())
            .bind(created_at.to_string())
    }
}

// ── ServiceTracker impl ────────────────────────────────────────

#[async_trait]
impl ServiceTracker for SqliteSyncStore {
    async fn tracking_records(&self) -> Result<Vec<ServiceTrackingRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACKING_COLUMNS} FROM service_tracking ORDER BY service"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_tracking).collect()
    }

    async fn tracking_record(&self, service: ServiceKind) -> Result<Option<ServiceTrackingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {TRACKING_COLUMNS} FROM service_tracking WHERE service = ?1"
        ))
        .bind(service.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_tracking).transpose()
    }

    async fn register_service(
        &self,
        service: ServiceKind,
        started_at: DateTime<Utc>,
    ) -> Result<ServiceTrackingRecord> {
        sqlx::query(
            "INSERT INTO service_tracking (service, started_at) VALUES (?1, ?2)
             ON CONFLICT(service) DO UPDATE SET started_at = excluded.started_at",
        )
        .bind(service.as_str())
        .bind(started_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.tracking_record(service)
            .await?
            .ok_or(Error::ServiceNotRegistered(service))
    }

    async fn stamp_identity(
        &self,
        service: ServiceKind,
        version: &AdapterVersion,
        machine_name: &str,
    ) -> Result<()> {
        let query = sqlx::query(
            "UPDATE service_tracking SET adapter_version = ?1, adapter_machine_name = ?2
             WHERE service = ?3",
        )
        .bind(version.to_string())
        .bind(machine_name.to_string())
        .bind(service.as_str());
        self.update_tracking(service, query).await
    }

    async fn heartbeat(&self, service: ServiceKind, at: DateTime<Utc>) -> Result<()> {
        let query =
            sqlx::query("UPDATE service_tracking SET last_heartbeat_at = ?1 WHERE service = ?2")
                .bind(at.to_rfc3339())
                .bind(service.as_str());
        self.update_tracking(service, query).await
    }

    async fn record_processed(
        &self,
        service: ServiceKind,
        feed_version: Option<FeedVersion>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = sqlx::query(
            "UPDATE service_tracking
             SET entities_last_processed_at = ?1,
                 last_processed_feed_version = COALESCE(?2, last_processed_feed_version)
             WHERE service = ?3",
        )
        .bind(at.to_rfc3339())
        .bind(feed_version.map(|v| v.0))
        .bind(service.as_str());
        self.update_tracking(service, query).await
    }

    async fn rewrite_cursor(
        &self,
        service: ServiceKind,
        feed_version: Option<FeedVersion>,
    ) -> Result<()> {
        let query = sqlx::query(
            "UPDATE service_tracking SET last_processed_feed_version = ?1 WHERE service = ?2",
        )
        .bind(feed_version.map(|v| v.0))
        .bind(service.as_str());
        self.update_tracking(service, query).await
    }
}

// ── Reference tables ───────────────────────────────────────────

#[async_trait]
impl ReferenceStore<Device> for SqliteSyncStore {
    #[tracing::instrument(level = "debug", skip(self, items), fields(count = items.len()))]
    async fn upsert(&self, items: &[Device], at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut written = 0u64;
        for d in items {
            let done = sqlx::query(
                "INSERT INTO devices
                 (id, name, serial_number, device_type, active_from, active_to, version, record_last_changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   serial_number = excluded.serial_number,
                   device_type = excluded.device_type,
                   active_from = excluded.active_from,
                   active_to = excluded.active_to,
                   version = excluded.version,
                   record_last_changed_at = excluded.record_last_changed_at",
            )
            .bind(&d.id)
            .bind(&d.name)
            .bind(&d.serial_number)
            .bind(&d.device_type)
            .bind(d.active_from.map(|t| t.to_rfc3339()))
            .bind(d.active_to.map(|t| t.to_rfc3339()))
            .bind(d.version)
            .bind(at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            written += done.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }
}

#[async_trait]
impl ReferenceStore<Diagnostic> for SqliteSyncStore {
    #[tracing::instrument(level = "debug", skip(self, items), fields(count = items.len()))]
    async fn upsert(&self, items: &[Diagnostic], at: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut written = 0u64;
        for d in items {
            let done = sqlx::query(
                "INSERT INTO diagnostics
                 (id, name, code, unit_of_measure, source, record_last_changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   code = excluded.code,
                   unit_of_measure = excluded.unit_of_measure,
                   source = excluded.source,
                   record_last_changed_at = excluded.record_last_changed_at",
            )
            .bind(&d.id)
            .bind(&d.name)
            .bind(d.code)
            .bind(&d.unit_of_measure)
            .bind(&d.source)
            .bind(at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            written += done.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }
}

// ── Fact tables ────────────────────────────────────────────────

#[async_trait]
impl FactStore<LogRecord> for SqliteSyncStore {
    async fn persist(
        &self,
        service: ServiceKind,
        batch: &[LogRecord],
        to_version: FeedVersion,
        processed_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.persist_rows(service, batch, to_version, processed_at)
            .await
    }
}

#[async_trait]
impl FactStore<StatusData> for SqliteSyncStore {
    async fn persist(
        &self,
        service: ServiceKind,
        batch: &[StatusData],
        to_version: FeedVersion,
        processed_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.persist_rows(service, batch, to_version, processed_at)
            .await
    }
}

#[async_trait]
impl FactStore<FaultData> for SqliteSyncStore {
    async fn persist(
        &self,
        service: ServiceKind,
        batch: &[FaultData],
        to_version: FeedVersion,
        processed_at: DateTime<Utc>,
    ) -> Result<u64> {
        self.persist_rows(service, batch, to_version, processed_at)
            .await
    }
}

// ── Health and maintenance ─────────────────────────────────────

#[async_trait]
impl LivenessProbe for SqliteSyncStore {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn probe(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl MaintenanceStore for SqliteSyncStore {
    #[tracing::instrument(level = "info", skip(self))]
    async fn run_maintenance(&self) -> Result<()> {
        sqlx::query("PRAGMA optimize")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        // WAL checkpoints are a no-op for in-memory databases.
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, minute, 0).unwrap()
    }

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            name: format!("Truck {id}"),
            serial_number: Some(format!("SN-{id}")),
            device_type: Some("GO9".to_string()),
            active_from: Some(ts(0)),
            active_to: None,
            version: Some(1),
        }
    }

    fn diagnostic(id: &str) -> Diagnostic {
        Diagnostic {
            id: id.to_string(),
            name: format!("Diagnostic {id}"),
            code: Some(42),
            unit_of_measure: Some("km/h".to_string()),
            source: None,
        }
    }

    fn status(id: &str, device_id: &str, diagnostic_id: &str) -> StatusData {
        StatusData {
            id: id.to_string(),
            device_id: device_id.to_string(),
            diagnostic_id: diagnostic_id.to_string(),
            date_time: ts(5),
            data: Some(12.5),
        }
    }

    async fn store_with_service(service: ServiceKind) -> SqliteSyncStore {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        store.register_service(service, ts(0)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn tracking_record_lifecycle() {
        let store = store_with_service(ServiceKind::LogRecordFeed).await;
        let record = store
            .tracking_record(ServiceKind::LogRecordFeed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.started_at, Some(ts(0)));
        assert_eq!(record.last_processed_feed_version, None);

        store
            .stamp_identity(ServiceKind::LogRecordFeed, &AdapterVersion::new(1, 4, 2), "host-a")
            .await
            .unwrap();
        store.heartbeat(ServiceKind::LogRecordFeed, ts(1)).await.unwrap();
        store
            .record_processed(ServiceKind::LogRecordFeed, Some(FeedVersion(10)), ts(2))
            .await
            .unwrap();
        store
            .record_processed(ServiceKind::LogRecordFeed, None, ts(3))
            .await
            .unwrap();

        let record = store
            .tracking_record(ServiceKind::LogRecordFeed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.adapter_version, Some(AdapterVersion::new(1, 4, 2)));
        assert_eq!(record.adapter_machine_name.as_deref(), Some("host-a"));
        assert_eq!(record.last_heartbeat_at, Some(ts(1)));
        assert_eq!(record.last_processed_feed_version, Some(FeedVersion(10)));
        assert_eq!(record.entities_last_processed_at, Some(ts(3)));

        store
            .rewrite_cursor(ServiceKind::LogRecordFeed, None)
            .await
            .unwrap();
        let record = store
            .tracking_record(ServiceKind::LogRecordFeed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.last_processed_feed_version, None);
        assert_eq!(store.tracking_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn updates_to_unregistered_service_are_fatal() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let err = store
            .heartbeat(ServiceKind::FaultDataFeed, ts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotRegistered(ServiceKind::FaultDataFeed)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn persist_writes_rows_and_cursor_together() {
        let store = store_with_service(ServiceKind::StatusDataFeed).await;
        ReferenceStore::<Device>::upsert(&store, &[device("b1")], ts(0))
            .await
            .unwrap();
        ReferenceStore::<Diagnostic>::upsert(&store, &[diagnostic("g1")], ts(0))
            .await
            .unwrap();

        let batch = vec![status("s1", "b1", "g1"), status("s2", "b1", "g1")];
        let written = store
            .persist(ServiceKind::StatusDataFeed, batch.as_slice(), FeedVersion(7), ts(9))
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.count("status_data").await.unwrap(), 2);

        // Re-delivered rows are upserted, not duplicated.
        store
            .persist(ServiceKind::StatusDataFeed, batch.as_slice(), FeedVersion(8), ts(10))
            .await
            .unwrap();
        assert_eq!(store.count("status_data").await.unwrap(), 2);

        let record = store
            .tracking_record(ServiceKind::StatusDataFeed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.last_processed_feed_version, Some(FeedVersion(8)));
        assert_eq!(record.entities_last_processed_at, Some(ts(10)));
    }

    #[tokio::test]
    async fn missing_parent_names_the_constraint_and_rolls_back() {
        let store = store_with_service(ServiceKind::StatusDataFeed).await;
        ReferenceStore::<Device>::upsert(&store, &[device("b1")], ts(0))
            .await
            .unwrap();

        let batch = vec![status("s1", "b1", "g404")];
        let err = store
            .persist(ServiceKind::StatusDataFeed, batch.as_slice(), FeedVersion(3), ts(4))
            .await
            .unwrap_err();
        match err {
            Error::ForeignKeyViolation { constraint, .. } => {
                assert_eq!(constraint.as_deref(), Some("fk_status_data_diagnostics"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count("status_data").await.unwrap(), 0);
        let record = store
            .tracking_record(ServiceKind::StatusDataFeed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.last_processed_feed_version, None);
    }

    #[tokio::test]
    async fn log_record_without_device_violates_device_key() {
        let store = store_with_service(ServiceKind::LogRecordFeed).await;
        let record = LogRecord {
            id: "l1".to_string(),
            device_id: "b9".to_string(),
            date_time: ts(1),
            latitude: 43.6,
            longitude: -79.4,
            speed: 54.0,
        };
        let err = store
            .persist(ServiceKind::LogRecordFeed, &[record], FeedVersion(1), ts(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ForeignKeyViolation { constraint: Some(ref c), .. }
                if c == "fk_log_records_devices"
        ));
    }

    #[tokio::test]
    async fn reference_upsert_is_idempotent() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        let mut d = device("b1");
        ReferenceStore::<Device>::upsert(&store, &[d.clone()], ts(0))
            .await
            .unwrap();
        d.name = "Renamed".to_string();
        ReferenceStore::<Device>::upsert(&store, &[d], ts(1))
            .await
            .unwrap();
        assert_eq!(store.count("devices").await.unwrap(), 1);
        let name: String = sqlx::query("SELECT name FROM devices WHERE id = 'b1'")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("name");
        assert_eq!(name, "Renamed");
    }

    #[tokio::test]
    async fn probe_and_maintenance_succeed() {
        let store = SqliteSyncStore::in_memory().await.unwrap();
        store.probe().await.unwrap();
        store.run_maintenance().await.unwrap();
        assert!(store.count("not_a_table").await.is_err());
    }
}
