//! SQLite-backed local store.
//!
//! Holds the four entity collections, the mutation queue and a key/value
//! metadata table. Entity rows keep the record as JSON plus an explicit
//! `encrypted` marker; secondary indices are JSON-expression indices.

use rusqlite::{
    ffi::ErrorCode, params, params_from_iter, types::Value as SqlValue, Connection,
    OptionalExtension, Row,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use jobsync_common::{
    normalize_timestamp, now_timestamp, record_id, EntityType, Error, Record, Result,
};

use crate::queue::{NewQueueItem, QueueItem, QueuePatch, QueueState};
use crate::schema::{self, MigrationReport, QUEUE_TABLE, QUEUE_TABLE_DDL};
use crate::validator::validate_new_item;

/// Metadata key set once the encryption migration completed.
pub const META_ENCRYPTION_MIGRATED: &str = "encryption_migration_complete";

/// Metadata key holding the last successful bulk fetch of an entity kind.
pub fn last_fetch_key(entity: EntityType) -> String {
    format!("last_fetch_{}", entity.table_name())
}

fn default_cooldown_secs() -> u64 {
    60
}

/// Local store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Minimum time between two queue corruption recoveries.
    #[serde(default = "default_cooldown_secs")]
    pub corruption_cooldown_secs: u64,
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn corruption_cooldown(&self) -> Duration {
        Duration::from_secs(self.corruption_cooldown_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            corruption_cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Per-collection counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub jobs: u64,
    pub quotes: u64,
    pub invoices: u64,
    pub clients: u64,
    pub queue_total: u64,
    pub pending_sync: u64,
}

/// A stored entity row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub data: Record,
    /// Whether the sensitive fields of `data` are sealed.
    pub encrypted: bool,
}

impl StoredRecord {
    /// A row whose sensitive fields are in plaintext.
    pub fn plain(data: Record) -> Self {
        Self {
            data,
            encrypted: false,
        }
    }

    pub fn id(&self) -> Result<&str> {
        record_id(&self.data)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidInput("Record has no string id".to_string()))
    }
}

/// Map a SQLite error on entity or metadata tables.
pub(crate) fn map_sqlite(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => Error::QuotaExceeded(e.to_string()),
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            Error::Corruption(e.to_string())
        }
        _ => Error::Storage(e.to_string()),
    }
}

/// Any failing query against the queue table is treated as corruption.
fn map_queue_error(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => Error::QuotaExceeded(e.to_string()),
        _ => Error::Corruption(format!("Queue table query failed: {}", e)),
    }
}

fn conversion_error(idx: usize, e: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

const QUEUE_COLUMNS: &str =
    "id, entity_type, entity_id, action, data, created_at, updated_at, sync_state, sync_error, retry_count";

fn queue_item_from_row(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let entity_type: String = row.get(1)?;
    let action: String = row.get(3)?;
    let data: String = row.get(4)?;
    let state: String = row.get(7)?;

    Ok(QueueItem {
        id: row.get(0)?,
        entity_type: entity_type.parse().map_err(|e| conversion_error(1, e))?,
        entity_id: row.get(2)?,
        action: action.parse().map_err(|e| conversion_error(3, e))?,
        data: serde_json::from_str(&data).map_err(|e| conversion_error(4, e.into()))?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        state: state.parse().map_err(|e| conversion_error(7, e))?,
        sync_error: row.get(8)?,
        retry_count: row.get(9)?,
    })
}

fn parse_rows(rows: Vec<(String, bool)>) -> Result<Vec<StoredRecord>> {
    rows.into_iter()
        .map(|(data, encrypted)| {
            Ok(StoredRecord {
                data: serde_json::from_str(&data)?,
                encrypted,
            })
        })
        .collect()
}

fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(*b as i64)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

/// Durable local storage.
pub struct LocalStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
    /// Failed queue queries since the last recovery.
    queue_errors: AtomicU32,
    last_recovery: Mutex<Option<Instant>>,
    report: MigrationReport,
}

impl LocalStore {
    /// Open (or create) the store and bring its schema up to date.
    ///
    /// # Errors
    /// - Database cannot be opened
    /// - A migration's DDL fails (fixup failures are only reported)
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut conn = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path).map_err(map_sqlite)?
            }
            None => Connection::open_in_memory().map_err(map_sqlite)?,
        };
        conn.busy_timeout(Duration::from_secs(5)).map_err(map_sqlite)?;

        let report = schema::run_migrations(&mut conn, &schema::migrations())?;
        info!("Local store opened at schema v{}", report.to_version);

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            queue_errors: AtomicU32::new(0),
            last_recovery: Mutex::new(None),
            report,
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(StoreConfig::default())
    }

    /// Outcome of the migrations run when the store was opened.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Connection lock poisoned".to_string()))
    }

    /// Access one entity collection.
    pub fn entities(&self, entity: EntityType) -> EntityTable<'_> {
        EntityTable {
            store: self,
            entity,
        }
    }

    fn queue_op<T>(&self, op: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn()?;
        op(&conn).map_err(|e| {
            let err = map_queue_error(e);
            if matches!(err, Error::Corruption(_)) {
                let count = self.queue_errors.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Queue query failed ({} since last recovery): {}", count, err);
            }
            err
        })
    }

    /// Validate and append a mutation to the queue.
    ///
    /// # Errors
    /// - `Validation` when the item is malformed (nothing is written)
    /// - `QuotaExceeded` when the device is out of space
    /// - `Corruption` when the queue table is unusable
    pub fn add_queue_item(&self, item: &NewQueueItem) -> Result<i64> {
        let validation = validate_new_item(item);
        if !validation.valid {
            return Err(Error::Validation(validation.errors));
        }

        let data = serde_json::to_string(&item.data)?;
        // Replay order is `ORDER BY created_at`, so offsets and fractional
        // seconds must not leak into the stored text.
        let created_at = normalize_timestamp(&item.created_at)
            .ok_or_else(|| Error::Validation(vec!["created_at must be a valid timestamp".into()]))?;
        let id = self.queue_op(|conn| {
            conn.execute(
                "INSERT INTO sync_queue (entity_type, entity_id, action, data, created_at, retry_count, sync_state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.entity_type.as_str(),
                    item.entity_id,
                    item.action.as_str(),
                    data,
                    created_at,
                    item.retry_count,
                    QueueState::Pending.as_str(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(
            "Queued {} {} {} as #{}",
            item.action, item.entity_type, item.entity_id, id
        );
        Ok(id)
    }

    /// Apply a partial update to a queue item and stamp `updated_at`.
    pub fn update_queue_item(&self, id: i64, patch: &QueuePatch) -> Result<()> {
        let mut sets = vec!["updated_at = ?1".to_string()];
        let mut values = vec![SqlValue::Text(now_timestamp())];

        if let Some(state) = patch.state {
            values.push(SqlValue::Text(state.as_str().to_string()));
            sets.push(format!("sync_state = ?{}", values.len()));
        }
        if let Some(error) = &patch.sync_error {
            values.push(match error {
                Some(e) => SqlValue::Text(e.clone()),
                None => SqlValue::Null,
            });
            sets.push(format!("sync_error = ?{}", values.len()));
        }
        if let Some(retry_count) = patch.retry_count {
            values.push(SqlValue::Integer(i64::from(retry_count)));
            sets.push(format!("retry_count = ?{}", values.len()));
        }
        values.push(SqlValue::Integer(id));

        let sql = format!(
            "UPDATE {QUEUE_TABLE} SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );
        let changed = self.queue_op(|conn| conn.execute(&sql, params_from_iter(values.iter())))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Queue item #{}", id)));
        }
        Ok(())
    }

    /// Fetch one queue item.
    pub fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>> {
        self.queue_op(|conn| {
            conn.query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM {QUEUE_TABLE} WHERE id = ?1"),
                params![id],
                queue_item_from_row,
            )
            .optional()
        })
    }

    /// Every queue item, oldest first.
    pub fn queue_items(&self) -> Result<Vec<QueueItem>> {
        self.queue_op(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM {QUEUE_TABLE} ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([], queue_item_from_row)?;
            rows.collect()
        })
    }

    /// Items awaiting replay, ordered by `created_at` then insertion.
    pub fn pending_queue_items(&self) -> Result<Vec<QueueItem>> {
        self.queue_op(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM {QUEUE_TABLE} WHERE sync_state = ?1 ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([QueueState::Pending.as_str()], queue_item_from_row)?;
            rows.collect()
        })
    }

    /// Number of items awaiting replay.
    pub fn count_pending(&self) -> Result<u64> {
        self.queue_op(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {QUEUE_TABLE} WHERE sync_state = ?1"),
                [QueueState::Pending.as_str()],
                |row| row.get(0),
            )
        })
    }

    /// Remove every queue item.
    pub fn clear_queue(&self) -> Result<()> {
        self.queue_op(|conn| conn.execute(&format!("DELETE FROM {QUEUE_TABLE}"), []))?;
        info!("Sync queue cleared");
        Ok(())
    }

    /// Failed queue queries since the last recovery.
    pub fn queue_error_count(&self) -> u32 {
        self.queue_errors.load(Ordering::SeqCst)
    }

    /// Rebuild the queue table after a failed query.
    ///
    /// Drops every queued mutation. Runs at most once per configured
    /// cool-down window and returns `false` when skipped.
    pub fn recover_corrupted_queue(&self) -> Result<bool> {
        let mut last = self
            .last_recovery
            .lock()
            .map_err(|_| Error::Storage("Recovery lock poisoned".to_string()))?;

        if let Some(at) = *last {
            if at.elapsed() < self.config.corruption_cooldown() {
                warn!("Queue recovery skipped: last recovery {:?} ago", at.elapsed());
                return Ok(false);
            }
        }

        let conn = self.conn()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {QUEUE_TABLE}; {QUEUE_TABLE_DDL}"))
            .map_err(map_sqlite)?;
        drop(conn);

        *last = Some(Instant::now());
        self.queue_errors.store(0, Ordering::SeqCst);
        warn!("Sync queue rebuilt after corruption; pending mutations were dropped");
        Ok(true)
    }

    /// Read a metadata value.
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(map_sqlite)
    }

    /// Insert or overwrite a metadata value.
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    /// Per-collection counts plus queue size, for observability.
    pub fn get_stats(&self) -> Result<StoreStats> {
        let (queue_total, pending_sync) = self.queue_op(|conn| {
            conn.query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(sync_state = 'pending'), 0) FROM {QUEUE_TABLE}"
                ),
                [],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?)),
            )
        })?;

        Ok(StoreStats {
            jobs: self.entities(EntityType::Job).count()?,
            quotes: self.entities(EntityType::Quote).count()?,
            invoices: self.entities(EntityType::Invoice).count()?,
            clients: self.entities(EntityType::Client).count()?,
            queue_total,
            pending_sync,
        })
    }

    /// Delete every row of every table (logout).
    pub fn wipe(&self) -> Result<()> {
        let conn = self.conn()?;
        let mut sql = String::new();
        for entity in EntityType::ALL {
            sql.push_str(&format!("DELETE FROM {};", entity.table_name()));
        }
        sql.push_str("DELETE FROM metadata;");
        conn.execute_batch(&sql).map_err(map_sqlite)?;
        drop(conn);

        if let Err(e) = self.queue_op(|conn| conn.execute(&format!("DELETE FROM {QUEUE_TABLE}"), [])) {
            warn!("Queue wipe failed, rebuilding table: {}", e);
            let conn = self.conn()?;
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {QUEUE_TABLE}; {QUEUE_TABLE_DDL}"))
                .map_err(map_sqlite)?;
        }

        info!("Local store wiped");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql).map_err(map_sqlite)
    }
}

/// One entity collection of the local store.
pub struct EntityTable<'a> {
    store: &'a LocalStore,
    entity: EntityType,
}

impl<'a> EntityTable<'a> {
    pub fn entity(&self) -> EntityType {
        self.entity
    }

    fn table(&self) -> &'static str {
        self.entity.table_name()
    }

    fn select(&self, clause: &str, values: Vec<SqlValue>) -> Result<Vec<StoredRecord>> {
        let conn = self.store.conn()?;
        let rows: Vec<(String, bool)> = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT data, encrypted FROM {} {} ORDER BY id",
                    self.table(),
                    clause
                ))
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get(0)?, row.get::<_, i64>(1)? != 0))
                })
                .map_err(map_sqlite)?;
            rows.collect::<rusqlite::Result<_>>().map_err(map_sqlite)?
        };
        parse_rows(rows)
    }

    /// Fetch a record by id.
    pub fn get(&self, id: &str) -> Result<Option<StoredRecord>> {
        let mut rows = self.select("WHERE id = ?1", vec![SqlValue::Text(id.to_string())])?;
        Ok(rows.pop())
    }

    /// Insert a record; fails if the id already exists.
    pub fn add(&self, record: &StoredRecord) -> Result<()> {
        let id = record.id()?;
        let data = serde_json::to_string(&record.data)?;
        let conn = self.store.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, data, encrypted) VALUES (?1, ?2, ?3)",
                self.table()
            ),
            params![id, data, record.encrypted],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => {
                Error::Conflict(format!("{} {} already exists", self.entity, id))
            }
            _ => map_sqlite(e),
        })?;
        Ok(())
    }

    /// Insert or replace a record.
    pub fn put(&self, record: &StoredRecord) -> Result<()> {
        self.bulk_put(std::slice::from_ref(record)).map(|_| ())
    }

    /// Insert or replace many records in one transaction.
    pub fn bulk_put(&self, records: &[StoredRecord]) -> Result<usize> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO {} (id, data, encrypted) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data, encrypted = excluded.encrypted",
                    self.table()
                ))
                .map_err(map_sqlite)?;
            for record in records {
                let data = serde_json::to_string(&record.data)?;
                stmt.execute(params![record.id()?, data, record.encrypted])
                    .map_err(map_sqlite)?;
            }
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(records.len())
    }

    /// Records whose indexed `field` equals `value`.
    ///
    /// # Errors
    /// - `InvalidInput` if `field` is not indexed for this entity
    pub fn where_equals(&self, field: &str, value: &Value) -> Result<Vec<StoredRecord>> {
        if !schema::is_indexed(self.entity, field) {
            return Err(Error::InvalidInput(format!(
                "{} is not an indexed field of {}",
                field,
                self.table()
            )));
        }

        let column = if field == "id" {
            "id".to_string()
        } else {
            format!("json_extract(data, '$.{}')", field)
        };

        match json_to_sql(value) {
            Some(v) => self.select(&format!("WHERE {} = ?1", column), vec![v]),
            None => self.select(&format!("WHERE {} IS NULL", column), Vec::new()),
        }
    }

    /// Every record of the collection.
    pub fn to_vec(&self) -> Result<Vec<StoredRecord>> {
        self.select("", Vec::new())
    }

    /// Physically remove a record. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn
            .execute(&format!("DELETE FROM {} WHERE id = ?1", self.table()), [id])
            .map_err(map_sqlite)?;
        Ok(changed > 0)
    }

    /// Remove every record of the collection.
    pub fn clear(&self) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(&format!("DELETE FROM {}", self.table()), [])
            .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.store.conn()?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table()), [], |row| {
            row.get(0)
        })
        .map_err(map_sqlite)
    }
}
