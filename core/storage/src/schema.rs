//! Versioned schema migrations for the local store.
//!
//! Each step declares its DDL and an optional data fixup. DDL and the
//! version bump commit together, so a step is applied exactly once. A
//! fixup runs inside a savepoint: when it fails, its writes are rolled
//! back, the failure is recorded, and the pipeline moves on so that
//! opening the store never blocks app startup.

use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use jobsync_common::{EntityType, Error, Record, Result};
use jobsync_crypto::looks_encrypted;

/// Indexed JSON fields shared by every entity table.
const COMMON_INDEXED: &[&str] = &["owner_id", "status", "updated_at"];

/// Entity-specific indexed fields, added in schema version 5.
pub fn extra_indexed_fields(entity: EntityType) -> &'static [&'static str] {
    match entity {
        EntityType::Job => &["client_id", "scheduled_date"],
        EntityType::Quote => &["client_id", "job_id"],
        EntityType::Invoice => &["client_id", "job_id", "quote_id"],
        EntityType::Client => &[],
    }
}

/// Whether `where_equals` may query `field` on `entity`.
pub fn is_indexed(entity: EntityType, field: &str) -> bool {
    field == "id"
        || COMMON_INDEXED.contains(&field)
        || extra_indexed_fields(entity).contains(&field)
}

/// Name of the queue table.
pub const QUEUE_TABLE: &str = "sync_queue";

/// Current queue table layout; also used to rebuild it after corruption.
pub const QUEUE_TABLE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        action TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        sync_error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        sync_state TEXT NOT NULL DEFAULT 'pending'
    );
    CREATE INDEX IF NOT EXISTS idx_sync_queue_entity_type ON sync_queue(entity_type);
    CREATE INDEX IF NOT EXISTS idx_sync_queue_entity_id ON sync_queue(entity_id);
    CREATE INDEX IF NOT EXISTS idx_sync_queue_created_at ON sync_queue(created_at);
    CREATE INDEX IF NOT EXISTS idx_sync_queue_state ON sync_queue(sync_state);
"#;

/// A single schema step.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    /// DDL statements bringing the previous schema to this version.
    pub schema: fn() -> Vec<String>,
    /// Data fixup run after the DDL; failures are non-fatal.
    pub fixup: Option<fn(&Connection) -> Result<()>>,
}

/// A fixup that failed and was rolled back.
#[derive(Debug, Clone, Serialize)]
pub struct FixupFailure {
    pub version: u32,
    pub name: &'static str,
    pub error: String,
}

/// What happened while opening the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
    pub failed_fixups: Vec<FixupFailure>,
}

fn json_index(table: &str, field: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_{field} ON {table}(json_extract(data, '$.{field}'))"
    )
}

fn v1_base_tables() -> Vec<String> {
    let mut stmts = Vec::new();
    for entity in EntityType::ALL {
        let table = entity.table_name();
        stmts.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY NOT NULL, data TEXT NOT NULL)"
        ));
        for field in COMMON_INDEXED {
            stmts.push(json_index(table, field));
        }
    }
    stmts.push(
        r#"CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            sync_error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0
        )"#
        .to_string(),
    );
    stmts.push("CREATE INDEX IF NOT EXISTS idx_sync_queue_synced ON sync_queue(synced)".to_string());
    stmts.push(
        "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)"
            .to_string(),
    );
    stmts
}

fn v2_queue_indices() -> Vec<String> {
    vec![
        "DROP INDEX IF EXISTS idx_sync_queue_synced".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity_type ON sync_queue(entity_type)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity_id ON sync_queue(entity_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_created_at ON sync_queue(created_at)"
            .to_string(),
    ]
}

fn v3_encrypted_marker() -> Vec<String> {
    EntityType::ALL
        .iter()
        .map(|e| {
            format!(
                "ALTER TABLE {} ADD COLUMN encrypted INTEGER NOT NULL DEFAULT 0",
                e.table_name()
            )
        })
        .collect()
}

/// Mark legacy rows that were sealed before the marker existed.
fn backfill_encrypted_markers(conn: &Connection) -> Result<()> {
    for entity in [EntityType::Client, EntityType::Invoice, EntityType::Quote] {
        let table = entity.table_name();
        let rows: Vec<(String, String)> = {
            let mut stmt = conn
                .prepare(&format!("SELECT id, data FROM {table} WHERE encrypted = 0"))
                .map_err(|e| Error::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| Error::Storage(e.to_string()))?;
            rows.collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Storage(e.to_string()))?
        };

        let mut marked = 0usize;
        for (id, data) in rows {
            let record: Record = serde_json::from_str(&data)?;
            if looks_encrypted(entity, &record) {
                conn.execute(
                    &format!("UPDATE {table} SET encrypted = 1 WHERE id = ?1"),
                    params![id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
                marked += 1;
            }
        }
        debug!("Backfilled encrypted marker on {} {} rows", marked, table);
    }
    Ok(())
}

fn v4_queue_state() -> Vec<String> {
    vec![
        "ALTER TABLE sync_queue ADD COLUMN sync_state TEXT NOT NULL DEFAULT 'pending'".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_state ON sync_queue(sync_state)".to_string(),
    ]
}

fn backfill_queue_state(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"UPDATE sync_queue SET sync_state = CASE
            WHEN synced = 0 THEN 'pending'
            WHEN sync_error IS NOT NULL THEN 'abandoned'
            ELSE 'synced'
        END"#,
        [],
    )
    .map_err(|e| Error::Storage(e.to_string()))?;
    Ok(())
}

fn v5_entity_indices() -> Vec<String> {
    let mut stmts = Vec::new();
    for entity in EntityType::ALL {
        for field in extra_indexed_fields(entity) {
            stmts.push(json_index(entity.table_name(), field));
        }
    }
    stmts
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
    .map_err(|e| Error::Storage(e.to_string()))
}

/// Drop the legacy `synced` column once `sync_state` reflects it.
///
/// Rows the boolean marks as done but that still read `pending` (the v4
/// backfill was rolled back) are repaired first, so nothing finished is
/// replayed. If this fails the column simply stays.
fn drop_legacy_synced(conn: &Connection) -> Result<()> {
    if !has_column(conn, QUEUE_TABLE, "synced")? {
        return Ok(());
    }

    let repaired = conn
        .execute(
            r#"UPDATE sync_queue SET sync_state = CASE
                WHEN sync_error IS NOT NULL THEN 'abandoned'
                ELSE 'synced'
            END
            WHERE synced <> 0 AND sync_state = 'pending'"#,
            [],
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
    if repaired > 0 {
        warn!("Repaired sync_state of {} legacy queue rows", repaired);
    }

    conn.execute_batch("ALTER TABLE sync_queue DROP COLUMN synced")
        .map_err(|e| Error::Storage(e.to_string()))?;
    Ok(())
}

/// The ordered migration list.
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "base_tables",
            schema: v1_base_tables,
            fixup: None,
        },
        Migration {
            version: 2,
            name: "queue_indices_without_boolean",
            schema: v2_queue_indices,
            fixup: None,
        },
        Migration {
            version: 3,
            name: "encrypted_marker",
            schema: v3_encrypted_marker,
            fixup: Some(backfill_encrypted_markers),
        },
        Migration {
            version: 4,
            name: "queue_sync_state",
            schema: v4_queue_state,
            fixup: Some(backfill_queue_state),
        },
        Migration {
            version: 5,
            name: "entity_indices",
            schema: v5_entity_indices,
            fixup: Some(drop_legacy_synced),
        },
    ]
}

/// Latest schema version.
pub fn current_version() -> u32 {
    migrations().last().map(|m| m.version).unwrap_or(0)
}

/// Read the schema version stored in the database.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| Error::Storage(format!("Failed to read schema version: {}", e)))
}

/// Apply every migration newer than the stored schema version.
///
/// # Errors
/// - DDL failure (the store cannot be opened in a consistent shape)
///
/// Fixup failures are logged and reported, never returned.
pub fn run_migrations(conn: &mut Connection, steps: &[Migration]) -> Result<MigrationReport> {
    let from_version = schema_version(conn)?;
    let mut report = MigrationReport {
        from_version,
        to_version: from_version,
        ..Default::default()
    };

    for step in steps.iter().filter(|m| m.version > from_version) {
        let ddl_error =
            |e: rusqlite::Error| Error::Storage(format!("Migration {} failed: {}", step.name, e));

        let mut tx = conn.transaction().map_err(ddl_error)?;
        for stmt in (step.schema)() {
            tx.execute_batch(&stmt).map_err(ddl_error)?;
        }

        if let Some(fixup) = step.fixup {
            let sp = tx.savepoint().map_err(ddl_error)?;
            let outcome = fixup(&sp);
            match outcome {
                Ok(()) => sp.commit().map_err(ddl_error)?,
                Err(e) => {
                    warn!(
                        "Fixup for migration {} ({}) failed, continuing: {}",
                        step.version, step.name, e
                    );
                    report.failed_fixups.push(FixupFailure {
                        version: step.version,
                        name: step.name,
                        error: e.to_string(),
                    });
                    // Dropping the savepoint rolls back its writes.
                    drop(sp);
                }
            }
        }

        tx.execute_batch(&format!("PRAGMA user_version = {}", step.version))
            .map_err(ddl_error)?;
        tx.commit().map_err(ddl_error)?;

        debug!("Applied migration {} ({})", step.version, step.name);
        report.applied.push(step.version);
        report.to_version = step.version;
    }

    if !report.applied.is_empty() {
        info!(
            "Local store migrated from v{} to v{}",
            report.from_version, report.to_version
        );
    }
    Ok(report)
}
