//! SQLite schema DDL and migrations for the persistent response cache.

use rusqlite::Connection;

use crate::errors::{FederationError, FederationResult};

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const CACHE_SCHEMA_VERSION: i32 = 1;

/// Bookkeeping tables, executed with `CREATE … IF NOT EXISTS` on every open
/// so migrations always have somewhere to record their progress.
pub const CACHE_META_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cache_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        applied_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

/// Create tables and bring the schema up to date.
pub fn init_schema(conn: &Connection) -> FederationResult<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    for stmt in CACHE_META_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    migrate_schema(conn)
}

/// Run pending migrations, one SAVEPOINT per step.
pub fn migrate_schema(conn: &Connection) -> FederationResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < CACHE_SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT cache_migrate_step;")?;

        let step_result = (|| -> FederationResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                other => {
                    return Err(FederationError::internal(format!(
                        "no cache schema migration to version {other}"
                    )))
                }
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT cache_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT cache_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT cache_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Stored schema version, 0 when absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM cache_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> FederationResult<()> {
    conn.execute(
        "INSERT INTO cache_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> FederationResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

/// v0 -> v1: the response table and its eviction indexes.
fn migrate_to_v1(conn: &Connection) -> FederationResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS query_cache (
            key_hash TEXT PRIMARY KEY,
            repo_set_id TEXT NOT NULL,
            manifest_hash TEXT NOT NULL,
            created_at REAL NOT NULL,
            last_used_at REAL NOT NULL,
            size_bytes INTEGER NOT NULL,
            payload BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_query_cache_last_used
            ON query_cache(last_used_at, created_at, key_hash);
        CREATE INDEX IF NOT EXISTS idx_query_cache_repo_set ON query_cache(repo_set_id);",
    )?;
    Ok(())
}
