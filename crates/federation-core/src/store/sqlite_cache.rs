//! SQLite-backed response cache, one database per repo set.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::config::CachePolicy;
use crate::errors::FederationResult;
use crate::models::FederatedResponse;
use crate::store::query_cache::{CacheScope, QueryCache};
use crate::store::schema::init_schema;

pub const CACHE_DIR_NAME: &str = "federation";
pub const CACHE_FILE_NAME: &str = "query-cache.sqlite";

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// `<cacheRoot>/federation/<repoSetId>/query-cache.sqlite`
pub fn cache_db_path(cache_root: &Path, repo_set_id: &str) -> PathBuf {
    cache_root
        .join(CACHE_DIR_NAME)
        .join(repo_set_id)
        .join(CACHE_FILE_NAME)
}

/// Persistent cache. Each call opens its own connection so concurrent
/// coordinators never share one.
pub struct SqliteQueryCache {
    default_root: Option<PathBuf>,
    max_entries: usize,
    max_bytes: usize,
    ttl_seconds: f64,
}

impl SqliteQueryCache {
    pub fn new(policy: &CachePolicy) -> Self {
        Self {
            default_root: None,
            max_entries: policy.max_entries.max(1),
            max_bytes: policy.max_bytes.max(1),
            ttl_seconds: policy.effective_ttl_seconds(),
        }
    }

    /// Root used when the workspace declares no `cacheRoot`.
    pub fn with_default_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.default_root = Some(root.into());
        self
    }

    fn db_path(&self, scope: &CacheScope<'_>) -> Option<PathBuf> {
        let root = scope
            .cache_root
            .map(Path::to_path_buf)
            .or_else(|| self.default_root.clone())?;
        Some(cache_db_path(&root, scope.repo_set_id))
    }

    fn connect(&self, path: &Path) -> FederationResult<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(conn)
    }

    fn get_at(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
        now: f64,
    ) -> FederationResult<Option<FederatedResponse>> {
        let Some(path) = self.db_path(scope) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let conn = self.connect(&path)?;
        let row: Option<(String, f64, Vec<u8>)> = conn
            .query_row(
                "SELECT manifest_hash, last_used_at, payload FROM query_cache \
                 WHERE key_hash = ?1 AND repo_set_id = ?2;",
                params![key, scope.repo_set_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((stored_manifest, last_used_at, payload)) = row else {
            return Ok(None);
        };
        if stored_manifest != manifest_hash || last_used_at < now - self.ttl_seconds {
            return Ok(None);
        }
        let response: FederatedResponse = match serde_json::from_slice(&payload) {
            Ok(response) => response,
            Err(err) => {
                debug!("dropping unreadable cache entry {key}: {err}");
                conn.execute("DELETE FROM query_cache WHERE key_hash = ?1;", params![key])?;
                return Ok(None);
            }
        };
        conn.execute(
            "UPDATE query_cache SET last_used_at = ?1 WHERE key_hash = ?2;",
            params![now, key],
        )?;
        Ok(Some(response))
    }

    fn put_at(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
        response: &FederatedResponse,
        now: f64,
    ) -> FederationResult<()> {
        let Some(path) = self.db_path(scope) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(response)?;
        let conn = self.connect(&path)?;
        conn.execute(
            "INSERT INTO query_cache(key_hash, repo_set_id, manifest_hash, created_at, \
             last_used_at, size_bytes, payload) \
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6) \
             ON CONFLICT(key_hash) DO UPDATE SET \
               repo_set_id = excluded.repo_set_id, \
               manifest_hash = excluded.manifest_hash, \
               last_used_at = excluded.last_used_at, \
               size_bytes = excluded.size_bytes, \
               payload = excluded.payload;",
            params![
                key,
                scope.repo_set_id,
                manifest_hash,
                now,
                payload.len() as i64,
                payload
            ],
        )?;
        self.prune(&conn, now)
    }

    /// TTL first, then least-recently-used beyond the entry and byte budgets.
    fn prune(&self, conn: &Connection, now: f64) -> FederationResult<()> {
        conn.execute(
            "DELETE FROM query_cache WHERE last_used_at < ?1;",
            params![now - self.ttl_seconds],
        )?;

        let mut stmt = conn.prepare(
            "SELECT key_hash, size_bytes FROM query_cache \
             ORDER BY last_used_at ASC, created_at ASC, key_hash ASC;",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut count = rows.len();
        let mut bytes: i64 = rows.iter().map(|(_, size)| *size).sum();
        let mut evicted = 0usize;
        for (key, size) in rows {
            if count <= self.max_entries && bytes <= self.max_bytes as i64 {
                break;
            }
            conn.execute("DELETE FROM query_cache WHERE key_hash = ?1;", params![key])?;
            count -= 1;
            bytes -= size;
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, "pruned federated query cache");
        }
        Ok(())
    }
}

impl QueryCache for SqliteQueryCache {
    fn get(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
    ) -> FederationResult<Option<FederatedResponse>> {
        self.get_at(scope, key, manifest_hash, unix_now())
    }

    fn put(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
        response: &FederatedResponse,
    ) -> FederationResult<()> {
        self.put_at(scope, key, manifest_hash, response, unix_now())
    }
}
