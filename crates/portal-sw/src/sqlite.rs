//! SQLite-backed cache store that survives worker restarts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::cache::{CacheBackend, CacheKey, CachedResponse};
use crate::error::CacheError;

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Persistent [`CacheBackend`]. One connection, one statement at a time;
/// statements run on tokio's blocking pool.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened cache database");
        Self::init(conn)
    }

    /// Database that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let table_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
                [],
                |row| row.get::<_, i32>(0).map(|count| count > 0),
            )
            .unwrap_or(false);

        let version: i32 = if table_exists {
            conn.query_row(
                "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0)
        } else {
            0
        };

        if version < SCHEMA_VERSION {
            create_schema_v1(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| CacheError::Storage("cache database lock poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| CacheError::Storage(format!("cache database task failed: {e}")))?
    }
}

fn create_schema_v1(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            cache_name TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
            storage_key TEXT NOT NULL,
            request TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            status_text TEXT NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_name, storage_key)
        );
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )?;

    debug!(version = SCHEMA_VERSION, "Created cache schema");
    Ok(())
}

fn ensure_cache(conn: &Connection, cache: &str) -> Result<(), CacheError> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, ?)",
        params![cache, Utc::now().timestamp()],
    )?;
    Ok(())
}

fn cache_exists(conn: &Connection, cache: &str) -> Result<bool, CacheError> {
    let found = conn
        .query_row("SELECT 1 FROM caches WHERE name = ?", params![cache], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    async fn open(&self, cache: &str) -> Result<(), CacheError> {
        let cache = cache.to_string();
        self.with_conn(move |conn| ensure_cache(conn, &cache)).await
    }

    async fn has(&self, cache: &str) -> Result<bool, CacheError> {
        let cache = cache.to_string();
        self.with_conn(move |conn| cache_exists(conn, &cache)).await
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, CacheError> {
        let cache = cache.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM caches WHERE name = ?", params![cache])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let cache = cache.to_string();
        let storage_key = key.storage_key();

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT url, status, status_text, headers, body, cached_at
                     FROM entries WHERE cache_name = ? AND storage_key = ?",
                    params![cache, storage_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u16>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Vec<u8>>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((url, status, status_text, headers, body, cached_at)) => {
                    Ok(Some(CachedResponse {
                        url,
                        status,
                        status_text,
                        headers: serde_json::from_str(&headers)?,
                        body,
                        cached_at,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, cache: &str, key: &CacheKey, entry: CachedResponse) -> Result<(), CacheError> {
        let cache = cache.to_string();
        let storage_key = key.storage_key();
        let request = serde_json::to_string(key)?;
        let headers = serde_json::to_string(&entry.headers)?;

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            ensure_cache(&tx, &cache)?;
            tx.execute(
                "INSERT OR REPLACE INTO entries
                 (cache_name, storage_key, request, url, status, status_text, headers, body, cached_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    cache,
                    storage_key,
                    request,
                    entry.url,
                    entry.status,
                    entry.status_text,
                    headers,
                    entry.body,
                    entry.cached_at,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, cache: &str, key: &CacheKey) -> Result<bool, CacheError> {
        let cache = cache.to_string();
        let storage_key = key.storage_key();

        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE cache_name = ? AND storage_key = ?",
                params![cache, storage_key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>, CacheError> {
        let cache = cache.to_string();

        self.with_conn(move |conn| {
            if !cache_exists(conn, &cache)? {
                return Err(CacheError::NotFound(cache));
            }
            let mut stmt = conn.prepare(
                "SELECT request FROM entries WHERE cache_name = ? ORDER BY storage_key",
            )?;
            let rows = stmt
                .query_map(params![cache], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(CacheError::from))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStorage;
    use tempfile::tempdir;
    use url::Url;

    fn key(path: &str) -> CacheKey {
        CacheKey::get(&Url::parse(&format!("https://portal.example{path}")).unwrap())
    }

    fn entry(body: &[u8]) -> CachedResponse {
        CachedResponse {
            url: "https://portal.example/".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: body.to_vec(),
            cached_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let backend = SqliteBackend::open_in_memory().unwrap();

        backend.put("v1", &key("/"), entry(b"one")).await.unwrap();
        backend.put("v1", &key("/"), entry(b"two")).await.unwrap();

        let stored = backend.get("v1", &key("/")).await.unwrap().unwrap();
        assert_eq!(stored.body, b"two");
        assert_eq!(stored.headers, entry(b"").headers);
        assert_eq!(backend.keys("v1").await.unwrap(), vec![key("/")]);
    }

    #[tokio::test]
    async fn test_delete_cache_cascades_entries() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.put("v1", &key("/"), entry(b"old")).await.unwrap();
        backend.open("v2").await.unwrap();

        assert!(backend.delete_cache("v1").await.unwrap());
        assert!(!backend.delete_cache("v1").await.unwrap());
        assert_eq!(backend.cache_names().await.unwrap(), vec!["v2"]);

        // A recreated cache of the same name starts empty.
        backend.open("v1").await.unwrap();
        assert!(backend.get("v1", &key("/")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite3");

        {
            let storage = CacheStorage::new(Arc::new(SqliteBackend::open(&path).unwrap()));
            let cache = storage.open("portal-cache-v1").await.unwrap();
            cache.put(&key("/manifest.json"), entry(b"{}")).await.unwrap();
        }

        let storage = CacheStorage::new(Arc::new(SqliteBackend::open(&path).unwrap()));
        assert!(storage.has("portal-cache-v1").await.unwrap());
        let cache = storage.open("portal-cache-v1").await.unwrap();
        let stored = cache.match_key(&key("/manifest.json")).await.unwrap().unwrap();
        assert_eq!(stored.body, b"{}");
    }

    #[tokio::test]
    async fn test_keys_of_missing_cache() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert!(matches!(
            backend.keys("gone").await,
            Err(CacheError::NotFound(_))
        ));
    }
}
