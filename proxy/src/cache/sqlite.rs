//! SQLite implementation of the StoreBackend and CacheStore traits

use crate::cache::{CacheError, CacheStore, GenerationId, RequestKey, StoreBackend, StoredResponse};
use chrono::Utc;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// SQLite-backed store backend
///
/// One database file holds every generation; entries are keyed by
/// (generation, method, url) so deleting a generation is a single
/// statement under the connection lock.
pub struct SqliteStoreBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStoreBackend {
    /// Create a new SQLite store backend
    ///
    /// If the database doesn't exist, it will be created with the required schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, CacheError> {
        let conn = Connection::open(db_path)?;
        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();

        // Generations table: registers a generation as soon as it is opened,
        // even while its entry set is still empty
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS generations (
                name TEXT PRIMARY KEY,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            [],
        )?;

        // Entries table: one row per cached response, keyed by request identity
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                generation TEXT NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                status INTEGER NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NOT NULL,
                stored_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (generation, method, url)
            )
            "#,
            [],
        )?;

        // Index for generation enumeration and retirement
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation)",
            [],
        )?;

        info!("Cache store database schema initialized");
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreBackend for SqliteStoreBackend {
    async fn open(&self, generation: &GenerationId) -> Result<Arc<dyn CacheStore>, CacheError> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO generations (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
                params![generation.as_str(), Utc::now().to_rfc3339()],
            )?;
        }

        debug!("Opened generation store {}", generation);
        Ok(Arc::new(SqliteCacheStore {
            conn: self.conn.clone(),
            generation: generation.as_str().to_string(),
        }))
    }

    async fn list_generations(&self) -> Result<Vec<String>, CacheError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY name")?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(names)
    }

    async fn delete_generation(&self, generation: &GenerationId) -> Result<(), CacheError> {
        let mut conn = self.conn.lock().unwrap();

        // Both rowsets go in one transaction so no partial generation is
        // ever observable
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM entries WHERE generation = ?1",
            params![generation.as_str()],
        )?;
        tx.execute(
            "DELETE FROM generations WHERE name = ?1",
            params![generation.as_str()],
        )?;
        tx.commit()?;

        info!("Deleted generation store {}", generation);
        Ok(())
    }
}

/// One generation's view of the shared SQLite database
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
    generation: String,
}

#[async_trait::async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &RequestKey) -> Result<Option<StoredResponse>, CacheError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT status, headers, body FROM entries WHERE generation = ?1 AND method = ?2 AND url = ?3",
        )?;
        let mut rows = stmt.query_map(params![self.generation, key.method, key.url], |row| {
            Ok((
                row.get::<_, i64>(0)? as u16,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        match rows.next() {
            Some(Ok((status, headers_json, body))) => {
                let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)
                    .map_err(|e| CacheError::Database(format!("Corrupt headers column: {}", e)))?;
                Ok(Some(StoredResponse {
                    status,
                    headers,
                    body,
                }))
            }
            Some(Err(e)) => Err(CacheError::Database(e.to_string())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &RequestKey, response: &StoredResponse) -> Result<(), CacheError> {
        let headers_json = serde_json::to_string(&response.headers)
            .map_err(|e| CacheError::Database(format!("Failed to encode headers: {}", e)))?;
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT OR REPLACE INTO entries (generation, method, url, status, headers, body, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                self.generation,
                key.method,
                key.url,
                response.status as i64,
                headers_json,
                response.body,
                Utc::now().to_rfc3339()
            ],
        )?;

        debug!(
            "Stored {} in generation {} ({} bytes)",
            key, self.generation, response.body.len()
        );
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE generation = ?1",
            params![self.generation],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT method, url FROM entries WHERE generation = ?1 ORDER BY url",
        )?;
        let keys: Vec<RequestKey> = stmt
            .query_map(params![self.generation], |row| {
                Ok(RequestKey {
                    method: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(keys)
    }
}
