#![doc = include_str!("../README.md")]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filestate::{FileMetadata, REGISTRY_VERSION, Result, StateError, StateStore};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    file_path       TEXT PRIMARY KEY,
    first_opened    TEXT NOT NULL,
    last_accessed   TEXT NOT NULL,
    access_count    INTEGER NOT NULL DEFAULT 0,
    schema_version  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS module_state (
    file_path   TEXT NOT NULL,
    module_id   TEXT NOT NULL,
    state_json  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (file_path, module_id)
);

CREATE TABLE IF NOT EXISTS registry (
    key         TEXT PRIMARY KEY,
    value_json  TEXT NOT NULL
);
"#;

/// A [`StateStore`] persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn db_err(e: rusqlite::Error) -> StateError {
    StateError::store(e)
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StateError::store)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(db_err)?;
        tracing::debug!(path = %path.display(), "opened state database");
        Self::init(conn)
    }

    /// An in-memory database, discarded on drop.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(StateError::store)?
        .map_err(db_err)
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn read_metadata(conn: &Connection, file_path: &str) -> rusqlite::Result<Option<FileMetadata>> {
    let row = conn
        .query_row(
            "SELECT first_opened, last_accessed, access_count, schema_version
             FROM file_metadata WHERE file_path = ?1",
            params![file_path],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((first, last, count, version)) => Ok(Some(FileMetadata {
            first_opened: parse_time(&first)?,
            last_accessed: parse_time(&last)?,
            access_count: count.max(0) as u64,
            schema_version: version.max(0) as u32,
        })),
        None => Ok(None),
    }
}

fn parse_json(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_module_state(
        &self,
        file_path: &str,
        module_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let (file_path, module_id) = (file_path.to_string(), module_id.to_string());
        let raw = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT state_json FROM module_state WHERE file_path = ?1 AND module_id = ?2",
                    params![file_path, module_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn put_module_state(
        &self,
        file_path: &str,
        module_id: &str,
        state: &serde_json::Value,
    ) -> Result<()> {
        let text = serde_json::to_string(state)?;
        let (file_path, module_id) = (file_path.to_string(), module_id.to_string());
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO module_state (file_path, module_id, state_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(file_path, module_id)
                 DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
                params![file_path, module_id, text, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete_module_state(&self, file_path: &str, module_id: &str) -> Result<()> {
        let (file_path, module_id) = (file_path.to_string(), module_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM module_state WHERE file_path = ?1 AND module_id = ?2",
                params![file_path, module_id],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_file_metadata(&self, file_path: &str) -> Result<Option<FileMetadata>> {
        let file_path = file_path.to_string();
        self.with_conn(move |conn| read_metadata(conn, &file_path))
            .await
    }

    async fn touch_file_metadata(&self, file_path: &str) -> Result<FileMetadata> {
        let file_path = file_path.to_string();
        let now = Utc::now().to_rfc3339();
        let meta = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO file_metadata
                        (file_path, first_opened, last_accessed, access_count, schema_version)
                     VALUES (?1, ?2, ?2, 1, ?3)
                     ON CONFLICT(file_path) DO UPDATE SET
                        last_accessed = excluded.last_accessed,
                        access_count = access_count + 1",
                    params![file_path, now, REGISTRY_VERSION],
                )?;
                read_metadata(conn, &file_path)
            })
            .await?;
        meta.ok_or_else(|| StateError::store("metadata row missing after upsert"))
    }

    async fn delete_file_metadata(&self, file_path: &str) -> Result<()> {
        let file_path = file_path.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM file_metadata WHERE file_path = ?1",
                params![file_path],
            )
            .map(|_| ())
        })
        .await
    }

    async fn list_tracked_files(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_path FROM file_metadata
                 UNION
                 SELECT file_path FROM module_state
                 ORDER BY file_path",
            )?;
            let files = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(files)
        })
        .await
    }

    async fn get_registry_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT value_json FROM registry WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            raw.as_deref().map(parse_json).transpose()
        })
        .await
    }

    async fn put_registry_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO registry (key, value_json) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
                params![key, text],
            )
            .map(|_| ())
        })
        .await
    }
}
