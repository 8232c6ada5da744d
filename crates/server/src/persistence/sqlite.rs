use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::DocStore;
use crate::error::PersistenceError;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE documents (
    name        TEXT PRIMARY KEY,
    data        BLOB NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// Document store backed by a single SQLite file.
///
/// rusqlite is synchronous, so every call hops onto the blocking pool and
/// takes the connection lock there.
#[derive(Debug, Clone)]
pub struct SqliteDocStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteDocStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open document database at `{}`", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for document database")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn: Arc::new(Mutex::new(Some(conn))) })
    }

    pub fn schema_version(&self) -> Result<i64> {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().context("document database is closed")?;
        current_schema_version(conn)
    }

    async fn with_connection<T, F>(&self, name: &str, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard.as_ref().ok_or(PersistenceError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|source| PersistenceError::Task { name: name.to_string(), source })?
    }
}

#[async_trait]
impl DocStore for SqliteDocStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let key = name.to_string();
        self.with_connection(name, move |conn| {
            conn.query_row("SELECT data FROM documents WHERE name = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .map_err(|source| PersistenceError::Sqlite { operation: "load", name: key, source })
        })
        .await
    }

    async fn store(&self, name: &str, state: &[u8]) -> Result<(), PersistenceError> {
        let key = name.to_string();
        let data = state.to_vec();
        self.with_connection(name, move |conn| {
            let updated_at = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO documents (name, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE
                 SET data = excluded.data, updated_at = excluded.updated_at",
                params![key, data, updated_at],
            )
            .map(|_| ())
            .map_err(|source| PersistenceError::Sqlite { operation: "store", name: key, source })
        })
        .await
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, source)| PersistenceError::Sqlite {
                    operation: "close",
                    name: String::new(),
                    source,
                })?;
            }
            Ok(())
        })
        .await
        .map_err(|source| PersistenceError::Task { name: String::new(), source })?
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply document migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}
