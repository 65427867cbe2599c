//! SQLite-backed application registry
//!
//! Durable storage for application records that survives restarts.

use crate::registry::{AppRegistry, AppStatus, ApplicationRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str = "SELECT id, name, status, created_at, updated_at FROM application_info";

/// Registry stored in a single SQLite database
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets proxy reads proceed while a deploy is writing
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.run_migrations()?;

        info!(path = %path.display(), "Registry database opened");
        Ok(registry)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: application_info table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: application_info");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS application_info (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp in registry: {}", value))?
        .with_timezone(&Utc))
}

/// Raw column values, converted outside the rusqlite row callback
struct StoredRow {
    id: String,
    name: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_record(self) -> Result<ApplicationRecord> {
        Ok(ApplicationRecord {
            id: Uuid::parse_str(&self.id).with_context(|| format!("Invalid id in registry: {}", self.id))?,
            name: self.name,
            status: self.status.parse::<AppStatus>()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl AppRegistry for SqliteRegistry {
    fn upsert(&self, record: ApplicationRecord) -> Result<ApplicationRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO application_info (id, name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                id = excluded.id,
                status = excluded.status,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
            params![
                record.id.to_string(),
                record.name,
                record.status.as_str(),
                format_timestamp(&record.created_at),
                format_timestamp(&record.updated_at),
            ],
        )
        .context("Failed to upsert application")?;
        Ok(record)
    }

    fn find_by_name(&self, name: &str) -> Result<Option<ApplicationRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE name = ?1", SELECT_COLUMNS),
                params![name],
                StoredRow::from_row,
            )
            .optional()
            .context("Failed to get application")?;

        row.map(StoredRow::into_record).transpose()
    }

    fn find_all(&self) -> Result<Vec<ApplicationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY name", SELECT_COLUMNS))?;

        let rows = stmt
            .query_map([], StoredRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(StoredRow::into_record).collect()
    }

    fn delete_by_name(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM application_info WHERE name = ?1", params![name])?;
        Ok(rows > 0)
    }
}
