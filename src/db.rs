//! SQLite handle shared by the course store and the step journal.
//!
//! A single connection sits behind an async mutex; every statement runs while
//! the lock is held, so a transaction is never interleaved with another writer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rusqlite::{Connection, params};
use tokio::sync::{Mutex, MutexGuard};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "courses and chapters",
            sql: r#"
CREATE TABLE IF NOT EXISTS courses (
    id                   TEXT PRIMARY KEY,
    user_id              TEXT NOT NULL,
    title                TEXT NOT NULL,
    description          TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'pending'
                         CHECK (status IN ('pending', 'completed', 'failed')),
    image_url            TEXT,
    active_chapter_id    TEXT,
    active_chapter_order INTEGER,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_courses_user_id ON courses(user_id);

CREATE TABLE IF NOT EXISTS chapters (
    id            TEXT PRIMARY KEY,
    course_id     TEXT NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
    title         TEXT NOT NULL,
    content       TEXT NOT NULL,
    video_urls    TEXT NOT NULL,
    chapter_order INTEGER NOT NULL CHECK (chapter_order >= 0),
    UNIQUE(course_id, chapter_order)
);
"#,
        },
        Migration {
            version: 2,
            description: "pipeline run and step journal",
            sql: r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    run_id     TEXT PRIMARY KEY,
    course_id  TEXT NOT NULL,
    event_json TEXT NOT NULL,
    status     TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    phase      TEXT NOT NULL,
    error      TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status);

CREATE TABLE IF NOT EXISTS pipeline_steps (
    run_id      TEXT NOT NULL REFERENCES pipeline_runs(run_id) ON DELETE CASCADE,
    step_name   TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('retrying', 'completed', 'failed')),
    output_json TEXT,
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (run_id, step_name)
);
"#,
        },
    ]
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database dir: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("open database: {}", path.display()))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enable WAL journal")?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("set busy timeout")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .context("create schema_migrations")?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("read schema version")?;

    for migration in all_migrations() {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        let tx = conn.transaction().context("begin migration")?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("migration v{} failed", migration.version))?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .context("record migration")?;
        tx.commit().context("commit migration")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_applied_once() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("nested").join("coursegen.db");

        drop(Database::open(&path)?);
        let db = Database::open(&path)?;

        let conn = db.lock().await;
        let versions: u32 =
            conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))?;
        assert_eq!(versions as usize, all_migrations().len());
        Ok(())
    }
}
