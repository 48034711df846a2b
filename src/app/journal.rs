use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, params};
use serde::{Deserialize, Serialize};

use crate::app::course_store::parse_timestamp;
use crate::app::model::GenerateCourse;
use crate::db::Database;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown run status: {other:?}"),
        }
    }
}

/// Where a run is in `Started -> Outlining -> FanningOut -> FetchingCover ->
/// Persisting -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Started,
    Outlining,
    FanningOut,
    FetchingCover,
    Persisting,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Outlining => "outlining",
            Self::FanningOut => "fanning_out",
            Self::FetchingCover => "fetching_cover",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "started" => Ok(Self::Started),
            "outlining" => Ok(Self::Outlining),
            "fanning_out" => Ok(Self::FanningOut),
            "fetching_cover" => Ok(Self::FetchingCover),
            "persisting" => Ok(Self::Persisting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown run phase: {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Retrying,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw {
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown step status: {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub course_id: String,
    pub event: GenerateCourse,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step_name: String,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Write-ahead log of runs and their steps.
#[async_trait]
pub trait StepJournal: Send + Sync {
    /// Records a new run for `event`, or returns the existing record when the
    /// run was already started.
    async fn begin_run(&self, event: &GenerateCourse) -> anyhow::Result<RunRecord>;
    async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<RunRecord>>;
    async fn unfinished_runs(&self) -> anyhow::Result<Vec<RunRecord>>;
    async fn set_phase(&self, run_id: &str, phase: RunPhase) -> anyhow::Result<()>;
    /// Moves a running run to a terminal status. Terminal runs stay as they are.
    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn step(&self, run_id: &str, step_name: &str) -> anyhow::Result<Option<StepRecord>>;
    async fn record_step_failure(
        &self,
        run_id: &str,
        step_name: &str,
        attempts: u32,
        error: &str,
        exhausted: bool,
    ) -> anyhow::Result<()>;
    /// Stores the output of a finished step and returns the recorded output.
    /// The first recorded output wins; later writers get it back instead of
    /// their own.
    async fn record_step_output(
        &self,
        run_id: &str,
        step_name: &str,
        attempts: u32,
        output: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

#[derive(Clone)]
pub struct SqliteStepJournal {
    db: Database,
}

impl SqliteStepJournal {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

type RawRun = (String, String, String, String, String, Option<String>, String, String);

const RUN_COLUMNS: &str =
    "run_id, course_id, event_json, status, phase, error, created_at, updated_at";

fn raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_run_record(raw: RawRun) -> anyhow::Result<RunRecord> {
    let (run_id, course_id, event_json, status, phase, error, created_at, updated_at) = raw;
    let event = serde_json::from_str(&event_json)
        .with_context(|| format!("parse event of run {run_id}"))?;
    Ok(RunRecord {
        status: RunStatus::parse(&status)?,
        phase: RunPhase::parse(&phase)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        run_id,
        course_id,
        event,
        error,
    })
}

#[async_trait]
impl StepJournal for SqliteStepJournal {
    async fn begin_run(&self, event: &GenerateCourse) -> anyhow::Result<RunRecord> {
        let run_id = event.run_id();
        let event_json = serde_json::to_string(event).context("serialize event")?;
        let now = Utc::now().to_rfc3339();

        let conn = self.db.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO pipeline_runs
                 (run_id, course_id, event_json, status, phase, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'running', 'started', ?4, ?4)",
                params![run_id, event.course_id, event_json, now],
            )
            .with_context(|| format!("insert run {run_id}"))?;
        if inserted == 0 {
            tracing::debug!(run_id = %run_id, "run already journaled");
        }

        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE run_id = ?1"),
                params![run_id],
                raw_run,
            )
            .with_context(|| format!("read run {run_id}"))?;
        into_run_record(raw)
    }

    async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<RunRecord>> {
        let conn = self.db.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE run_id = ?1"),
                params![run_id],
                raw_run,
            )
            .optional()
            .with_context(|| format!("read run {run_id}"))?;
        raw.map(into_run_record).transpose()
    }

    async fn unfinished_runs(&self) -> anyhow::Result<Vec<RunRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE status = 'running' ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], raw_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(into_run_record(row.context("read run row")?)?);
        }
        Ok(out)
    }

    async fn set_phase(&self, run_id: &str, phase: RunPhase) -> anyhow::Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE pipeline_runs SET phase = ?2, updated_at = ?3
             WHERE run_id = ?1 AND status = 'running'",
            params![run_id, phase.as_str(), Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("set phase of run {run_id}"))?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let phase = match status {
            RunStatus::Running => anyhow::bail!("cannot finish run {run_id} as running"),
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Failed => RunPhase::Failed,
        };
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE pipeline_runs SET status = ?2, phase = ?3, error = ?4, updated_at = ?5
             WHERE run_id = ?1 AND status = 'running'",
            params![
                run_id,
                status.as_str(),
                phase.as_str(),
                error,
                Utc::now().to_rfc3339()
            ],
        )
        .with_context(|| format!("finish run {run_id}"))?;
        Ok(())
    }

    async fn step(&self, run_id: &str, step_name: &str) -> anyhow::Result<Option<StepRecord>> {
        let conn = self.db.lock().await;
        let raw = conn
            .query_row(
                "SELECT status, output_json, attempts, last_error FROM pipeline_steps
                 WHERE run_id = ?1 AND step_name = ?2",
                params![run_id, step_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("read step {step_name} of run {run_id}"))?;

        let Some((status, output_json, attempts, last_error)) = raw else {
            return Ok(None);
        };
        let output = output_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .with_context(|| format!("parse output of step {step_name}"))?;
        Ok(Some(StepRecord {
            run_id: run_id.to_owned(),
            step_name: step_name.to_owned(),
            status: StepStatus::parse(&status)?,
            output,
            attempts,
            last_error,
        }))
    }

    async fn record_step_failure(
        &self,
        run_id: &str,
        step_name: &str,
        attempts: u32,
        error: &str,
        exhausted: bool,
    ) -> anyhow::Result<()> {
        let status = if exhausted {
            StepStatus::Failed
        } else {
            StepStatus::Retrying
        };
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO pipeline_steps (run_id, step_name, status, attempts, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (run_id, step_name) DO UPDATE SET
               status = excluded.status,
               attempts = excluded.attempts,
               last_error = excluded.last_error,
               updated_at = excluded.updated_at
             WHERE pipeline_steps.status != 'completed'",
            params![
                run_id,
                step_name,
                status.as_str(),
                attempts,
                error,
                Utc::now().to_rfc3339()
            ],
        )
        .with_context(|| format!("record failure of step {step_name}"))?;
        Ok(())
    }

    async fn record_step_output(
        &self,
        run_id: &str,
        step_name: &str,
        attempts: u32,
        output: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let output_json = serde_json::to_string(output).context("serialize step output")?;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO pipeline_steps
             (run_id, step_name, status, output_json, attempts, last_error, updated_at)
             VALUES (?1, ?2, 'completed', ?3, ?4, NULL, ?5)
             ON CONFLICT (run_id, step_name) DO UPDATE SET
               status = 'completed',
               output_json = excluded.output_json,
               attempts = excluded.attempts,
               last_error = NULL,
               updated_at = excluded.updated_at
             WHERE pipeline_steps.status != 'completed'",
            params![
                run_id,
                step_name,
                output_json,
                attempts,
                Utc::now().to_rfc3339()
            ],
        )
        .with_context(|| format!("record output of step {step_name}"))?;

        let recorded: Option<String> = conn
            .query_row(
                "SELECT output_json FROM pipeline_steps WHERE run_id = ?1 AND step_name = ?2",
                params![run_id, step_name],
                |row| row.get(0),
            )
            .with_context(|| format!("read recorded output of step {step_name}"))?;
        let recorded = recorded.ok_or_else(|| {
            anyhow::anyhow!("step {step_name} of run {run_id} is completed without output")
        })?;
        serde_json::from_str(&recorded)
            .with_context(|| format!("parse output of step {step_name}"))
    }
}
