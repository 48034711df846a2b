use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::app::admission::{self, GenerateCourseRequest};
use crate::app::course_store::{CourseStore, SqliteCourseStore};
use crate::app::journal::SqliteStepJournal;
use crate::app::model::{Chapter, Course};
use crate::app::pipeline::CoursePipeline;
use crate::clients::Collaborators;
use crate::config::AppConfig;
use crate::db::Database;
use crate::error::CourseGenError;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// SQLite database holding courses and the run journal.
    #[arg(
        long,
        global = true,
        env = "COURSEGEN_DATABASE",
        default_value = "coursegen.db"
    )]
    pub database: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Admit a course and generate it in the foreground.
    Generate(GenerateArgs),
    /// Print a course and its chapters as JSON.
    Status(StatusArgs),
    /// Re-run every run the journal has not finished.
    Resume,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub description: String,

    /// Owner of the course.
    #[arg(long, default_value = "local")]
    pub user: String,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Course id printed by `generate`.
    #[arg(long)]
    pub course: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseReport {
    #[serde(flatten)]
    course: Course,
    chapters: Vec<Chapter>,
}

fn open_pipeline(
    db: &Database,
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn CourseStore>, CoursePipeline)> {
    let courses: Arc<dyn CourseStore> = Arc::new(SqliteCourseStore::new(db.clone()));
    let pipeline = CoursePipeline::new(
        Collaborators::from_config(config)?,
        Arc::clone(&courses),
        Arc::new(SqliteStepJournal::new(db.clone())),
        config.pipeline_options(),
    );
    Ok((courses, pipeline))
}

pub async fn generate(database: &std::path::Path, args: GenerateArgs) -> anyhow::Result<()> {
    // Reject bad input before requiring API keys.
    let request = GenerateCourseRequest {
        title: args.title,
        description: args.description,
    }
    .validate()?;

    let config = AppConfig::from_env().context("load config")?;
    let db = Database::open(database)?;
    let (courses, pipeline) = open_pipeline(&db, &config)?;

    let (course, event) = admission::create_pending(courses.as_ref(), &args.user, request).await?;
    eprintln!("generating course {}", course.id);

    let outcome = pipeline.handle(&event).await;
    let status = courses
        .get(&course.id)
        .await?
        .map(|c| c.status.to_string())
        .unwrap_or_else(|| "missing".to_owned());
    println!("{} {status}", course.id);

    let summary = outcome?;
    tracing::info!(
        course_id = %summary.course_id,
        chapters = summary.total_chapters,
        "done"
    );
    Ok(())
}

pub async fn status(database: &std::path::Path, args: StatusArgs) -> anyhow::Result<()> {
    let db = Database::open(database)?;
    let courses = SqliteCourseStore::new(db);
    let course = courses
        .get(&args.course)
        .await?
        .ok_or_else(|| CourseGenError::CourseNotFound(args.course.clone()))?;
    let chapters = courses.chapters(&course.id).await?;

    let report = CourseReport { course, chapters };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize course")?
    );
    Ok(())
}

pub async fn resume(database: &std::path::Path) -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("load config")?;
    let db = Database::open(database)?;
    let (_courses, pipeline) = open_pipeline(&db, &config)?;

    let events = pipeline.unfinished_events().await?;
    tracing::info!(runs = events.len(), "resuming unfinished runs");

    let mut failed = 0usize;
    for event in &events {
        match pipeline.handle(event).await {
            Ok(summary) => println!("{} completed", summary.course_id),
            Err(err) => {
                failed += 1;
                tracing::warn!(course_id = %event.course_id, error = %format!("{err:#}"), "resumed run failed");
                println!("{} failed", event.course_id);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} resumed run(s) failed", events.len());
    }
    Ok(())
}
