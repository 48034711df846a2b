use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use coursegen::app::course_store::{CourseStore, SqliteCourseStore};
use coursegen::app::dispatcher::{
    EventDispatcher, ExecutionMode, InProcessEventDispatcher, WorkerEventDispatcher,
};
use coursegen::app::journal::{SqliteStepJournal, StepJournal};
use coursegen::app::pipeline::CoursePipeline;
use coursegen::app::queue::InProcessQueue;
use coursegen::clients::{Collaborators, http_client};
use coursegen::config::AppConfig;
use coursegen::db::Database;
use coursegen::server::{AppState, router};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    #[arg(long, env = "COURSEGEN_DATABASE", default_value = "coursegen.db")]
    database: PathBuf,

    /// Pipeline runs executed at the same time by this process.
    #[arg(long, default_value_t = 4)]
    max_concurrency: usize,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    coursegen::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting coursegen-app");

    let config = AppConfig::from_env()?;
    let db = Database::open(&args.database)?;
    let courses: Arc<dyn CourseStore> = Arc::new(SqliteCourseStore::new(db.clone()));
    let journal: Arc<dyn StepJournal> = Arc::new(SqliteStepJournal::new(db));
    let pipeline = Arc::new(CoursePipeline::new(
        Collaborators::from_config(&config)?,
        Arc::clone(&courses),
        journal,
        config.pipeline_options(),
    ));

    let executor: Arc<dyn EventDispatcher> = Arc::new(InProcessEventDispatcher::new(
        InProcessQueue::new(args.max_concurrency),
        Arc::clone(&pipeline),
    ));
    let dispatcher: Arc<dyn EventDispatcher> = match config.dispatch.mode {
        ExecutionMode::InProcess => {
            tracing::info!("executing runs in process");
            Arc::clone(&executor)
        }
        ExecutionMode::Worker => {
            let worker_url = config.dispatch.worker_url.as_deref().unwrap_or_default();
            let token = config
                .dispatch
                .worker_auth_token
                .as_deref()
                .unwrap_or_default();
            tracing::info!(worker_url, "forwarding runs to worker");
            Arc::new(WorkerEventDispatcher::new(
                http_client(config.http_timeout)?,
                worker_url,
                token,
            )?)
        }
    };

    let unfinished = pipeline.unfinished_events().await?;
    if !unfinished.is_empty() {
        tracing::info!(runs = unfinished.len(), "resuming unfinished runs");
    }
    for event in &unfinished {
        if let Err(err) = dispatcher.dispatch(event).await {
            tracing::warn!(course_id = %event.course_id, error = %format!("{err:#}"), "failed to resume run");
        }
    }

    let app = router(AppState {
        courses,
        dispatcher,
        executor,
        internal_token: config.dispatch.worker_auth_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
