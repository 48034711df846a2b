use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    coursegen::logging::init().context("init logging")?;

    let cli = coursegen::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        coursegen::cli::Command::Generate(args) => {
            coursegen::cli::generate(&cli.database, args)
                .await
                .context("generate")?;
        }
        coursegen::cli::Command::Status(args) => {
            coursegen::cli::status(&cli.database, args)
                .await
                .context("status")?;
        }
        coursegen::cli::Command::Resume => {
            coursegen::cli::resume(&cli.database)
                .await
                .context("resume")?;
        }
    }

    Ok(())
}
