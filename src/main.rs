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
    let cli = storyalign::cli::Cli::parse();
    storyalign::logging::init(cli.verbose).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        storyalign::cli::Command::Structure(args) => {
            storyalign::structure::run(args).await.context("structure")?;
        }
        storyalign::cli::Command::Crawl(args) => {
            storyalign::crawl::run(args).await.context("crawl")?;
        }
        storyalign::cli::Command::Plan(args) => {
            storyalign::align::run_plan(args).context("plan")?;
        }
        storyalign::cli::Command::Align(args) => {
            storyalign::align::run(args).await.context("align")?;
        }
        storyalign::cli::Command::Build(args) => {
            storyalign::build::run(args).await.context("build")?;
        }
    }

    Ok(())
}
