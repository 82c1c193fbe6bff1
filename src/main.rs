//! CLI entry point for the GTFS bundler.
//!
//! `serve` publishes the archive once, keeps it fresh in the background and
//! serves the publish directory. `build` publishes once and exits.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gtfs_bundler::config::{Cli, Commands, PipelineArgs, ServeArgs};
use gtfs_bundler::fetch::BasicClient;
use gtfs_bundler::logging::init_logging;
use gtfs_bundler::pipeline::Pipeline;
use gtfs_bundler::scheduler::Scheduler;
use gtfs_bundler::server;
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _log_guard = init_logging()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await?,
        Commands::Build(args) => {
            let pipeline = pipeline(&args)?;
            let published = pipeline.run().await.context("pipeline run failed")?;
            info!(
                path = %published.path.display(),
                files = published.files.len(),
                size_bytes = published.size_bytes,
                "Archive built"
            );
        }
    }

    Ok(())
}

fn pipeline(args: &PipelineArgs) -> Result<Pipeline<BasicClient>> {
    let settings = args.settings();
    // The pipeline timeout bounds the whole run, so the client only needs a
    // connect timeout plus a generous request ceiling.
    let request_timeout = settings
        .timeout
        .unwrap_or(Duration::from_secs(24 * 60 * 60));
    let client = BasicClient::with_timeouts(CONNECT_TIMEOUT, request_timeout)
        .context("failed to build HTTP client")?;
    Ok(Pipeline::new(client, settings))
}

#[tracing::instrument(skip_all, fields(source = %args.pipeline.source_url, port = args.port))]
async fn serve(args: ServeArgs) -> Result<()> {
    let scheduler = Scheduler::new(pipeline(&args.pipeline)?, args.scheduler_settings());

    // No archive, nothing to serve.
    let state = scheduler
        .initial_run()
        .await
        .context("initial pipeline run failed")?;

    let report = scheduler.report();
    tokio::spawn(scheduler.run(state));

    server::serve(args.server_settings(), report).await
}
