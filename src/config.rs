//! Command-line and environment configuration.
//!
//! Every option can be given as a flag or through the environment (a `.env`
//! file is loaded first by `main`).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::pipeline::PipelineSettings;
use crate::scheduler::SchedulerSettings;
use crate::server::ServerSettings;

#[derive(Debug, Parser)]
#[command(name = "gtfs_bundler")]
#[command(about = "Repackages a multi-mode GTFS bundle and serves it over HTTP", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build the archive, keep it fresh and serve it
    Serve(ServeArgs),
    /// Build the archive once and exit
    Build(PipelineArgs),
}

#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    /// URL of the source GTFS bundle
    #[arg(long, env = "SOURCE_URL")]
    pub source_url: String,

    /// Directory that temporary staging areas are created in
    #[arg(long, env = "WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    /// Directory the published archive is written to and served from
    #[arg(long, env = "PUBLIC_DIR", default_value = ".out/public")]
    pub public_dir: PathBuf,

    /// File name of the published archive
    #[arg(long, env = "ARCHIVE_NAME", default_value = "gtfs.zip")]
    pub archive_name: String,

    /// Give up on a pipeline run after this many seconds (0 = never)
    #[arg(long, env = "PIPELINE_TIMEOUT_SECS", default_value_t = 600)]
    pub run_timeout_secs: u64,
}

impl PipelineArgs {
    pub fn settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings::new(self.source_url.clone());
        settings.work_dir = self.work_dir.clone();
        settings.public_dir = self.public_dir.clone();
        settings.archive_name = self.archive_name.clone();
        settings.timeout = match self.run_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        settings
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3003)]
    pub port: u16,

    /// Refresh once the last attempt is older than this many seconds
    #[arg(long, env = "REFRESH_STALE_AFTER_SECS", default_value_t = 24 * 60 * 60)]
    pub stale_after_secs: u64,

    /// How often to check whether a refresh is due, in seconds
    #[arg(long, env = "REFRESH_POLL_INTERVAL_SECS", default_value_t = 10 * 60)]
    pub poll_interval_secs: u64,

    /// Requests allowed per client IP within one rate-limit window
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 100)]
    pub rate_limit_max: u32,

    /// Length of the rate-limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 5 * 60)]
    pub rate_limit_window_secs: u64,
}

impl ServeArgs {
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            stale_after: Duration::from_secs(self.stale_after_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            port: self.port,
            public_dir: self.pipeline.public_dir.clone(),
            rate_limit_max: self.rate_limit_max,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_source_url() {
        // SOURCE_URL is never set in the test environment.
        let result = Cli::try_parse_from(["gtfs_bundler", "build"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from([
            "gtfs_bundler",
            "serve",
            "--source-url",
            "https://example.com/gtfs.zip",
        ])
        .unwrap();

        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, 3003);
        let scheduler = args.scheduler_settings();
        assert_eq!(scheduler.stale_after, Duration::from_secs(86_400));
        assert_eq!(scheduler.poll_interval, Duration::from_secs(600));

        let pipeline = args.pipeline.settings();
        assert_eq!(pipeline.publish_path(), PathBuf::from(".out/public/gtfs.zip"));
        assert_eq!(pipeline.timeout, Some(Duration::from_secs(600)));

        let server = args.server_settings();
        assert_eq!(server.rate_limit_max, 100);
        assert_eq!(server.rate_limit_window, Duration::from_secs(300));
    }

    #[test]
    fn test_zero_timeout_disables_it() {
        let cli = Cli::try_parse_from([
            "gtfs_bundler",
            "build",
            "--source-url",
            "https://example.com/gtfs.zip",
            "--run-timeout-secs",
            "0",
            "--public-dir",
            "/srv/www",
        ])
        .unwrap();

        let Commands::Build(args) = cli.command else {
            panic!("expected build");
        };
        let settings = args.settings();
        assert_eq!(settings.timeout, None);
        assert_eq!(settings.files_dir(), PathBuf::from("/srv/www/gtfs"));
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let result = Cli::try_parse_from([
            "gtfs_bundler",
            "serve",
            "--source-url",
            "https://example.com/gtfs.zip",
            "--port",
            "not-a-port",
        ]);
        assert!(result.is_err());
    }
}
