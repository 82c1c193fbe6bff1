//! The bundling pipeline: download the source bundle, unpack each mode's
//! feed, collect the files of interest under mode-prefixed names and publish
//! them as a single archive.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{create_archive_from_directory, extract_archive};
use crate::error::{AtStage, PipelineError, Stage, StageError, StagingError};
use crate::fetch::{HttpClient, LogProgress, download_archive};
use crate::scheduler::Refresh;
use crate::staging::{StagingArea, copy_file, create_directory, delete_recursive};

/// One transit sub-feed inside the source bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    /// Number of the bundle directory holding this mode's feed.
    pub index: u8,
    pub name: &'static str,
}

pub const MODES: &[Mode] = &[
    Mode {
        index: 1,
        name: "regional",
    },
    Mode {
        index: 2,
        name: "suburban",
    },
];

pub const FILES_OF_INTEREST: &[&str] = &[
    "calendar.txt",
    "calendar_dates.txt",
    "routes.txt",
    "stops.txt",
    "stop_times.txt",
    "trips.txt",
];

/// File name of each mode's feed inside its bundle directory.
pub const INNER_ARCHIVE_NAME: &str = "google_transit.zip";

const SOURCE_ARCHIVE_NAME: &str = "gtfs.zip";
const OUTPUT_DIR_NAME: &str = "out";

/// Which modes to unpack and which files to take from each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedLayout {
    pub modes: &'static [Mode],
    pub files: &'static [&'static str],
}

impl Default for FeedLayout {
    fn default() -> Self {
        Self {
            modes: MODES,
            files: FILES_OF_INTEREST,
        }
    }
}

impl FeedLayout {
    /// Published name of `file` for `mode`, e.g. `regional-stop-times.txt`.
    pub fn output_name(mode: &Mode, file: &str) -> String {
        format!("{}-{}", mode.name, file.replace('_', "-"))
    }

    /// Every file name a successful run publishes, in collection order.
    pub fn expected_outputs(&self) -> Vec<String> {
        self.modes
            .iter()
            .flat_map(|mode| self.files.iter().map(move |file| Self::output_name(mode, file)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source_url: String,
    /// Directory that staging areas are created in.
    pub work_dir: PathBuf,
    /// Directory served to clients.
    pub public_dir: PathBuf,
    pub archive_name: String,
    /// Upper bound on download through publish. `None` waits forever.
    pub timeout: Option<Duration>,
    pub layout: FeedLayout,
}

impl PipelineSettings {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            work_dir: PathBuf::from("."),
            public_dir: PathBuf::from(".out/public"),
            archive_name: SOURCE_ARCHIVE_NAME.to_string(),
            timeout: Some(Duration::from_secs(600)),
            layout: FeedLayout::default(),
        }
    }

    /// Stable location of the published archive.
    pub fn publish_path(&self) -> PathBuf {
        self.public_dir.join(&self.archive_name)
    }

    /// Directory the collected files are published into, named after the
    /// archive without its extension.
    pub fn files_dir(&self) -> PathBuf {
        let stem = Path::new(&self.archive_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.archive_name.clone());
        self.public_dir.join(stem)
    }
}

/// The result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedArchive {
    pub path: PathBuf,
    pub files: Vec<String>,
    pub size_bytes: u64,
    pub published_at: DateTime<Utc>,
}

pub struct Pipeline<C> {
    client: C,
    settings: PipelineSettings,
}

impl<C: HttpClient> Pipeline<C> {
    pub fn new(client: C, settings: PipelineSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the pipeline once from a fresh staging area.
    ///
    /// The staging area is removed afterwards whether or not the run
    /// succeeded. On failure the previously published archive is untouched.
    #[tracing::instrument(skip(self), fields(source = %self.settings.source_url))]
    pub async fn run(&self) -> Result<PublishedArchive, PipelineError> {
        let staging = StagingArea::prepare(&self.settings.work_dir, true)
            .await
            .at(Stage::Staging)?;
        let partial = self.settings.public_dir.join(format!(
            ".{}.{}.partial",
            self.settings.archive_name,
            uuid::Uuid::new_v4()
        ));

        let build = self.build(staging.path(), &partial);
        let result = match self.settings.timeout {
            Some(limit) => tokio::time::timeout(limit, build)
                .await
                .unwrap_or(Err(PipelineError::TimedOut(limit))),
            None => build.await,
        };

        if result.is_err() {
            if let Err(e) = delete_recursive(&partial).await {
                warn!(path = %partial.display(), error = %e, "Failed to remove partial archive");
            }
        }
        staging.dispose().await;

        result
    }

    async fn build(&self, staging: &Path, partial: &Path) -> Result<PublishedArchive, PipelineError> {
        let source_zip = staging.join(SOURCE_ARCHIVE_NAME);
        download_archive(
            &self.client,
            &self.settings.source_url,
            &source_zip,
            &mut LogProgress::default(),
        )
        .await
        .at(Stage::Download)?;

        info!(archive = %source_zip.display(), "Extracting source archive");
        extract_archive(&source_zip, staging)
            .await
            .at(Stage::ExtractOuter)?;

        let out = staging.join(OUTPUT_DIR_NAME);
        create_directory(&out).await.at(Stage::ExtractOuter)?;

        for mode in self.settings.layout.modes {
            self.collect_mode(staging, &out, mode).await?;
        }

        create_directory(&self.settings.public_dir)
            .await
            .at(Stage::Package)?;
        let files = create_archive_from_directory(&out, partial)
            .await
            .at(Stage::Package)?;
        info!(files = files.len(), "Output packaged");

        self.publish(partial, &out, files).await.at(Stage::Publish)
    }

    async fn collect_mode(&self, staging: &Path, out: &Path, mode: &Mode) -> Result<(), PipelineError> {
        let inner_zip = staging
            .join(mode.index.to_string())
            .join(INNER_ARCHIVE_NAME);
        let mode_dir = staging.join(mode.name);

        info!(mode = mode.name, archive = %inner_zip.display(), "Extracting mode archive");
        create_directory(&mode_dir)
            .await
            .at(Stage::ExtractMode(mode.name))?;
        extract_archive(&inner_zip, &mode_dir)
            .await
            .at(Stage::ExtractMode(mode.name))?;

        for file in self.settings.layout.files {
            let from = mode_dir.join(file);
            let to = out.join(FeedLayout::output_name(mode, file));
            debug!(from = %from.display(), to = %to.display(), "Collecting file");
            copy_file(&from, &to).await.at(Stage::Collect(mode.name))?;
        }

        Ok(())
    }

    /// Publishes the loose files first and the archive last. The archive
    /// rename is the commit point: if anything before it fails, the previous
    /// archive stays in place.
    async fn publish(&self, partial: &Path, out: &Path, files: Vec<String>) -> Result<PublishedArchive, StageError> {
        let files_dir = self.settings.files_dir();
        create_directory(&files_dir).await?;
        for name in &files {
            let tmp = files_dir.join(format!(".{name}.{}.partial", uuid::Uuid::new_v4()));
            let staged = match copy_file(&out.join(name), &tmp).await {
                Ok(()) => replace(&tmp, &files_dir.join(name)).await.map_err(StageError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = staged {
                if let Err(cleanup) = delete_recursive(&tmp).await {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove partial file");
                }
                return Err(e);
            }
        }

        let target = self.settings.publish_path();
        replace(partial, &target).await?;
        prune_unlisted(&files_dir, &files).await;

        let size_bytes = tokio::fs::metadata(&target)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        info!(path = %target.display(), size_bytes, "Archive published");

        Ok(PublishedArchive {
            path: target,
            files,
            size_bytes,
            published_at: Utc::now(),
        })
    }
}

/// Moves `from` over `to` in a single rename, so readers of `to` see either
/// the old file or the new one.
async fn replace(from: &Path, to: &Path) -> Result<(), StagingError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|source| StagingError::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })
}

/// Removes files in `dir` left over from earlier runs.
async fn prune_unlisted(dir: &Path, keep: &[String]) {
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if keep.contains(name.to_string_lossy().as_ref()) {
            continue;
        }
        let path = entry.path();
        match delete_recursive(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed stale published file"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale published file"),
        }
    }
}

#[async_trait]
impl<C: HttpClient + 'static> Refresh for Pipeline<C> {
    async fn refresh(&self) -> Result<PublishedArchive, PipelineError> {
        self.run().await
    }
}
