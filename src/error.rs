//! Error types for each stage of the bundling pipeline.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure to fetch the source bundle.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("file at \"{url}\" was not an archive (content type {content_type:?})")]
    NotAnArchive {
        url: String,
        content_type: Option<String>,
    },

    #[error("\"{url}\" is not a valid URL: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to \"{url}\" failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("\"{url}\" responded with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("failed to write \"{url}\" to {}", .path.display())]
    Write {
        url: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub fn url(&self) -> &str {
        match self {
            DownloadError::NotAnArchive { url, .. }
            | DownloadError::InvalidUrl { url, .. }
            | DownloadError::Transport { url, .. }
            | DownloadError::Status { url, .. }
            | DownloadError::Write { url, .. } => url,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to extract archive {}", .archive.display())]
pub struct ExtractError {
    pub archive: PathBuf,
    #[source]
    pub source: zip::result::ZipError,
}

#[derive(Debug, Error)]
#[error("failed to copy {} to {}", .from.display(), .to.display())]
pub struct CopyError {
    pub from: PathBuf,
    pub to: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
#[error("failed to package {} into {}", .dir.display(), .archive.display())]
pub struct PackageError {
    pub dir: PathBuf,
    pub archive: PathBuf,
    #[source]
    pub source: zip::result::ZipError,
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("couldn't create directory {}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't delete {} after {attempts} attempts", .path.display())]
    Delete {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't move {} into place at {}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The step of a pipeline run that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Staging,
    Download,
    ExtractOuter,
    ExtractMode(&'static str),
    Collect(&'static str),
    Package,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Staging => write!(f, "preparing staging area"),
            Stage::Download => write!(f, "downloading source archive"),
            Stage::ExtractOuter => write!(f, "extracting source archive"),
            Stage::ExtractMode(mode) => write!(f, "extracting {mode} archive"),
            Stage::Collect(mode) => write!(f, "collecting {mode} files"),
            Stage::Package => write!(f, "packaging output"),
            Stage::Publish => write!(f, "publishing output"),
        }
    }
}

/// Underlying cause of a failed stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Staging(#[from] StagingError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline failed while {stage}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("pipeline run timed out after {0:?}")]
    TimedOut(Duration),
}

impl PipelineError {
    /// The failing stage, or `None` when the run timed out.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            PipelineError::TimedOut(_) => None,
        }
    }
}

/// Attaches a [`Stage`] to a stage-level failure.
pub(crate) trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T, E: Into<StageError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::Stage {
            stage,
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_stage_display_names_mode() {
        assert_eq!(
            Stage::ExtractMode("suburban").to_string(),
            "extracting suburban archive"
        );
    }

    #[test]
    fn test_at_stage_keeps_cause() {
        let result: Result<(), CopyError> = Err(CopyError {
            from: PathBuf::from("a/calendar.txt"),
            to: PathBuf::from("out/regional-calendar.txt"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });

        let err = result.at(Stage::Collect("regional")).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Collect("regional")));
        assert_eq!(err.to_string(), "pipeline failed while collecting regional files");
        let cause = err.source().unwrap();
        assert!(cause.to_string().contains("a/calendar.txt"));
    }

    #[test]
    fn test_timed_out_has_no_stage() {
        let err = PipelineError::TimedOut(Duration::from_secs(5));
        assert_eq!(err.stage(), None);
    }
}
