mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use std::path::Path;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::DownloadError;

/// Media types accepted as a zip payload.
const ARCHIVE_MEDIA_TYPES: &[&str] = &[
    "application/zip",
    "application/x-zip-compressed",
    "application/x-zip",
];

/// Receives download progress as a percentage of the declared length.
pub trait Progress: Send {
    fn report(&mut self, percent: f64);
}

/// Logs progress each time another tenth of the download has arrived.
#[derive(Debug, Default)]
pub struct LogProgress {
    logged_steps: u32,
}

impl Progress for LogProgress {
    fn report(&mut self, percent: f64) {
        let step = (percent / 10.0).floor() as u32;
        if step > self.logged_steps {
            self.logged_steps = step;
            info!(percent = format!("{percent:.2}"), "Download progress");
        }
    }
}

/// Returns true if a `Content-Type` value names a zip archive.
pub fn is_archive_content_type(value: &str) -> bool {
    let media_type = value.split(';').next().unwrap_or("").trim();
    ARCHIVE_MEDIA_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(media_type))
}

/// Percentage of `total` covered by `received`, if the total is known.
pub fn percent_complete(received: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(0) | None => None,
        Some(total) => Some(received as f64 / total as f64 * 100.0),
    }
}

/// Downloads the archive at `url` into `destination`, returning the number
/// of bytes written.
///
/// The response must declare a zip content type. That is checked before the
/// destination file is created, so a rejected response leaves nothing on
/// disk. A partially written file after a later failure is left in place.
#[tracing::instrument(skip_all, fields(url = %url, destination = %destination.display()))]
pub async fn download_archive<C: HttpClient, P: Progress>(
    client: &C,
    url: &str,
    destination: &Path,
    progress: &mut P,
) -> Result<u64, DownloadError> {
    let transport = |source: reqwest::Error| DownloadError::Transport {
        url: url.to_string(),
        source,
    };

    let parsed = reqwest::Url::parse(url).map_err(|e| DownloadError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);
    let resp = client.execute(req).await.map_err(transport)?;

    let status = resp.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status,
        });
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if !content_type.as_deref().is_some_and(is_archive_content_type) {
        return Err(DownloadError::NotAnArchive {
            url: url.to_string(),
            content_type,
        });
    }

    let total = resp.content_length();
    debug!(content_length = ?total, "Archive response accepted");

    let write_err = |source: std::io::Error| DownloadError::Write {
        url: url.to_string(),
        path: destination.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(destination).await.map_err(write_err)?;

    let mut received: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk.map_err(transport)?;
        received += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(write_err)?;

        if let Some(percent) = percent_complete(received, total) {
            progress.report(percent);
        }
    }
    file.flush().await.map_err(write_err)?;

    info!(bytes = received, "Archive downloaded");
    Ok(received)
}
