//! Staleness-driven background refresh.
//!
//! [`Scheduler::initial_run`] publishes the first archive before anything is
//! served. [`Scheduler::run`] then polls on a fixed interval and spawns a new
//! pipeline run whenever the last attempt is older than the staleness
//! threshold. Runs are fire-and-forget: their outcome is only logged and
//! recorded in the shared [`RefreshReport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::PublishedArchive;

/// Something that can rebuild and publish the archive.
#[async_trait]
pub trait Refresh: Send + Sync + 'static {
    async fn refresh(&self) -> Result<PublishedArchive, PipelineError>;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Age of the last attempt beyond which a refresh is triggered.
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Mutable state of the polling loop.
#[derive(Debug, Clone)]
pub struct RefreshState {
    last_attempt: DateTime<Utc>,
}

impl RefreshState {
    pub fn new(last_attempt: DateTime<Utc>) -> Self {
        Self { last_attempt }
    }

    pub fn last_attempt(&self) -> DateTime<Utc> {
        self.last_attempt
    }

    /// True once strictly more than `stale_after` has passed since the last
    /// attempt.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let age = now.signed_duration_since(self.last_attempt);
        match chrono::Duration::from_std(stale_after) {
            Ok(limit) => age > limit,
            Err(_) => false,
        }
    }
}

/// Outcome of the most recent refreshes, shared with the HTTP layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_progress: bool,
    pub published: Option<PublishedArchive>,
}

pub type SharedReport = Arc<RwLock<RefreshReport>>;

pub struct Scheduler<R, K = SystemClock> {
    refresher: Arc<R>,
    clock: K,
    settings: SchedulerSettings,
    running: Arc<AtomicBool>,
    report: SharedReport,
}

impl<R: Refresh> Scheduler<R, SystemClock> {
    pub fn new(refresher: R, settings: SchedulerSettings) -> Self {
        Self::with_clock(refresher, SystemClock, settings)
    }
}

impl<R: Refresh, K: Clock> Scheduler<R, K> {
    pub fn with_clock(refresher: R, clock: K, settings: SchedulerSettings) -> Self {
        Self {
            refresher: Arc::new(refresher),
            clock,
            settings,
            running: Arc::new(AtomicBool::new(false)),
            report: SharedReport::default(),
        }
    }

    pub fn report(&self) -> SharedReport {
        self.report.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs the pipeline once and waits for it.
    ///
    /// A failure here is returned rather than logged: without a first
    /// archive there is nothing to serve.
    pub async fn initial_run(&self) -> Result<RefreshState, PipelineError> {
        let started = self.clock.now();
        info!("Running initial refresh");
        self.report.write().await.last_attempt = Some(started);

        let result = self.refresher.refresh().await;
        let outcome = result.as_ref().map(Clone::clone).map_err(ToString::to_string);
        record_outcome(&self.report, outcome).await;
        result?;

        Ok(RefreshState::new(started))
    }

    /// Spawns a refresh if the data is stale and no refresh is running.
    ///
    /// `last_attempt` is moved to now before the run starts. The returned
    /// handle only matters to tests; the loop drops it.
    pub fn tick(&self, state: &mut RefreshState) -> Option<JoinHandle<()>> {
        let now = self.clock.now();
        if !state.is_stale(now, self.settings.stale_after) {
            debug!(last_attempt = %state.last_attempt, "Data is fresh, skipping refresh");
            return None;
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(last_attempt = %state.last_attempt, "Previous refresh still running, skipping");
            return None;
        }

        state.last_attempt = now;
        info!(last_attempt = %now, "Data is stale, starting refresh");

        let refresher = self.refresher.clone();
        let report = self.report.clone();
        let guard = RunningGuard(self.running.clone());
        Some(tokio::spawn(async move {
            let _guard = guard;
            {
                let mut report = report.write().await;
                report.last_attempt = Some(now);
                report.in_progress = true;
            }

            let result = refresher.refresh().await;
            match &result {
                Ok(published) => info!(
                    path = %published.path.display(),
                    files = published.files.len(),
                    "Refresh complete"
                ),
                Err(e) => error!(error = %e, "Refresh failed, keeping previously published archive"),
            }
            record_outcome(&report, result.map_err(|e| e.to_string())).await;
        }))
    }

    /// Polls forever, calling [`Scheduler::tick`] every `poll_interval`.
    pub async fn run(self, mut state: RefreshState) {
        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            stale_after_secs = self.settings.stale_after.as_secs(),
            "Refresh scheduler started"
        );

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and the data was just refreshed.
        interval.tick().await;

        loop {
            interval.tick().await;
            let _ = self.tick(&mut state);
        }
    }
}

async fn record_outcome(report: &SharedReport, outcome: Result<PublishedArchive, String>) {
    let mut report = report.write().await;
    report.in_progress = false;
    match outcome {
        Ok(published) => {
            report.last_success = Some(published.published_at);
            report.last_error = None;
            report.published = Some(published);
        }
        Err(message) => report.last_error = Some(message),
    }
}

/// Clears the in-progress flag when a run ends, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
