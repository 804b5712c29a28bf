// Background Job Scheduler
//
// Runs the graph jobs on their configured schedules, serves on-demand
// triggers through the same execution path, and keeps a bounded in-memory
// execution history.

use super::config::{EvolutionConfig, JobConfig, Schedule};
use crate::error::TagmakerError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Runs kept in memory for `get_job_history`
const HISTORY_LIMIT: usize = 200;

/// How long a run that hit `max_duration` gets to return its partial report
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job execution failed: {0}")]
    ExecutionError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] TagmakerError),

    #[error("Job is already running")]
    AlreadyRunning,

    #[error("Job configuration invalid: {0}")]
    ConfigError(String),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job error: {0}")]
    JobError(#[from] JobError),
}

/// Report generated after job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Number of units processed (events or tags)
    pub items_processed: usize,

    /// Number of changes made
    pub changes_made: usize,

    /// Duration of job execution
    #[serde(with = "serde_duration_millis")]
    pub duration: Duration,

    /// Number of errors encountered
    pub errors: usize,

    /// Optional error message if job failed
    pub error_message: Option<String>,
}

impl JobReport {
    fn failed(duration: Duration, message: String) -> Self {
        Self {
            items_processed: 0,
            changes_made: 0,
            duration,
            errors: 1,
            error_message: Some(message),
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as milliseconds)
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Trait for evolution jobs
#[async_trait]
pub trait EvolutionJob: Send + Sync {
    /// Job name (for logging, tracking and triggering)
    fn name(&self) -> &str;

    /// Run the job once
    ///
    /// Implementations check `cancel` between units of work and return a
    /// partial report when it fires.
    async fn run(&self, config: &JobConfig, cancel: CancellationToken)
        -> Result<JobReport, JobError>;

    /// Precondition checked before every scheduled or triggered run
    async fn should_run(&self) -> Result<bool, JobError> {
        Ok(true)
    }
}

/// Job execution record for tracking history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub report: Option<JobReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
}

/// State shared between the per-job loops and `trigger`
#[derive(Default)]
struct Shared {
    history: RwLock<VecDeque<JobRun>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes the job from the in-flight set when the run ends, however it ends
struct InFlightGuard {
    shared: Arc<Shared>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.shared.in_flight.lock() {
            set.remove(&self.name);
        }
    }
}

/// Background job scheduler
pub struct BackgroundScheduler {
    config: EvolutionConfig,
    jobs: Vec<Arc<dyn EvolutionJob>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
}

impl BackgroundScheduler {
    /// Create a new scheduler with configuration and jobs
    pub fn new(config: EvolutionConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Register a job with the scheduler
    pub fn register_job(&mut self, job: Arc<dyn EvolutionJob>) {
        self.jobs.push(job);
    }

    /// Token cancelled by `stop()`; runs in progress observe it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the scheduler (runs until stopped)
    ///
    /// Each enabled job gets its own loop so a long rebalance never delays
    /// edge learning.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        tracing::info!("Starting background evolution scheduler");

        let mut loops = JoinSet::new();
        for job in &self.jobs {
            let job_config = match self.get_job_config(job.name()) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Not scheduling job {}: {}", job.name(), e);
                    continue;
                }
            };

            if !job_config.enabled {
                tracing::info!("Job {} is disabled, not scheduling", job.name());
                continue;
            }

            loops.spawn(job_loop(
                Arc::clone(job),
                job_config,
                Arc::clone(&self.shared),
                self.shutdown.clone(),
            ));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!("Scheduler loop panicked: {}", e);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Stopped background evolution scheduler");
        Ok(())
    }

    /// Stop the scheduler and cancel runs in progress
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run a job now through the same path the schedule uses
    pub async fn trigger(&self, job_name: &str) -> Result<JobReport, SchedulerError> {
        let job = self
            .jobs
            .iter()
            .find(|j| j.name() == job_name)
            .ok_or_else(|| SchedulerError::UnknownJob(job_name.to_string()))?;

        tracing::info!("Manual trigger for job {}", job_name);
        self.run_job(job.as_ref()).await
    }

    /// Run a specific job with timeout
    async fn run_job(&self, job: &dyn EvolutionJob) -> Result<JobReport, SchedulerError> {
        let job_config = self.get_job_config(job.name())?;
        execute(
            job,
            &job_config,
            &self.shared,
            self.shutdown.child_token(),
        )
        .await
    }

    /// Get job configuration by job name
    fn get_job_config(&self, job_name: &str) -> Result<JobConfig, SchedulerError> {
        match job_name {
            super::edges::JOB_NAME => Ok(self.config.edge_learning.clone()),
            super::tiering::JOB_NAME => Ok(self.config.rebalance.clone()),
            // For testing: allow test jobs with default config
            name if name.starts_with("test_") => Ok(JobConfig {
                enabled: true,
                schedule: Schedule::Interval {
                    every: Duration::from_secs(300), // 5 minutes
                },
                max_duration: Duration::from_secs(300), // 5 minutes
            }),
            _ => Err(SchedulerError::JobError(JobError::ConfigError(format!(
                "Unknown job name: {}",
                job_name
            )))),
        }
    }

    /// Get history of job runs, newest first
    pub async fn get_job_history(&self, job_name: Option<&str>, limit: usize) -> Vec<JobRun> {
        let history = self.shared.history.read().await;
        history
            .iter()
            .rev()
            .filter(|run| job_name.map_or(true, |name| run.job_name == name))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Scheduling loop for one job
async fn job_loop(
    job: Arc<dyn EvolutionJob>,
    config: JobConfig,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut last_finished: Option<DateTime<Utc>> = None;
    let started = Utc::now();

    loop {
        let now = Utc::now();
        let due = next_due(&config.schedule, last_finished.unwrap_or(started), now);
        let wait = (due - now).to_std().unwrap_or_default();

        tracing::debug!("Job {} next due at {}", job.name(), due);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = execute(job.as_ref(), &config, &shared, shutdown.child_token()).await {
            tracing::error!("Job {} failed: {}", job.name(), e);
        }
        last_finished = Some(Utc::now());
    }

    tracing::debug!("Scheduling loop for {} exited", job.name());
}

/// Next fire time of `schedule` given the reference point `last`
///
/// Interval schedules fire `every` after the previous run finished (or after
/// the scheduler started). Daily schedules fire at the next matching UTC
/// wall-clock time strictly after `now`.
pub fn next_due(schedule: &Schedule, last: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    match schedule {
        Schedule::Interval { every } => {
            let every = ChronoDuration::from_std(*every).unwrap_or(ChronoDuration::zero());
            last + every
        }
        Schedule::Daily { hour, minute } => {
            let at = NaiveTime::from_hms_opt(*hour, *minute, 0).unwrap_or(NaiveTime::MIN);
            let today = now.date_naive().and_time(at).and_utc();
            if today > now {
                today
            } else {
                today + ChronoDuration::days(1)
            }
        }
    }
}

/// Execute one run of `job`: in-flight guard, precondition, deadline, history
async fn execute(
    job: &dyn EvolutionJob,
    job_config: &JobConfig,
    shared: &Arc<Shared>,
    cancel: CancellationToken,
) -> Result<JobReport, SchedulerError> {
    let job_name = job.name().to_string();

    let _guard = {
        let mut in_flight = shared
            .in_flight
            .lock()
            .map_err(|e| JobError::ExecutionError(e.to_string()))?;
        if !in_flight.insert(job_name.clone()) {
            tracing::warn!("Job {} is already running, skipping", job_name);
            return Err(JobError::AlreadyRunning.into());
        }
        InFlightGuard {
            shared: Arc::clone(shared),
            name: job_name.clone(),
        }
    };

    let start_time = Utc::now();
    let started = Instant::now();
    let job_id = uuid::Uuid::new_v4().to_string();

    match job.should_run().await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("Job {} not due yet", job_name);
            let report = JobReport {
                items_processed: 0,
                changes_made: 0,
                duration: started.elapsed(),
                errors: 0,
                error_message: None,
            };
            record_job_run(shared, &job_id, &job_name, start_time, JobStatus::Skipped, &report)
                .await;
            return Ok(report);
        }
        Err(e) => {
            tracing::error!("Precondition for job {} failed: {}", job_name, e);
            let report = JobReport::failed(started.elapsed(), e.to_string());
            record_job_run(shared, &job_id, &job_name, start_time, JobStatus::Failed, &report)
                .await;
            return Err(e.into());
        }
    }

    tracing::info!("Starting job {} (id: {})", job_name, job_id);

    let run = job.run(job_config, cancel.clone());
    tokio::pin!(run);

    let (status, report) = match timeout(job_config.max_duration, &mut run).await {
        Ok(Ok(report)) => {
            tracing::info!(
                "Job {} completed: {} processed, {} changes, {} errors in {:?}",
                job_name,
                report.items_processed,
                report.changes_made,
                report.errors,
                report.duration
            );
            (JobStatus::Success, report)
        }
        Ok(Err(e)) => {
            tracing::error!("Job {} failed: {}", job_name, e);
            (
                JobStatus::Failed,
                JobReport::failed(started.elapsed(), e.to_string()),
            )
        }
        Err(_) => {
            tracing::error!(
                "Job {} timed out after {:?}, cancelling",
                job_name,
                job_config.max_duration
            );
            cancel.cancel();

            let message = JobError::Timeout(job_config.max_duration).to_string();
            let report = match timeout(CANCEL_GRACE, &mut run).await {
                Ok(Ok(mut partial)) => {
                    partial.error_message = Some(message);
                    partial
                }
                Ok(Err(e)) => JobReport::failed(started.elapsed(), format!("{}: {}", message, e)),
                Err(_) => {
                    tracing::warn!("Job {} ignored cancellation, dropping it", job_name);
                    JobReport::failed(started.elapsed(), message)
                }
            };
            (JobStatus::Timeout, report)
        }
    };

    record_job_run(shared, &job_id, &job_name, start_time, status, &report).await;
    Ok(report)
}

async fn record_job_run(
    shared: &Shared,
    id: &str,
    job_name: &str,
    started_at: DateTime<Utc>,
    status: JobStatus,
    report: &JobReport,
) {
    tracing::debug!("Job run recorded: {} - {:?}", job_name, status);

    let mut history = shared.history.write().await;
    if history.len() >= HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(JobRun {
        id: id.to_string(),
        job_name: job_name.to_string(),
        started_at,
        completed_at: Some(Utc::now()),
        status,
        report: Some(report.clone()),
    });
}
