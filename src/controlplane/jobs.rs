//! Async join for backends that answer with job handles
//!
//! Long-running backend operations return a job id. [`wait_for_job`] polls
//! the job with exponential backoff until it reaches a terminal state or the
//! per-operation wait is spent. A [`Deadline`] carries one operation's
//! budget across lock waits and chained joins.

use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Something that can report the state of a backend job
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Backend the jobs run on, used in error reports
    fn backend_name(&self) -> &str;

    /// Raw state string of the job, e.g. `running`, `success`, `failure`
    async fn job_state(&self, job_id: &str) -> Result<JobStatus>;
}

/// One observation of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: String,
    pub message: String,
}

impl JobStatus {
    pub fn new(state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            message: message.into(),
        }
    }
}

/// Classified job state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Succeeded,
    Failed,
    Pending,
}

impl JobState {
    pub fn classify(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "success" => JobState::Succeeded,
            "failure" | "error" | "quit" | "dead" => JobState::Failed,
            _ => JobState::Pending,
        }
    }
}

/// Time budget of one driver operation
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + budget,
        }
    }

    /// Time left, zero once the deadline has passed
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Timeout error for `operation`, stamped with the time spent so far
    pub fn timeout(&self, operation: impl Into<String>) -> Error {
        Error::Timeout {
            operation: operation.into(),
            elapsed: self.elapsed(),
        }
    }
}

/// Polling policy for [`wait_for_job`]
#[derive(Debug, Clone)]
pub struct JobPollConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_wait: Duration,
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_wait: Duration::from_secs(30),
        }
    }
}

impl JobPollConfig {
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Cap the wait at what is left of `deadline`
    pub fn within(self, deadline: &Deadline) -> Self {
        let max_wait = self.max_wait.min(deadline.remaining());
        self.with_max_wait(max_wait)
    }
}

/// Poll `job_id` until it succeeds, fails or `max_wait` elapses
///
/// Errors from the job source itself end the wait immediately. Sleeps are
/// capped at the time left, so the call overshoots `max_wait` by at most
/// one status request.
pub async fn wait_for_job<S: JobSource + ?Sized>(
    source: &S,
    job_id: &str,
    config: &JobPollConfig,
) -> Result<()> {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_interval)
        .with_multiplier(config.multiplier)
        .with_randomization_factor(config.randomization_factor)
        .with_max_interval(config.max_wait)
        .with_max_elapsed_time(None)
        .build();

    let started = Instant::now();
    let deadline = started + config.max_wait;

    loop {
        let status = source.job_state(job_id).await?;

        match JobState::classify(&status.state) {
            JobState::Succeeded => {
                info!("Job {} completed in {:?}", job_id, started.elapsed());
                return Ok(());
            }
            JobState::Failed => {
                return Err(Error::rejected(
                    source.backend_name(),
                    format!("job {}", job_id),
                    format!("ended in state {}: {}", status.state, status.message),
                ));
            }
            JobState::Pending => {
                debug!("Job {} is {}", job_id, status.state);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout {
                operation: format!("job {}", job_id),
                elapsed: now - started,
            });
        }

        let interval = backoff.next_backoff().unwrap_or(config.initial_interval);
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Reports `in_progress` until `ready_after` has elapsed, then `final_state`
    struct TimedJob {
        started: Instant,
        ready_after: Duration,
        final_state: &'static str,
        polls: AtomicUsize,
    }

    impl TimedJob {
        fn new(ready_after: Duration, final_state: &'static str) -> Self {
            Self {
                started: Instant::now(),
                ready_after,
                final_state,
                polls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobSource for TimedJob {
        fn backend_name(&self) -> &str {
            "timed"
        }

        async fn job_state(&self, _job_id: &str) -> Result<JobStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.started.elapsed() >= self.ready_after {
                Ok(JobStatus::new(self.final_state, "done"))
            } else {
                Ok(JobStatus::new("in_progress", ""))
            }
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(JobState::classify("success"), JobState::Succeeded);
        for s in ["failure", "error", "quit", "dead", "FAILURE"] {
            assert_eq!(JobState::classify(s), JobState::Failed);
        }
        for s in ["queued", "running", "in_progress", ""] {
            assert_eq!(JobState::classify(s), JobState::Pending);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_succeeds_after_progress() {
        let job = TimedJob::new(Duration::from_secs(5), "success");
        let started = Instant::now();

        assert_ok!(wait_for_job(&job, "42", &JobPollConfig::default()).await);

        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(job.polls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_failure_stops_polling() {
        let job = TimedJob::new(Duration::ZERO, "failure");

        let err = assert_err!(wait_for_job(&job, "43", &JobPollConfig::default()).await);

        assert_matches!(err, Error::BackendRejected { ref operation, .. } if operation == "job 43");
        assert_eq!(job.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_names_job() {
        let job = TimedJob::new(Duration::from_secs(3600), "success");
        let config = JobPollConfig::default().with_max_wait(Duration::from_secs(10));
        let started = Instant::now();

        let err = wait_for_job(&job, "44", &config).await.unwrap_err();

        assert_matches!(err, Error::Timeout { ref operation, .. } if operation == "job 44");
        assert!(started.elapsed() <= Duration::from_secs(10) + config.initial_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chained_joins_share_one_deadline() {
        let job = TimedJob::new(Duration::from_secs(3600), "success");
        let deadline = Deadline::after(Duration::from_secs(10));

        let first = JobPollConfig::default().within(&deadline);
        assert_err!(wait_for_job(&job, "45", &first).await);
        assert!(deadline.is_expired());

        let second = JobPollConfig::default().within(&deadline);
        assert_eq!(second.max_wait, Duration::ZERO);
        let err = wait_for_job(&job, "46", &second).await.unwrap_err();
        assert_matches!(err, Error::Timeout { .. });
        assert!(deadline.elapsed() <= Duration::from_secs(10) + first.initial_interval);
    }
}
