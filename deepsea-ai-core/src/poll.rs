//! Read-only status polling after submission.
//!
//! [`poll_until_settled`] asks the backend for status with a growing interval
//! until the job reaches a terminal state, the overall timeout expires, or the
//! caller's cancel future resolves (the CLI passes Ctrl-C).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backend, JobStatus};
use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(600),
            timeout: Duration::from_secs(48 * 3600),
        }
    }
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Settled(JobStatus),
    TimedOut { last: Option<JobStatus> },
    Cancelled { last: Option<JobStatus> },
    Error(BackendError),
}

/// Anything whose status can be polled.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError>;
}

#[async_trait]
impl StatusSource for Backend {
    async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        Backend::status(self, job_id).await
    }
}

/// Polls `source` until settled. Transient errors are logged and polling
/// continues; other errors end polling.
pub async fn poll_until_settled<S, C>(
    source: &S,
    job_id: &str,
    policy: &PollPolicy,
    cancel: C,
) -> PollOutcome
where
    S: StatusSource + ?Sized,
    C: Future<Output = ()>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut interval = policy.initial_interval;
    let mut last: Option<JobStatus> = None;
    tokio::pin!(cancel);

    loop {
        match source.status(job_id).await {
            Ok(status) if status.is_terminal() => {
                info!(job_id, status = %status, "[POLL] Job settled");
                return PollOutcome::Settled(status);
            }
            Ok(status) => {
                if last.as_ref() != Some(&status) {
                    info!(job_id, status = %status, "[POLL] Status changed");
                }
                last = Some(status);
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id, error = %e, "[POLL] Status check failed, will retry");
            }
            Err(e) => return PollOutcome::Error(e),
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(job_id, "[POLL] Gave up waiting");
            return PollOutcome::TimedOut { last };
        }
        let wake = (now + interval).min(deadline);
        debug!(job_id, interval_secs = interval.as_secs(), "[POLL] Sleeping");

        tokio::select! {
            _ = &mut cancel => {
                info!(job_id, "[POLL] Cancelled");
                return PollOutcome::Cancelled { last };
            }
            _ = tokio::time::sleep_until(wake) => {}
        }
        interval = policy.next_interval(interval);
    }
}
