//! Backend adapters: where a [`JobSpec`] is actually submitted.
//!
//! [`Backend`] is a closed set of two variants with very different shapes: a
//! single managed processing job covering every video, or a fan-out of
//! independent tasks onto a compute cluster. Both report through the same
//! [`SubmissionResult`] and [`JobStatus`].

pub mod cluster;
pub mod retry;
pub mod single_job;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::BackendError;
use crate::job::JobSpec;
use crate::location::S3Uri;

pub use cluster::{ClusterBackend, ClusterBackendSettings};
pub use retry::{RetryPolicy, DEFAULT_CALL_TIMEOUT};
pub use single_job::{SingleJobBackend, SingleJobSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    SingleJob,
    Cluster,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::SingleJob => f.write_str("single-job"),
            BackendKind::Cluster => f.write_str("cluster"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmissionStatus {
    Submitted,
    Rejected,
    PartiallyFailed,
}

impl SubmissionStatus {
    /// Status implied by per-task outcome counts.
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => SubmissionStatus::Submitted,
            (0, _) => SubmissionStatus::Rejected,
            _ => SubmissionStatus::PartiallyFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded { task_id: String, message_id: String },
    Failed { task_id: String, cause: BackendError },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskOutcome::Succeeded { task_id, .. } | TaskOutcome::Failed { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionResult {
    pub backend: BackendKind,
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    /// Per-video outcomes; empty for single-job submissions.
    pub tasks: BTreeMap<PathBuf, TaskOutcome>,
    pub name_reused: bool,
}

impl SubmissionResult {
    pub fn succeeded(&self) -> usize {
        self.tasks.values().filter(|t| t.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.tasks.len() - self.succeeded()
    }

    /// First task failure, in path order.
    pub fn first_failure(&self) -> Option<&BackendError> {
        self.tasks.values().find_map(|t| match t {
            TaskOutcome::Failed { cause, .. } => Some(cause),
            TaskOutcome::Succeeded { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running { detail: String },
    Completed,
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => f.write_str("pending"),
            JobStatus::Running { detail } => write!(f, "running ({detail})"),
            JobStatus::Completed => f.write_str("completed"),
            JobStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Maps a free-form job name onto `[A-Za-z0-9-]`, collapsing runs of other
/// characters into a single `-` and truncating to `max_len`.
pub(crate) fn sanitise_name(name: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.truncate(max_len);
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        "job".to_string()
    } else {
        out
    }
}

pub enum Backend {
    SingleJob(SingleJobBackend),
    Cluster(ClusterBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::SingleJob(_) => BackendKind::SingleJob,
            Backend::Cluster(_) => BackendKind::Cluster,
        }
    }

    /// Where videos must be staged before submission, if anywhere.
    pub fn staging_root(&self) -> Option<S3Uri> {
        match self {
            Backend::SingleJob(b) => Some(b.staging_root()),
            Backend::Cluster(b) => b.staging_root(),
        }
    }

    /// True when the backend already knows a job with this name.
    pub async fn job_name_in_use(&self, job_name: &str) -> Result<bool, BackendError> {
        match self {
            Backend::SingleJob(b) => b.job_name_in_use(job_name).await,
            Backend::Cluster(b) => b.job_name_in_use(job_name).await,
        }
    }

    pub async fn submit(&self, spec: &JobSpec) -> Result<SubmissionResult, BackendError> {
        match self {
            Backend::SingleJob(b) => b.submit(spec).await,
            Backend::Cluster(b) => b.submit(spec).await,
        }
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        match self {
            Backend::SingleJob(b) => b.status(job_id).await,
            Backend::Cluster(b) => b.status(job_id).await,
        }
    }
}
