//! Error taxonomy shared by every stage of a submission.
//!
//! Each resolver or adapter returns its own error type so callers can match on
//! the precise cause; the orchestrator wraps them together with the stage in
//! which they occurred (see [`crate::orchestrator::SubmissionError`]).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Where a role value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOrigin {
    Environment,
    ConfigProfile,
}

impl fmt::Display for RoleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleOrigin::Environment => f.write_str("environment"),
            RoleOrigin::ConfigProfile => f.write_str("config profile"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoleError {
    #[error("no role resolved: set SAGEMAKER_ROLE or role_arn in the config profile")]
    Unresolved,
    #[error("malformed role ARN from {origin}: '{value}'")]
    MalformedArn { origin: RoleOrigin, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error(
        "no role resolved for profile '{profile}': set SAGEMAKER_ROLE or role_arn in the profile"
    )]
    MissingRole { profile: String },
    #[error("invalid config profile '{profile}': {reason}")]
    InvalidProfile { profile: String, reason: String },
    #[error("'{field}' is required but not set by flag, environment or profile '{profile}'")]
    MissingField { field: &'static str, profile: String },
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error(transparent)]
    Role(RoleError),
}

#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("input path not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("no video files found in {}", .0.display())]
    NoVideoFiles(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("job name must not be empty")]
    EmptyJobName,
    #[error("no videos left to submit")]
    EmptyInputSet,
    #[error("{name} threshold {value} is outside [0, 1]")]
    ThresholdOutOfRange { name: &'static str, value: f64 },
    #[error("unknown tracker '{0}', expected deepsort or strongsort")]
    UnknownTracker(String),
    #[error("model reference '{0}' is not an s3://bucket/key URI")]
    InvalidModelRef(String),
    #[error("model size {0} must be a positive multiple of 32")]
    InvalidModelSize(u32),
    #[error("tracker config '{0}' is not an s3://bucket/key URI")]
    InvalidTrackConfigRef(String),
}

/// Failures reported by a cloud capability.
///
/// Only [`BackendError::TransientNetwork`] and [`BackendError::Timeout`] are
/// retried; everything else surfaces immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("authorization failed: {0}")]
    AuthFailure(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::TransientNetwork(_) | BackendError::Timeout { .. }
        )
    }
}
