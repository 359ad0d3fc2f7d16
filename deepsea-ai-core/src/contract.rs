//! # contract: cloud capabilities consumed by the orchestration core
//!
//! The core never talks to a cloud SDK directly. Everything it needs from the
//! outside world is one of the traits below:
//!
//! - [`IdentityProvider`]: who is calling (account, user name)
//! - [`ObjectStore`]: stage videos and write manifests
//! - [`ProcessingService`]: the single managed processing job
//! - [`ClusterService`]: cluster discovery, task messages and queue depth
//!
//! Production implementations live in the `deepsea-ai` crate and wrap the AWS
//! SDK. Every trait is annotated for `mockall`, so tests drive the orchestrator
//! with deterministic mocks.
//!
//! All methods return [`BackendError`]; implementors classify upstream failures
//! into its variants so the retry policy can decide what to repeat.

use std::path::Path;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::location::S3Uri;

/// A key/value tag attached to staged objects and processing jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTag {
    pub key: String,
    pub value: String,
}

impl ObjectTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    /// Last path segment of the caller ARN (user or assumed-role session).
    pub user_name: String,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn caller_identity(&self) -> Result<CallerIdentity, BackendError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// True when an object already exists at `uri`.
    async fn object_exists(&self, uri: &S3Uri) -> Result<bool, BackendError>;

    /// Uploads a local file to `uri`.
    async fn upload_file(&self, path: &Path, uri: &S3Uri) -> Result<(), BackendError>;

    /// Writes a small in-memory object (manifests, job records).
    async fn put_object(&self, uri: &S3Uri, body: Vec<u8>) -> Result<(), BackendError>;

    async fn tag_object(&self, uri: &S3Uri, tags: &[ObjectTag]) -> Result<(), BackendError>;

    /// Creates `bucket` with `tags` unless it exists. Returns true when it
    /// was created.
    async fn ensure_bucket(&self, bucket: &str, tags: &[ObjectTag]) -> Result<bool, BackendError>;
}

/// A fully translated request for one managed processing job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingJobRequest {
    pub job_name: String,
    pub image_uri: String,
    pub role_arn: String,
    pub instance_type: String,
    pub volume_size_gb: i32,
    pub max_runtime_secs: i32,
    pub arguments: Vec<String>,
    /// Manifest listing every input video; the job reads its input through it.
    pub input_manifest: S3Uri,
    pub output: S3Uri,
    pub tags: Vec<ObjectTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobState {
    InProgress,
    Completed,
    Failed,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingJobDescription {
    pub job_id: String,
    pub state: RemoteJobState,
    pub failure_reason: Option<String>,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ProcessingService: Send + Sync {
    /// Creates the job and returns its identifier (ARN).
    async fn create_processing_job(
        &self,
        request: &ProcessingJobRequest,
    ) -> Result<String, BackendError>;

    async fn describe_processing_job(
        &self,
        job_name: &str,
    ) -> Result<ProcessingJobDescription, BackendError>;

    /// Names of existing jobs whose name contains `name_contains`.
    async fn list_processing_jobs(&self, name_contains: &str) -> Result<Vec<String>, BackendError>;
}

/// Resources backing a processing cluster, discovered from its stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterResources {
    pub cluster: String,
    pub processor: String,
    pub video_queue: String,
    pub track_queue: Option<String>,
    pub dead_queue: Option<String>,
    pub video_bucket: String,
    pub track_bucket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskVideos {
    Single { video: String },
    Batch { videos: Vec<String> },
}

/// Body of one work-queue message, as read by the cluster workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(flatten)]
    pub videos: TaskVideos,
    /// Workers expect the Python-style strings `"True"` / `"False"`.
    pub clean: String,
    pub user_name: String,
    pub job_name: String,
    pub conf_thres: String,
    pub iou_thres: String,
    pub tracker: String,
    pub model_s3: String,
    pub model_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_s3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reid_weights: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterTask {
    /// Deduplication id; identical for retries within one invocation.
    pub task_id: String,
    /// Message group; one per invocation so tasks are ordered per job.
    pub group_id: String,
    pub message: TaskMessage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterProgress {
    pub queued: u64,
    pub in_flight: u64,
    pub running_tasks: u64,
    /// Messages parked in the dead-letter queue.
    pub failed: u64,
}

impl ClusterProgress {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight == 0 && self.running_tasks == 0
    }
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ClusterService: Send + Sync {
    async fn describe_cluster(&self, cluster: &str) -> Result<ClusterResources, BackendError>;

    /// Enqueues one task and returns the message id.
    async fn send_task(
        &self,
        resources: &ClusterResources,
        task: &ClusterTask,
    ) -> Result<String, BackendError>;

    async fn cluster_progress(
        &self,
        resources: &ClusterResources,
    ) -> Result<ClusterProgress, BackendError>;
}
