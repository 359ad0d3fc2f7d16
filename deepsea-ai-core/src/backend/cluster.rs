//! Fan-out of one task message per video (or batch of videos) onto a
//! processing cluster's work queue.
//!
//! Tasks are independent: one rejected message never stops the others, and
//! accepted messages are never withdrawn. Every video ends up in the outcome
//! map exactly once, so the caller can tell precisely what to resubmit.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::{with_timeout, RetryPolicy, DEFAULT_CALL_TIMEOUT};
use super::{
    sanitise_name, BackendKind, JobStatus, SubmissionResult, SubmissionStatus, TaskOutcome,
};
use crate::contract::{
    ClusterProgress, ClusterResources, ClusterService, ClusterTask, ObjectStore, TaskMessage,
    TaskVideos,
};
use crate::enumerate::VideoInput;
use crate::error::BackendError;
use crate::job::JobSpec;
use crate::location::S3Uri;

/// Job records are kept under this prefix of the cluster's video bucket.
pub const JOB_RECORD_PREFIX: &str = "deepsea-ai/jobs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBackendSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Ask workers to delete the source video once tracked.
    pub clean: bool,
    /// Stage local videos into the cluster's video bucket first.
    pub upload: bool,
    pub user_name: String,
}

/// Deduplication id for one task: stable across retries of the same
/// invocation, distinct across invocations.
pub fn task_id(job_name: &str, keys: &[String], nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_name.as_bytes());
    for key in keys {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
    }
    hasher.update(b"\n");
    hasher.update(nonce.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Serialize)]
struct JobRecord<'a> {
    job_name: &'a str,
    job_id: &'a str,
    cluster: &'a str,
    submitted_at: DateTime<Utc>,
    tasks: BTreeMap<String, String>,
}

pub struct ClusterBackend {
    service: Arc<dyn ClusterService>,
    store: Arc<dyn ObjectStore>,
    resources: ClusterResources,
    settings: ClusterBackendSettings,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ClusterBackend {
    /// Discovers the cluster's resources and returns a backend bound to them.
    /// Each call, discovery included, is bounded by `call_timeout`.
    pub async fn connect(
        service: Arc<dyn ClusterService>,
        store: Arc<dyn ObjectStore>,
        cluster: &str,
        settings: ClusterBackendSettings,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let resources = retry
            .run("describe cluster", || {
                with_timeout(
                    "describe cluster",
                    call_timeout,
                    service.describe_cluster(cluster),
                )
            })
            .await?;
        info!(
            cluster = %resources.cluster,
            queue = %resources.video_queue,
            bucket = %resources.video_bucket,
            processor = %resources.processor,
            "[CLUSTER] Discovered cluster resources"
        );
        let backend = Self::new(service, store, resources, settings, retry);
        Ok(backend.with_call_timeout(call_timeout))
    }

    pub fn new(
        service: Arc<dyn ClusterService>,
        store: Arc<dyn ObjectStore>,
        resources: ClusterResources,
        settings: ClusterBackendSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            store,
            resources,
            settings,
            retry,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn resources(&self) -> &ClusterResources {
        &self.resources
    }

    pub fn staging_root(&self) -> Option<S3Uri> {
        self.settings
            .upload
            .then(|| S3Uri::new(self.resources.video_bucket.clone(), ""))
    }

    fn record_uri(&self, job_name: &str) -> S3Uri {
        S3Uri::new(
            self.resources.video_bucket.clone(),
            format!("{JOB_RECORD_PREFIX}/{}.json", sanitise_name(job_name, 200)),
        )
    }

    pub async fn job_name_in_use(&self, job_name: &str) -> Result<bool, BackendError> {
        let uri = self.record_uri(job_name);
        self.retry
            .run("head job record", || {
                with_timeout(
                    "head job record",
                    self.call_timeout,
                    self.store.object_exists(&uri),
                )
            })
            .await
    }

    fn message(&self, spec: &JobSpec, keys: &[String]) -> TaskMessage {
        let videos = match keys {
            [single] => TaskVideos::Single {
                video: single.clone(),
            },
            many => TaskVideos::Batch {
                videos: many.to_vec(),
            },
        };
        TaskMessage {
            videos,
            clean: if self.settings.clean { "True" } else { "False" }.to_string(),
            user_name: self.settings.user_name.clone(),
            job_name: spec.job_name.clone(),
            conf_thres: spec.conf_thres.to_string(),
            iou_thres: spec.iou_thres.to_string(),
            tracker: spec.tracker.to_string(),
            model_s3: spec.model.to_string(),
            model_size: spec.model_size.to_string(),
            config_s3: spec.track_config.as_ref().map(S3Uri::to_string),
            reid_weights: spec.reid_model.clone(),
        }
    }

    /// Splits the inputs into tasks of at most `batch_size` videos.
    pub fn plan(
        &self,
        spec: &JobSpec,
        nonce: &str,
        group_id: &str,
    ) -> Vec<(Vec<PathBuf>, ClusterTask)> {
        spec.inputs
            .chunks(self.settings.batch_size.max(1))
            .map(|chunk: &[VideoInput]| {
                let keys: Vec<String> = chunk.iter().map(VideoInput::object_key).collect();
                let task = ClusterTask {
                    task_id: task_id(&spec.job_name, &keys, nonce),
                    group_id: group_id.to_string(),
                    message: self.message(spec, &keys),
                };
                (chunk.iter().map(|v| v.path.clone()).collect(), task)
            })
            .collect()
    }

    pub async fn submit(&self, spec: &JobSpec) -> Result<SubmissionResult, BackendError> {
        let submitted_at = Utc::now();
        let nonce = Uuid::new_v4().to_string();
        let group_id = format!(
            "{}-{}",
            self.resources.cluster,
            submitted_at.format("%Y%m%dT%H%M%S%.3fZ")
        );
        let job_id = format!(
            "{}:{}",
            self.resources.cluster,
            sanitise_name(&spec.job_name, 200)
        );
        let plan = self.plan(spec, &nonce, &group_id);
        info!(
            job_id = %job_id,
            videos = spec.input_count(),
            tasks = plan.len(),
            concurrency = self.settings.concurrency,
            "[CLUSTER] Submitting tasks"
        );

        let outcomes: Mutex<BTreeMap<PathBuf, TaskOutcome>> = Mutex::new(BTreeMap::new());
        stream::iter(plan)
            .for_each_concurrent(self.settings.concurrency.max(1), |(paths, task)| {
                let outcomes = &outcomes;
                async move {
                    let sent = self
                        .retry
                        .run("send task", || {
                            with_timeout(
                                "send task",
                                self.call_timeout,
                                self.service.send_task(&self.resources, &task),
                            )
                        })
                        .await;
                    let outcome = match sent {
                        Ok(message_id) => {
                            debug!(
                                task_id = %task.task_id,
                                message_id = %message_id,
                                "[CLUSTER] Task queued"
                            );
                            TaskOutcome::Succeeded {
                                task_id: task.task_id.clone(),
                                message_id,
                            }
                        }
                        Err(cause) => {
                            error!(
                                task_id = %task.task_id,
                                videos = ?paths,
                                error = %cause,
                                "[CLUSTER] Task rejected"
                            );
                            TaskOutcome::Failed {
                                task_id: task.task_id.clone(),
                                cause,
                            }
                        }
                    };
                    let mut map = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
                    for path in paths {
                        map.insert(path, outcome.clone());
                    }
                }
            })
            .await;

        let tasks = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
        let succeeded = tasks.values().filter(|t| t.is_success()).count();
        let failed = tasks.len() - succeeded;
        let status = SubmissionStatus::from_counts(succeeded, failed);
        info!(succeeded, failed, status = ?status, "[CLUSTER] Submission finished");

        let result = SubmissionResult {
            backend: BackendKind::Cluster,
            job_id,
            submitted_at,
            status,
            tasks,
            name_reused: false,
        };
        if succeeded > 0 {
            self.write_record(spec, &result).await;
        }
        Ok(result)
    }

    /// Best effort: the tasks are already queued, so a failed write is only
    /// logged.
    async fn write_record(&self, spec: &JobSpec, result: &SubmissionResult) {
        let record = JobRecord {
            job_name: &spec.job_name,
            job_id: &result.job_id,
            cluster: &self.resources.cluster,
            submitted_at: result.submitted_at,
            tasks: result
                .tasks
                .iter()
                .map(|(path, outcome)| {
                    let state = match outcome {
                        TaskOutcome::Succeeded { .. } => "queued".to_string(),
                        TaskOutcome::Failed { cause, .. } => format!("failed: {cause}"),
                    };
                    (path.display().to_string(), state)
                })
                .collect(),
        };
        let uri = self.record_uri(&spec.job_name);
        let body = match serde_json::to_vec_pretty(&record) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "[CLUSTER] Job record could not be encoded");
                return;
            }
        };
        match self
            .retry
            .run("put job record", || {
                with_timeout(
                    "put job record",
                    self.call_timeout,
                    self.store.put_object(&uri, body.clone()),
                )
            })
            .await
        {
            Ok(()) => debug!(uri = %uri, "[CLUSTER] Wrote job record"),
            Err(e) => warn!(uri = %uri, error = %e, "[CLUSTER] Job record was not written"),
        }
    }

    pub async fn progress(&self) -> Result<ClusterProgress, BackendError> {
        self.retry
            .run("cluster progress", || {
                with_timeout(
                    "cluster progress",
                    self.call_timeout,
                    self.service.cluster_progress(&self.resources),
                )
            })
            .await
    }

    /// Status is cluster-wide: the work queue is shared by every job on the
    /// cluster, so `job_id` is only used for logging.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        let progress = self.progress().await?;
        debug!(job_id, ?progress, "[CLUSTER] Progress");
        Ok(status_from_progress(&progress))
    }
}

pub fn status_from_progress(progress: &ClusterProgress) -> JobStatus {
    if progress.is_idle() {
        return if progress.failed == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed {
                reason: format!("{} task(s) in the dead-letter queue", progress.failed),
            }
        };
    }
    if progress.running_tasks == 0 && progress.in_flight == 0 {
        return JobStatus::Pending;
    }
    JobStatus::Running {
        detail: format!(
            "{} queued, {} in flight, {} task(s) running",
            progress.queued, progress.in_flight, progress.running_tasks
        ),
    }
}
