//! Single managed processing job covering every video of a [`JobSpec`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::retry::{with_timeout, RetryPolicy, DEFAULT_CALL_TIMEOUT};
use super::{sanitise_name, BackendKind, JobStatus, SubmissionResult, SubmissionStatus};
use crate::config::{EffectiveConfig, TrackerSettings};
use crate::contract::{
    ObjectStore, ObjectTag, ProcessingJobRequest, ProcessingService, RemoteJobState,
};
use crate::error::{BackendError, ConfigError};
use crate::job::JobSpec;
use crate::location::S3Uri;
use crate::stage::staged_uri;

/// Processing jobs are stopped by the service after two days.
pub const MAX_RUNTIME_SECS: i32 = 172_800;

/// The service limits job names to 63 characters.
const MAX_JOB_NAME_LEN: usize = 63;
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const TIMESTAMP_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SingleJobSettings {
    pub account: String,
    pub region: String,
    pub role_arn: String,
    pub instance_type: String,
    pub images: TrackerSettings,
    pub track_configs: TrackerSettings,
    pub input: S3Uri,
    pub output: S3Uri,
    pub save_video: bool,
    pub tags: Vec<ObjectTag>,
}

fn required_uri(
    value: Option<&str>,
    field: &'static str,
    config: &EffectiveConfig,
) -> Result<S3Uri, ConfigError> {
    let raw = value.ok_or_else(|| ConfigError::MissingField {
        field,
        profile: config.profile.clone(),
    })?;
    S3Uri::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
        field,
        reason: format!("'{raw}' is not an s3:// URI"),
    })
}

impl SingleJobSettings {
    pub fn from_config(
        config: &EffectiveConfig,
        account: &str,
        save_video: bool,
        tags: Vec<ObjectTag>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            account: account.to_string(),
            region: config.region.clone(),
            role_arn: config.role.as_str().to_string(),
            instance_type: config.instance_type.clone(),
            images: config.images.clone(),
            track_configs: config.track_configs.clone(),
            input: required_uri(config.input_s3.as_deref(), "input_s3", config)?,
            output: required_uri(config.output_s3.as_deref(), "output_s3", config)?,
            save_video,
            tags,
        })
    }
}

/// Job-name stem shared by every submission of `job_name`.
fn name_stem(job_name: &str) -> String {
    sanitise_name(job_name, MAX_JOB_NAME_LEN - TIMESTAMP_LEN - 1)
}

/// Service job name: sanitised stem plus a UTC timestamp suffix.
pub fn processing_job_name(job_name: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", name_stem(job_name), now.format(TIMESTAMP_FORMAT))
}

/// Scratch volume: 1.25x the input size, or 2x when the annotated video is
/// written back, never less than 1 GB.
pub fn volume_size_gb(total_bytes: u64, save_video: bool) -> i32 {
    let factor = if save_video { 2.0 } else { 1.25 };
    let gb = total_bytes as f64 / 1_000_000_000.0;
    ((factor * gb).ceil() as i32).max(1)
}

/// Arguments for the tracking container. Without an explicit tracker config
/// the configured one for the tracker is passed.
pub fn container_arguments(spec: &JobSpec, settings: &SingleJobSettings) -> Vec<String> {
    let track_config = match &spec.track_config {
        Some(uri) => uri.to_string(),
        None => settings.track_configs.for_tracker(spec.tracker).to_string(),
    };
    let mut args = vec![
        "dettrack".to_string(),
        format!("--conf-thres={}", spec.conf_thres),
        format!("--iou-thres={}", spec.iou_thres),
        format!("--model-size={}", spec.model_size),
        format!("--model-s3={}", spec.model),
        format!("--config-s3={track_config}"),
    ];
    if let Some(url) = &spec.reid_model {
        args.push(format!("--reid-weights={url}"));
    }
    if settings.save_video {
        args.push("--save-vid".to_string());
    }
    args
}

/// Manifest body: a common prefix entry followed by one key per video.
fn manifest_body(spec: &JobSpec, input: &S3Uri) -> Value {
    let mut entries = vec![json!({ "prefix": format!("s3://{}/", input.bucket()) })];
    entries.extend(
        spec.inputs
            .iter()
            .map(|v| Value::String(staged_uri(input, v).key().to_string())),
    );
    Value::Array(entries)
}

async fn total_input_bytes(spec: &JobSpec) -> u64 {
    let mut total = 0;
    for video in &spec.inputs {
        match tokio::fs::metadata(&video.path).await {
            Ok(meta) => total += meta.len(),
            Err(e) => {
                debug!(video = %video.path.display(), error = %e, "Size unknown, not counted")
            }
        }
    }
    total
}

pub struct SingleJobBackend {
    processing: Arc<dyn ProcessingService>,
    store: Arc<dyn ObjectStore>,
    settings: SingleJobSettings,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl SingleJobBackend {
    pub fn new(
        processing: Arc<dyn ProcessingService>,
        store: Arc<dyn ObjectStore>,
        settings: SingleJobSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            processing,
            store,
            settings,
            retry,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bounds every individual service call.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn settings(&self) -> &SingleJobSettings {
        &self.settings
    }

    pub fn staging_root(&self) -> S3Uri {
        self.settings.input.clone()
    }

    pub fn image_uri(&self, spec: &JobSpec) -> String {
        format!(
            "{}.dkr.ecr.{}.amazonaws.com/{}",
            self.settings.account,
            self.settings.region,
            self.settings.images.for_tracker(spec.tracker)
        )
    }

    /// Translates `spec` into the service request, without any network call.
    pub async fn request_for(&self, spec: &JobSpec, now: DateTime<Utc>) -> ProcessingJobRequest {
        let job_name = processing_job_name(&spec.job_name, now);
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        ProcessingJobRequest {
            image_uri: self.image_uri(spec),
            role_arn: self.settings.role_arn.clone(),
            instance_type: self.settings.instance_type.clone(),
            volume_size_gb: volume_size_gb(total_input_bytes(spec).await, self.settings.save_video),
            max_runtime_secs: MAX_RUNTIME_SECS,
            arguments: container_arguments(spec, &self.settings),
            input_manifest: self
                .settings
                .input
                .join(&format!("manifests/{job_name}.json")),
            output: self.settings.output.join(&stamp),
            tags: self.settings.tags.clone(),
            job_name,
        }
    }

    pub async fn job_name_in_use(&self, job_name: &str) -> Result<bool, BackendError> {
        let stem = name_stem(job_name);
        let existing = self
            .retry
            .run("list processing jobs", || {
                with_timeout(
                    "list processing jobs",
                    self.call_timeout,
                    self.processing.list_processing_jobs(&stem),
                )
            })
            .await?;
        let prefix = format!("{stem}-");
        Ok(existing.iter().any(|name| {
            name.strip_prefix(&prefix)
                .is_some_and(|rest| rest.len() == TIMESTAMP_LEN)
        }))
    }

    pub async fn submit(&self, spec: &JobSpec) -> Result<SubmissionResult, BackendError> {
        let submitted_at = Utc::now();
        let request = self.request_for(spec, submitted_at).await;
        info!(
            job_name = %request.job_name,
            image = %request.image_uri,
            inputs = spec.input_count(),
            volume_gb = request.volume_size_gb,
            "[SINGLE] Submitting processing job"
        );

        let manifest = serde_json::to_vec_pretty(&manifest_body(spec, &self.settings.input))
            .map_err(|e| BackendError::Rejected(format!("manifest could not be encoded: {e}")))?;
        self.retry
            .run("put manifest", || {
                with_timeout(
                    "put manifest",
                    self.call_timeout,
                    self.store.put_object(&request.input_manifest, manifest.clone()),
                )
            })
            .await?;
        debug!(manifest = %request.input_manifest, "[SINGLE] Wrote input manifest");

        let job_id = self
            .retry
            .run("create processing job", || {
                with_timeout(
                    "create processing job",
                    self.call_timeout,
                    self.processing.create_processing_job(&request),
                )
            })
            .await
            .map_err(|e| {
                error!(
                    job_name = %request.job_name,
                    error = %e,
                    "[SINGLE] Processing job was not created"
                );
                e
            })?;

        info!(job_id = %job_id, "[SINGLE] Processing job created");
        Ok(SubmissionResult {
            backend: BackendKind::SingleJob,
            job_id,
            submitted_at,
            status: SubmissionStatus::Submitted,
            tasks: Default::default(),
            name_reused: false,
        })
    }

    /// `job_id` may be the job ARN or its name; the name is the last segment.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        let name = job_id.rsplit('/').next().unwrap_or(job_id);
        let description = self
            .retry
            .run("describe processing job", || {
                with_timeout(
                    "describe processing job",
                    self.call_timeout,
                    self.processing.describe_processing_job(name),
                )
            })
            .await?;
        let status = match description.state {
            RemoteJobState::InProgress => JobStatus::Running {
                detail: "in progress".to_string(),
            },
            RemoteJobState::Stopping => JobStatus::Running {
                detail: "stopping".to_string(),
            },
            RemoteJobState::Completed => JobStatus::Completed,
            RemoteJobState::Failed => JobStatus::Failed {
                reason: description
                    .failure_reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            },
            RemoteJobState::Stopped => JobStatus::Failed {
                reason: "stopped before completion".to_string(),
            },
        };
        if let JobStatus::Failed { reason } = &status {
            warn!(job = name, reason = %reason, "[SINGLE] Processing job failed");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{MockObjectStore, MockProcessingService, ProcessingJobDescription};
    use crate::enumerate::VideoInput;
    use crate::job::{tests::config, Tracker};
    use chrono::TimeZone;

    fn settings(save_video: bool) -> SingleJobSettings {
        let mut config = config();
        config.input_s3 = Some("s3://902005-video-in/dive".into());
        config.output_s3 = Some("s3://902005-tracks-out".into());
        SingleJobSettings::from_config(&config, "872338704006", save_video, vec![]).unwrap()
    }

    fn spec() -> JobSpec {
        JobSpec {
            job_name: "Dive 1423".into(),
            inputs: vec![
                VideoInput::new("/Volumes/M3/D1.mov"),
                VideoInput::new("/Volumes/M3/D2.mov"),
            ],
            tracker: Tracker::DeepSort,
            model: S3Uri::parse("s3://902005-public/models/m.tar.gz").unwrap(),
            conf_thres: 0.25,
            iou_thres: 0.5,
            exclude: vec![],
            model_size: 640,
            track_config: None,
            reid_model: None,
        }
    }

    fn backend(processing: MockProcessingService, store: MockObjectStore) -> SingleJobBackend {
        SingleJobBackend::new(
            Arc::new(processing),
            Arc::new(store),
            settings(false),
            RetryPolicy::immediate(3),
        )
    }

    #[test]
    fn job_name_is_sanitised_and_bounded() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            processing_job_name("Dive 1423 (benthic)", now),
            "Dive-1423-benthic-20240102T030405Z"
        );
        let long = processing_job_name(&"x".repeat(200), now);
        assert_eq!(long.len(), MAX_JOB_NAME_LEN);
        assert!(long.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn volume_size_scales_with_input() {
        assert_eq!(volume_size_gb(0, false), 1);
        assert_eq!(volume_size_gb(8_000_000_000, false), 10);
        assert_eq!(volume_size_gb(8_000_000_000, true), 16);
    }

    #[test]
    fn missing_output_prefix_is_a_missing_field() {
        let mut config = config();
        config.input_s3 = Some("s3://in".into());
        let err = SingleJobSettings::from_config(&config, "1", false, vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "output_s3", .. }));
    }

    #[test]
    fn arguments_select_the_tracker_config() {
        let args = container_arguments(&spec(), &settings(true));
        assert_eq!(args[0], "dettrack");
        assert!(args.contains(&"--conf-thres=0.25".to_string()));
        assert!(args.contains(&"--model-s3=s3://902005-public/models/m.tar.gz".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("--config-s3=") && a.ends_with("deep_sort.yaml")));
        assert!(args.contains(&"--model-size=640".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--reid-weights=")));
        assert_eq!(args.last().map(String::as_str), Some("--save-vid"));
    }

    #[test]
    fn explicit_tracking_options_reach_the_container() {
        let spec = JobSpec {
            tracker: Tracker::StrongSort,
            model_size: 1280,
            track_config: S3Uri::parse("s3://902005-public/config/strong_sort_benthic.yaml"),
            reid_model: Some("https://example.org/osnet_x0_25.pt".into()),
            ..spec()
        };
        let args = container_arguments(&spec, &settings(false));
        assert!(args.contains(&"--model-size=1280".to_string()));
        assert!(args.contains(
            &"--config-s3=s3://902005-public/config/strong_sort_benthic.yaml".to_string()
        ));
        assert!(args.contains(&"--reid-weights=https://example.org/osnet_x0_25.pt".to_string()));
        assert!(!args.contains(&"--save-vid".to_string()));
    }

    #[test]
    fn manifest_lists_every_staged_key() {
        let body = manifest_body(&spec(), &S3Uri::parse("s3://902005-video-in/dive").unwrap());
        assert_eq!(
            body,
            json!([{"prefix": "s3://902005-video-in/"}, "dive/M3/D1.mov", "dive/M3/D2.mov"])
        );
    }

    #[tokio::test]
    async fn submit_writes_manifest_then_creates_one_job() {
        let mut store = MockObjectStore::new();
        store
            .expect_put_object()
            .withf(|uri, _| {
                uri.bucket() == "902005-video-in"
                    && uri.key().starts_with("dive/manifests/Dive-1423-")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let mut processing = MockProcessingService::new();
        processing
            .expect_create_processing_job()
            .withf(|req| {
                req.image_uri
                    == "872338704006.dkr.ecr.us-west-2.amazonaws.com/mbari/deepsort-yolov5:1.3.5"
                    && req.max_runtime_secs == MAX_RUNTIME_SECS
                    && req.role_arn == "arn:aws:iam::872338704006:role/DeepSeaAI"
            })
            .times(1)
            .returning(|req| {
                Ok(format!(
                    "arn:aws:sagemaker:us-west-2:872338704006:processing-job/{}",
                    req.job_name
                ))
            });

        let result = backend(processing, store).submit(&spec()).await.unwrap();
        assert_eq!(result.status, SubmissionStatus::Submitted);
        assert_eq!(result.backend, BackendKind::SingleJob);
        assert!(result.job_id.contains("processing-job/Dive-1423-"));
        assert!(result.tasks.is_empty());
    }

    #[tokio::test]
    async fn transient_create_failures_are_retried() {
        let mut store = MockObjectStore::new();
        store.expect_put_object().returning(|_, _| Ok(()));
        let mut processing = MockProcessingService::new();
        let mut seq = mockall::Sequence::new();
        processing
            .expect_create_processing_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(BackendError::TransientNetwork("connection reset".into())));
        processing
            .expect_create_processing_job()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("arn:job".into()));

        let result = backend(processing, store).submit(&spec()).await.unwrap();
        assert_eq!(result.job_id, "arn:job");
    }

    #[tokio::test]
    async fn quota_errors_are_not_retried() {
        let mut store = MockObjectStore::new();
        store.expect_put_object().returning(|_, _| Ok(()));
        let mut processing = MockProcessingService::new();
        processing
            .expect_create_processing_job()
            .times(1)
            .returning(|_| Err(BackendError::QuotaExceeded("ml.g4dn.xlarge".into())));

        let err = backend(processing, store).submit(&spec()).await.unwrap_err();
        assert_eq!(err, BackendError::QuotaExceeded("ml.g4dn.xlarge".into()));
    }

    /// A service that accepts calls and never answers.
    struct Unresponsive;

    #[async_trait::async_trait]
    impl ProcessingService for Unresponsive {
        async fn create_processing_job(
            &self,
            _request: &ProcessingJobRequest,
        ) -> Result<String, BackendError> {
            std::future::pending().await
        }

        async fn describe_processing_job(
            &self,
            _job_name: &str,
        ) -> Result<ProcessingJobDescription, BackendError> {
            std::future::pending().await
        }

        async fn list_processing_jobs(&self, _name: &str) -> Result<Vec<String>, BackendError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_calls_time_out() {
        let mut store = MockObjectStore::new();
        store.expect_put_object().returning(|_, _| Ok(()));
        let backend = SingleJobBackend::new(
            Arc::new(Unresponsive),
            Arc::new(store),
            settings(false),
            RetryPolicy::none(),
        )
        .with_call_timeout(Duration::from_secs(5));

        let timeout = |operation: &str| BackendError::Timeout {
            operation: operation.to_string(),
            after: Duration::from_secs(5),
        };
        let err = backend.job_name_in_use("Dive 1423").await.unwrap_err();
        assert_eq!(err, timeout("list processing jobs"));
        let err = backend.submit(&spec()).await.unwrap_err();
        assert_eq!(err, timeout("create processing job"));
        let err = backend.status("Dive-1423-20240101T000000Z").await.unwrap_err();
        assert_eq!(err, timeout("describe processing job"));
    }

    #[tokio::test]
    async fn name_reuse_ignores_longer_stems() {
        let mut processing = MockProcessingService::new();
        processing
            .expect_list_processing_jobs()
            .returning(|_| Ok(vec!["Dive-14230-20240101T000000Z".into()]));
        let b = backend(processing, MockObjectStore::new());
        assert!(!b.job_name_in_use("Dive 1423").await.unwrap());

        let mut processing = MockProcessingService::new();
        processing
            .expect_list_processing_jobs()
            .returning(|_| Ok(vec!["Dive-1423-20240101T000000Z".into()]));
        let b = backend(processing, MockObjectStore::new());
        assert!(b.job_name_in_use("Dive 1423").await.unwrap());
    }

    #[tokio::test]
    async fn failed_job_reports_its_reason() {
        let mut processing = MockProcessingService::new();
        processing
            .expect_describe_processing_job()
            .withf(|name| name == "Dive-1423-20240101T000000Z")
            .returning(|name| {
                Ok(ProcessingJobDescription {
                    job_id: name.to_string(),
                    state: RemoteJobState::Failed,
                    failure_reason: Some("ClientError: no space left".into()),
                })
            });
        let status = backend(processing, MockObjectStore::new())
            .status("arn:aws:sagemaker:us-west-2:1:processing-job/Dive-1423-20240101T000000Z")
            .await
            .unwrap();
        assert_eq!(
            status,
            JobStatus::Failed {
                reason: "ClientError: no space left".into()
            }
        );
    }
}
