//! Submission pipeline: resolve → enumerate → build → (stage) → submit.
//! Also the standalone upload that stages a directory into a bucket.
//!
//! The orchestrator owns no cloud logic of its own; it sequences the
//! resolvers, the builder and a [`Backend`], and turns whatever happens into
//! either a [`SubmissionReport`] or a [`SubmissionError`] naming the stage
//! that failed.
//!
//! Every check that can fail without a network call (config, inputs,
//! thresholds, tracker, model reference) runs before the first network call.
//! The lookups that follow building are read-only: caller identity and
//! cluster discovery. Their failures are reported as resolving failures.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::retry::{with_timeout, RetryPolicy, DEFAULT_CALL_TIMEOUT};
use crate::backend::{
    Backend, BackendKind, ClusterBackend, ClusterBackendSettings, SingleJobBackend,
    SingleJobSettings, SubmissionResult, SubmissionStatus,
};
use crate::config::{self, CliOverrides, EffectiveConfig, EnvVars, ProfileDocument};
use crate::contract::{
    CallerIdentity, ClusterService, IdentityProvider, ObjectStore, ProcessingService,
};
use crate::enumerate::{self, VideoInput};
use crate::error::{BackendError, BuildError, ConfigError, EnumerationError};
use crate::job::{self, JobRequest, JobSpec};
use crate::location::S3Uri;
use crate::stage::{stage_inputs, StagingReport};
use crate::tags::build_tags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Enumerating,
    Building,
    Submitting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Enumerating => "enumerating",
            Stage::Building => "building",
            Stage::Submitting => "submitting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Error)]
pub enum StageCause {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Error)]
#[error("{stage} failed: {cause}")]
pub struct SubmissionError {
    pub stage: Stage,
    #[source]
    pub cause: StageCause,
}

impl SubmissionError {
    fn at(stage: Stage) -> impl FnOnce(StageCause) -> Self {
        move |cause| Self { stage, cause }
    }
}

fn fail<E: Into<StageCause>>(stage: Stage) -> impl FnOnce(E) -> SubmissionError {
    move |e| {
        let err = SubmissionError::at(stage)(e.into());
        error!(stage = %err.stage, error = %err.cause, "[SUBMIT][ERROR] Stage failed");
        err
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    SingleJob {
        save_video: bool,
    },
    Cluster {
        cluster: String,
        upload: bool,
        clean: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    pub job_name: String,
    pub input: PathBuf,
    pub exclude: Vec<String>,
    pub backend: BackendChoice,
    pub overrides: CliOverrides,
    pub dry_run: bool,
}

/// The cloud capabilities a submission may need.
#[derive(Clone)]
pub struct CloudClients {
    pub identity: Arc<dyn IdentityProvider>,
    pub store: Arc<dyn ObjectStore>,
    pub processing: Arc<dyn ProcessingService>,
    pub cluster: Arc<dyn ClusterService>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReport {
    pub job_name: String,
    pub backend: BackendKind,
    pub outcome: Outcome,
    pub dry_run: bool,
    pub inputs: Vec<VideoInput>,
    pub staging: Option<StagingReport>,
    pub result: Option<SubmissionResult>,
}

/// Stage a local directory into a bucket without submitting anything.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub input: PathBuf,
    pub exclude: Vec<String>,
    /// Bucket name or `s3://bucket/prefix`.
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub destination: S3Uri,
    pub bucket_created: bool,
    pub inputs: Vec<VideoInput>,
    pub staging: StagingReport,
}

impl UploadReport {
    pub fn summary(&self) -> String {
        format!(
            "uploaded {} video(s) to {}, {} already present{}",
            self.staging.uploaded.len(),
            self.destination,
            self.staging.skipped.len(),
            if self.bucket_created { " (bucket created)" } else { "" }
        )
    }
}

fn destination(raw: &str) -> Result<S3Uri, ConfigError> {
    let raw = raw.trim();
    let uri = if raw.starts_with("s3://") {
        S3Uri::parse(raw)
    } else {
        S3Uri::parse(&format!("s3://{raw}"))
    };
    uri.ok_or_else(|| ConfigError::InvalidValue {
        field: "s3",
        reason: format!("'{raw}' is not a bucket name or s3:// URI"),
    })
}

/// A finished submission together with the backend it went to, for polling.
pub struct Submission {
    pub report: SubmissionReport,
    pub backend: Backend,
}

pub struct SubmissionOrchestrator {
    clients: CloudClients,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl SubmissionOrchestrator {
    pub fn new(clients: CloudClients) -> Self {
        Self {
            clients,
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub async fn caller_identity(&self) -> Result<CallerIdentity, BackendError> {
        self.retry
            .run("caller identity", || {
                with_timeout(
                    "caller identity",
                    self.call_timeout,
                    self.clients.identity.caller_identity(),
                )
            })
            .await
    }

    /// Builds the backend for `choice`. Only read-only calls are made.
    pub async fn backend_for(
        &self,
        choice: &BackendChoice,
        config: &EffectiveConfig,
        identity: &CallerIdentity,
        description: &str,
    ) -> Result<Backend, StageCause> {
        let tags = build_tags(&config.tags, &identity.user_name, description, Utc::now())?;
        match choice {
            BackendChoice::SingleJob { save_video } => {
                let settings =
                    SingleJobSettings::from_config(config, &identity.account, *save_video, tags)?;
                let backend = SingleJobBackend::new(
                    self.clients.processing.clone(),
                    self.clients.store.clone(),
                    settings,
                    self.retry,
                );
                Ok(Backend::SingleJob(backend.with_call_timeout(self.call_timeout)))
            }
            BackendChoice::Cluster {
                cluster,
                upload,
                clean,
            } => {
                let settings = ClusterBackendSettings {
                    batch_size: config.cluster.batch_size,
                    concurrency: config.cluster.concurrency,
                    clean: *clean,
                    upload: *upload,
                    user_name: identity.user_name.clone(),
                };
                let backend = ClusterBackend::connect(
                    self.clients.cluster.clone(),
                    self.clients.store.clone(),
                    cluster,
                    settings,
                    self.retry,
                    self.call_timeout,
                )
                .await?;
                Ok(Backend::Cluster(backend))
            }
        }
    }

    /// Runs one submission end to end.
    pub async fn submit(
        &self,
        request: &SubmissionRequest,
        document: Option<&ProfileDocument>,
        env: &EnvVars,
    ) -> Result<Submission, SubmissionError> {
        info!(
            job_name = %request.job_name,
            input = %request.input.display(),
            "[SUBMIT] Starting submission"
        );

        // Resolving
        let config = config::resolve(&request.overrides, document, env)
            .map_err(fail(Stage::Resolving))?;

        // Enumerating
        let inputs = enumerate::enumerate(&request.input, &request.exclude)
            .map_err(fail(Stage::Enumerating))?;

        // Building
        let job_request = JobRequest {
            job_name: request.job_name.clone(),
            exclude: request.exclude.clone(),
            config_s3: request.overrides.config_s3.clone(),
            reid_model_url: request.overrides.reid_model_url.clone(),
            ..JobRequest::default()
        };
        let spec = job::build(inputs, &config, &job_request).map_err(fail(Stage::Building))?;

        // Cloud lookups belong to resolving but wait until every local check
        // has passed.
        let identity = self.caller_identity().await.map_err(fail(Stage::Resolving))?;
        info!(
            account = %identity.account,
            user = %identity.user_name,
            "[SUBMIT] Caller identity"
        );
        let backend = self
            .backend_for(&request.backend, &config, &identity, &request.job_name)
            .await
            .map_err(fail(Stage::Resolving))?;

        if request.dry_run {
            return Ok(self.dry_run(spec, backend));
        }

        // Submitting
        let name_reused = match backend.job_name_in_use(&spec.job_name).await {
            Ok(true) => {
                warn!(
                    job_name = %spec.job_name,
                    "[SUBMIT] Job name was used before; submitting again"
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "[SUBMIT] Could not check for earlier jobs with this name");
                false
            }
        };

        let staging = match backend.staging_root() {
            Some(root) => {
                let tags =
                    build_tags(&config.tags, &identity.user_name, &spec.job_name, Utc::now())
                        .map_err(fail(Stage::Submitting))?;
                Some(
                    stage_inputs(
                        self.clients.store.as_ref(),
                        &spec.inputs,
                        &root,
                        &tags,
                        &self.retry,
                        self.call_timeout,
                    )
                    .await
                    .map_err(fail(Stage::Submitting))?,
                )
            }
            None => None,
        };

        let mut result = backend.submit(&spec).await.map_err(fail(Stage::Submitting))?;
        result.name_reused = name_reused;

        let outcome = match result.status {
            SubmissionStatus::Submitted => Outcome::Succeeded,
            SubmissionStatus::PartiallyFailed => Outcome::PartiallyFailed,
            SubmissionStatus::Rejected => {
                let cause = result
                    .first_failure()
                    .cloned()
                    .unwrap_or_else(|| BackendError::Rejected("every task was rejected".into()));
                return Err(fail(Stage::Submitting)(cause));
            }
        };

        info!(
            job_id = %result.job_id,
            backend = %result.backend,
            outcome = ?outcome,
            "[SUBMIT] Submission finished"
        );
        Ok(Submission {
            report: SubmissionReport {
                job_name: spec.job_name,
                backend: backend.kind(),
                outcome,
                dry_run: false,
                inputs: spec.inputs,
                staging,
                result: Some(result),
            },
            backend,
        })
    }

    /// Stages `request.input` below the destination, creating the bucket
    /// with the document's tags when it does not exist yet.
    pub async fn upload(
        &self,
        request: &UploadRequest,
        document: Option<&ProfileDocument>,
    ) -> Result<UploadReport, SubmissionError> {
        let root = destination(&request.destination).map_err(fail(Stage::Resolving))?;
        info!(
            input = %request.input.display(),
            destination = %root,
            "[SUBMIT] Starting upload"
        );

        let inputs = enumerate::enumerate(&request.input, &request.exclude)
            .map_err(fail(Stage::Enumerating))?;
        if inputs.is_empty() {
            return Err(fail(Stage::Building)(BuildError::EmptyInputSet));
        }

        let identity = self.caller_identity().await.map_err(fail(Stage::Resolving))?;
        let settings = document.map(|d| d.tags.clone()).unwrap_or_default();
        let description = format!("Uploaded {} to {}", request.input.display(), root);
        let tags = build_tags(&settings, &identity.user_name, &description, Utc::now())
            .map_err(fail(Stage::Resolving))?;

        let store = self.clients.store.as_ref();
        let bucket_created = self
            .retry
            .run("ensure bucket", || {
                with_timeout(
                    "ensure bucket",
                    self.call_timeout,
                    store.ensure_bucket(root.bucket(), &tags),
                )
            })
            .await
            .map_err(fail(Stage::Submitting))?;
        if bucket_created {
            info!(bucket = root.bucket(), "[SUBMIT] Created bucket");
        }

        let staging = stage_inputs(store, &inputs, &root, &tags, &self.retry, self.call_timeout)
            .await
            .map_err(fail(Stage::Submitting))?;
        Ok(UploadReport {
            destination: root,
            bucket_created,
            inputs,
            staging,
        })
    }

    fn dry_run(&self, spec: JobSpec, backend: Backend) -> Submission {
        for video in &spec.inputs {
            info!(
                video = %video.path.display(),
                key = %video.object_key(),
                "[SUBMIT][DRY-RUN] Would submit"
            );
        }
        info!(
            job_name = %spec.job_name,
            backend = %backend.kind(),
            videos = spec.input_count(),
            "[SUBMIT][DRY-RUN] Nothing submitted"
        );
        Submission {
            report: SubmissionReport {
                job_name: spec.job_name,
                backend: backend.kind(),
                outcome: Outcome::Succeeded,
                dry_run: true,
                inputs: spec.inputs,
                staging: None,
                result: None,
            },
            backend,
        }
    }
}

impl SubmissionReport {
    /// Human-readable summary printed by the CLI.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{} job '{}': {:?} ({} video(s){})",
            self.backend,
            self.job_name,
            self.outcome,
            self.inputs.len(),
            if self.dry_run { ", dry run" } else { "" }
        )];
        if let Some(staging) = &self.staging {
            lines.push(format!(
                "  staged: {} uploaded, {} already present",
                staging.uploaded.len(),
                staging.skipped.len()
            ));
        }
        if let Some(result) = &self.result {
            lines.push(format!("  job id: {}", result.job_id));
            if result.name_reused {
                lines.push("  warning: this job name was used before".to_string());
            }
            for (path, outcome) in &result.tasks {
                if let crate::backend::TaskOutcome::Failed { cause, .. } = outcome {
                    lines.push(format!("  [ERROR] {}: {}", path.display(), cause));
                }
            }
        }
        lines.join("\n")
    }
}
