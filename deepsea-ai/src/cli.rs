/// # deepsea-ai CLI
///
/// Command parsing and the async entrypoints behind the `deepsea-ai` binary.
/// Everything that decides *what* gets submitted lives in `deepsea-ai-core`;
/// this module only maps flags onto a [`SubmissionRequest`], wires the AWS
/// clients in, and turns outcomes into exit codes.
///
/// - [`run`] is what `main` calls: it loads the config document, connects to
///   AWS in the resolved region, then hands over to [`execute`].
/// - [`execute`] takes already-built [`CloudClients`], so integration tests
///   drive the full command flow against mocks.
/// - `upload` only stages videos into a bucket; nothing is submitted.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use deepsea_ai_core::backend::{
    Backend, ClusterBackend, ClusterBackendSettings, JobStatus, RetryPolicy, DEFAULT_CALL_TIMEOUT,
};
use deepsea_ai_core::config::{preview_region, CliOverrides, EnvVars, ProfileDocument};
use deepsea_ai_core::orchestrator::{
    BackendChoice, CloudClients, Outcome, Submission, SubmissionOrchestrator, SubmissionRequest,
    UploadRequest,
};
use deepsea_ai_core::poll::{poll_until_settled, PollOutcome, PollPolicy};
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::aws::AwsCloud;
use crate::load_config::{load_optional, CONFIG_ENV_VAR};

/// Two days, the longest a single processing job may run.
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 172_800;

/// CLI for deepsea-ai: bulk detection and tracking of deep-sea video on AWS.
#[derive(Parser, Debug)]
#[clap(
    name = "deepsea-ai",
    version,
    about = "Process deep-sea video in bulk with detection and tracking models on AWS"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Process videos with one SageMaker processing job
    Process {
        /// Name of the job, e.g. "Dive 1423 benthic"
        #[clap(short = 'j', long = "job")]
        job: String,
        /// A video file or a directory of videos
        #[clap(short = 'i', long)]
        input: PathBuf,
        /// Skip videos whose name contains this text (repeatable)
        #[clap(short = 'e', long)]
        exclude: Vec<String>,
        /// strongsort or deepsort
        #[clap(long)]
        tracker: Option<String>,
        /// Detection model archive, s3://bucket/key.tar.gz
        #[clap(short = 'm', long = "model-s3")]
        model_s3: Option<String>,
        #[clap(long)]
        conf_thres: Option<f64>,
        #[clap(long)]
        iou_thres: Option<f64>,
        /// Bucket prefix videos are staged to
        #[clap(long)]
        input_s3: Option<String>,
        /// Bucket prefix results are written to
        #[clap(long)]
        output_s3: Option<String>,
        #[clap(long)]
        instance_type: Option<String>,
        /// Detector input size in pixels, a multiple of 32
        #[clap(long)]
        model_size: Option<u32>,
        /// Tracker configuration, s3://bucket/key.yaml
        #[clap(short = 'c', long)]
        config_s3: Option<String>,
        /// Re-identification weights for strongsort
        #[clap(long)]
        reid_model_url: Option<String>,
        /// Also write annotated video
        #[clap(short = 's', long)]
        save_vid: bool,
        /// Path to the YAML config profile document
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        profile: Option<String>,
        #[clap(long)]
        region: Option<String>,
        /// Wait for the job to finish
        #[clap(long)]
        wait: bool,
        #[clap(long, default_value_t = DEFAULT_POLL_TIMEOUT_SECS)]
        poll_timeout_secs: u64,
        /// Resolve and validate everything, submit nothing
        #[clap(long)]
        dry_run: bool,
    },
    /// Process videos on an ECS cluster, one queued task per video batch
    Ecsprocess {
        #[clap(short = 'j', long = "job")]
        job: String,
        #[clap(short = 'i', long)]
        input: PathBuf,
        #[clap(short = 'e', long)]
        exclude: Vec<String>,
        /// Name of the cluster stack, e.g. benthic33
        #[clap(short = 'c', long)]
        cluster: String,
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        profile: Option<String>,
        /// Upload videos to the cluster's video bucket first
        #[clap(short = 'u', long)]
        upload: bool,
        /// Delete each video from the bucket once tracked
        #[clap(long)]
        clean: bool,
        #[clap(long)]
        conf_thres: Option<f64>,
        #[clap(long)]
        iou_thres: Option<f64>,
        #[clap(long)]
        tracker: Option<String>,
        #[clap(long)]
        model_size: Option<u32>,
        /// Tracker configuration, s3://bucket/key.yaml
        #[clap(long)]
        config_s3: Option<String>,
        #[clap(long)]
        reid_model_url: Option<String>,
        /// Videos per queued task
        #[clap(long)]
        batch_size: Option<usize>,
        /// Tasks sent in parallel
        #[clap(long)]
        concurrency: Option<usize>,
        /// Wait until the cluster drains
        #[clap(long)]
        wait: bool,
        #[clap(long, default_value_t = DEFAULT_POLL_TIMEOUT_SECS)]
        poll_timeout_secs: u64,
        #[clap(long)]
        dry_run: bool,
    },
    /// Report cluster progress until its queue is drained
    Monitor {
        #[clap(short = 'c', long)]
        cluster: String,
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        profile: Option<String>,
        /// Seconds between status checks
        #[clap(long, default_value_t = 60)]
        update_period: u64,
        #[clap(long, default_value_t = DEFAULT_POLL_TIMEOUT_SECS)]
        poll_timeout_secs: u64,
    },
    /// Upload videos to a bucket, creating and tagging it if needed
    Upload {
        #[clap(short = 'i', long)]
        input: PathBuf,
        /// Bucket name or s3://bucket/prefix
        #[clap(long = "s3")]
        s3: String,
        #[clap(short = 'e', long)]
        exclude: Vec<String>,
        #[clap(long)]
        config: Option<PathBuf>,
        #[clap(long)]
        profile: Option<String>,
        #[clap(long)]
        region: Option<String>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Process { .. } => "process",
            Commands::Ecsprocess { .. } => "ecsprocess",
            Commands::Monitor { .. } => "monitor",
            Commands::Upload { .. } => "upload",
        }
    }

    fn config_flag(&self) -> Option<&Path> {
        match self {
            Commands::Process { config, .. }
            | Commands::Ecsprocess { config, .. }
            | Commands::Monitor { config, .. }
            | Commands::Upload { config, .. } => config.as_deref(),
        }
    }

    /// Flags that take part in config resolution.
    pub fn overrides(&self) -> CliOverrides {
        match self {
            Commands::Process {
                tracker,
                model_s3,
                conf_thres,
                iou_thres,
                input_s3,
                output_s3,
                instance_type,
                model_size,
                config_s3,
                reid_model_url,
                profile,
                region,
                ..
            } => CliOverrides {
                profile: profile.clone(),
                region: region.clone(),
                model: model_s3.clone(),
                tracker: tracker.clone(),
                conf_thres: *conf_thres,
                iou_thres: *iou_thres,
                instance_type: instance_type.clone(),
                input_s3: input_s3.clone(),
                output_s3: output_s3.clone(),
                model_size: *model_size,
                config_s3: config_s3.clone(),
                reid_model_url: reid_model_url.clone(),
                ..CliOverrides::default()
            },
            Commands::Ecsprocess {
                profile,
                conf_thres,
                iou_thres,
                tracker,
                model_size,
                config_s3,
                reid_model_url,
                batch_size,
                concurrency,
                ..
            } => CliOverrides {
                profile: profile.clone(),
                tracker: tracker.clone(),
                conf_thres: *conf_thres,
                iou_thres: *iou_thres,
                model_size: *model_size,
                config_s3: config_s3.clone(),
                reid_model_url: reid_model_url.clone(),
                batch_size: *batch_size,
                concurrency: *concurrency,
                ..CliOverrides::default()
            },
            Commands::Monitor { profile, .. } => CliOverrides {
                profile: profile.clone(),
                ..CliOverrides::default()
            },
            Commands::Upload {
                profile, region, ..
            } => CliOverrides {
                profile: profile.clone(),
                region: region.clone(),
                ..CliOverrides::default()
            },
        }
    }
}

/// How a command ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    PartiallyFailed,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed => 1,
            RunOutcome::PartiallyFailed => 2,
        }
    }
}

impl From<Outcome> for RunOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => RunOutcome::Succeeded,
            Outcome::PartiallyFailed => RunOutcome::PartiallyFailed,
            Outcome::Failed => RunOutcome::Failed,
        }
    }
}

/// Folds what polling observed into the submission's own outcome.
pub fn after_polling(submitted: RunOutcome, polled: &PollOutcome) -> RunOutcome {
    match polled {
        PollOutcome::Settled(JobStatus::Failed { .. }) => RunOutcome::PartiallyFailed,
        PollOutcome::Settled(_) | PollOutcome::Cancelled { .. } => submitted,
        PollOutcome::TimedOut { .. } | PollOutcome::Error(_) => RunOutcome::Failed,
    }
}

fn print_poll_outcome(job_id: &str, outcome: &PollOutcome) {
    match outcome {
        PollOutcome::Settled(status) => println!("{job_id}: {status}"),
        PollOutcome::TimedOut { last } => println!(
            "[ERROR] {job_id}: gave up waiting, last status {}",
            last.as_ref().map_or("unknown".to_string(), ToString::to_string)
        ),
        PollOutcome::Cancelled { .. } => {
            println!("{job_id}: stopped waiting; the job keeps running")
        }
        PollOutcome::Error(e) => println!("[ERROR] {job_id}: status check failed: {e}"),
    }
}

fn ctrl_c() -> impl std::future::Future<Output = ()> {
    tokio::signal::ctrl_c().map(|_| ())
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<RunOutcome> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let env = EnvVars::from_process();
    let document = load_optional(cli.command.config_flag(), env.get(CONFIG_ENV_VAR))?;
    let region = match preview_region(&cli.command.overrides(), document.as_ref(), &env) {
        Ok(region) => region,
        Err(e) => {
            error!(error = %e, "Could not determine the AWS region");
            println!("[ERROR] resolving failed: {e}");
            return Ok(RunOutcome::Failed);
        }
    };
    let cloud = AwsCloud::connect(&region).await;
    execute(cli.command, cloud.clients(), document.as_ref(), &env).await
}

/// Runs one command against the given cloud clients.
pub async fn execute(
    command: Commands,
    clients: CloudClients,
    document: Option<&ProfileDocument>,
    env: &EnvVars,
) -> Result<RunOutcome> {
    info!(command = command.name(), "Running command");
    let overrides = command.overrides();
    match command {
        Commands::Process {
            job,
            input,
            exclude,
            save_vid,
            wait,
            poll_timeout_secs,
            dry_run,
            ..
        } => {
            let request = SubmissionRequest {
                job_name: job,
                input,
                exclude,
                backend: BackendChoice::SingleJob {
                    save_video: save_vid,
                },
                overrides,
                dry_run,
            };
            submit(clients, request, document, env, wait, poll_timeout_secs).await
        }
        Commands::Ecsprocess {
            job,
            input,
            exclude,
            cluster,
            upload,
            clean,
            wait,
            poll_timeout_secs,
            dry_run,
            ..
        } => {
            let request = SubmissionRequest {
                job_name: job,
                input,
                exclude,
                backend: BackendChoice::Cluster {
                    cluster,
                    upload,
                    clean,
                },
                overrides,
                dry_run,
            };
            submit(clients, request, document, env, wait, poll_timeout_secs).await
        }
        Commands::Monitor {
            cluster,
            update_period,
            poll_timeout_secs,
            ..
        } => monitor(clients, &cluster, update_period, poll_timeout_secs).await,
        Commands::Upload {
            input, s3, exclude, ..
        } => {
            let request = UploadRequest {
                input,
                exclude,
                destination: s3,
            };
            upload(clients, request, document).await
        }
    }
}

async fn upload(
    clients: CloudClients,
    request: UploadRequest,
    document: Option<&ProfileDocument>,
) -> Result<RunOutcome> {
    match SubmissionOrchestrator::new(clients).upload(&request, document).await {
        Ok(report) => {
            println!("{}", report.summary());
            Ok(RunOutcome::Succeeded)
        }
        Err(e) => {
            println!("[ERROR] {e}");
            Ok(RunOutcome::Failed)
        }
    }
}

async fn submit(
    clients: CloudClients,
    request: SubmissionRequest,
    document: Option<&ProfileDocument>,
    env: &EnvVars,
    wait: bool,
    poll_timeout_secs: u64,
) -> Result<RunOutcome> {
    let orchestrator = SubmissionOrchestrator::new(clients);
    let Submission { report, backend } = match orchestrator.submit(&request, document, env).await {
        Ok(submission) => submission,
        Err(e) => {
            println!("[ERROR] {e}");
            return Ok(RunOutcome::Failed);
        }
    };
    println!("{}", report.summary());
    let submitted = RunOutcome::from(report.outcome);

    let result = match report.result {
        Some(result) if wait => result,
        _ => return Ok(submitted),
    };
    let policy = PollPolicy {
        timeout: Duration::from_secs(poll_timeout_secs),
        ..PollPolicy::default()
    };
    info!(job_id = %result.job_id, "Waiting for job to settle (Ctrl-C stops waiting)");
    let polled = poll_until_settled(&backend, &result.job_id, &policy, ctrl_c()).await;
    print_poll_outcome(&result.job_id, &polled);
    Ok(after_polling(submitted, &polled))
}

async fn monitor(
    clients: CloudClients,
    cluster: &str,
    update_period: u64,
    poll_timeout_secs: u64,
) -> Result<RunOutcome> {
    let settings = ClusterBackendSettings {
        batch_size: 1,
        concurrency: 1,
        clean: false,
        upload: false,
        user_name: String::new(),
    };
    let backend = match ClusterBackend::connect(
        clients.cluster.clone(),
        clients.store.clone(),
        cluster,
        settings,
        RetryPolicy::default(),
        DEFAULT_CALL_TIMEOUT,
    )
    .await
    {
        Ok(backend) => Backend::Cluster(backend),
        Err(e) => {
            warn!(cluster, error = %e, "Cluster lookup failed");
            println!("[ERROR] resolving failed: {e}");
            return Ok(RunOutcome::Failed);
        }
    };

    let period = Duration::from_secs(update_period.max(1));
    let policy = PollPolicy {
        initial_interval: period,
        max_interval: period,
        timeout: Duration::from_secs(poll_timeout_secs),
    };
    let polled = poll_until_settled(&backend, cluster, &policy, ctrl_c()).await;
    print_poll_outcome(cluster, &polled);
    Ok(after_polling(RunOutcome::Succeeded, &polled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepsea_ai_core::error::BackendError;

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
        assert_eq!(RunOutcome::Failed.exit_code(), 1);
        assert_eq!(RunOutcome::PartiallyFailed.exit_code(), 2);
    }

    #[test]
    fn polling_failures_override_a_clean_submission() {
        let failed = PollOutcome::Settled(JobStatus::Failed {
            reason: "OOM".into(),
        });
        assert_eq!(
            after_polling(RunOutcome::Succeeded, &failed),
            RunOutcome::PartiallyFailed
        );
        assert_eq!(
            after_polling(RunOutcome::Succeeded, &PollOutcome::TimedOut { last: None }),
            RunOutcome::Failed
        );
        assert_eq!(
            after_polling(
                RunOutcome::PartiallyFailed,
                &PollOutcome::Cancelled { last: None }
            ),
            RunOutcome::PartiallyFailed
        );
        assert_eq!(
            after_polling(
                RunOutcome::Succeeded,
                &PollOutcome::Error(BackendError::AuthFailure("expired".into()))
            ),
            RunOutcome::Failed
        );
    }

    #[test]
    fn ecsprocess_flags_parse() {
        let cli = Cli::parse_from([
            "deepsea-ai",
            "ecsprocess",
            "-j",
            "Dive 1423",
            "-i",
            "/data/dive1423",
            "-c",
            "benthic33",
            "-e",
            "D1",
            "-e",
            "D2",
            "-u",
            "--clean",
            "--batch-size",
            "2",
            "--conf-thres",
            "0.3",
        ]);
        match &cli.command {
            Commands::Ecsprocess {
                exclude,
                upload,
                clean,
                batch_size,
                ..
            } => {
                assert_eq!(exclude, &["D1".to_string(), "D2".to_string()]);
                assert!(*upload && *clean);
                assert_eq!(*batch_size, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
        let overrides = cli.command.overrides();
        assert_eq!(overrides.conf_thres, Some(0.3));
        assert_eq!(overrides.batch_size, Some(2));
        assert_eq!(overrides.region, None);
    }

    #[test]
    fn process_maps_model_flag_onto_overrides() {
        let cli = Cli::parse_from([
            "deepsea-ai",
            "process",
            "--job",
            "x",
            "--input",
            "v.mov",
            "-m",
            "s3://bucket/model.tar.gz",
            "--region",
            "us-east-1",
        ]);
        let overrides = cli.command.overrides();
        assert_eq!(overrides.model.as_deref(), Some("s3://bucket/model.tar.gz"));
        assert_eq!(overrides.model_size, None);
        assert_eq!(overrides.region.as_deref(), Some("us-east-1"));
        assert!(matches!(
            cli.command,
            Commands::Process {
                poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
                ..
            }
        ));
    }

    #[test]
    fn tracking_flags_map_onto_overrides() {
        let cli = Cli::parse_from([
            "deepsea-ai",
            "process",
            "-j",
            "x",
            "-i",
            "v.mov",
            "--model-size",
            "1280",
            "-c",
            "s3://902005-public/config/strong_sort_benthic.yaml",
            "--reid-model-url",
            "https://example.org/osnet_x0_25.pt",
            "-s",
        ]);
        let overrides = cli.command.overrides();
        assert_eq!(overrides.model_size, Some(1280));
        assert_eq!(
            overrides.config_s3.as_deref(),
            Some("s3://902005-public/config/strong_sort_benthic.yaml")
        );
        assert_eq!(
            overrides.reid_model_url.as_deref(),
            Some("https://example.org/osnet_x0_25.pt")
        );
        assert!(matches!(cli.command, Commands::Process { save_vid: true, .. }));

        let cli = Cli::parse_from([
            "deepsea-ai",
            "ecsprocess",
            "-j",
            "x",
            "-i",
            "dir",
            "-c",
            "benthic33",
            "--config-s3",
            "s3://902005-public/config/deep_sort.yaml",
        ]);
        assert!(matches!(
            &cli.command,
            Commands::Ecsprocess { cluster, .. } if cluster == "benthic33"
        ));
        assert_eq!(
            cli.command.overrides().config_s3.as_deref(),
            Some("s3://902005-public/config/deep_sort.yaml")
        );
    }

    #[test]
    fn upload_flags_parse() {
        let cli = Cli::parse_from([
            "deepsea-ai",
            "upload",
            "-i",
            "/Volumes/M3/dive",
            "--s3",
            "902005-video-in",
            "--region",
            "us-west-2",
        ]);
        assert_eq!(cli.command.name(), "upload");
        assert_eq!(cli.command.overrides().region.as_deref(), Some("us-west-2"));
        assert!(matches!(
            &cli.command,
            Commands::Upload { s3, exclude, .. } if s3 == "902005-video-in" && exclude.is_empty()
        ));
    }
}
