use assert_cmd::Command;
use deepsea_ai::cli::{execute, Commands, RunOutcome};
use deepsea_ai_core::config::{EnvVars, ProfileDocument};
use async_trait::async_trait;
use deepsea_ai_core::contract::{
    CallerIdentity, ClusterProgress, ClusterResources, ClusterService, ClusterTask,
    MockClusterService, MockIdentityProvider, MockObjectStore, MockProcessingService, TaskVideos,
};
use deepsea_ai_core::error::BackendError;
use deepsea_ai_core::orchestrator::CloudClients;
use deepsea_ai_core::role::ROLE_ENV_VAR;
use mockall::predicate::eq;
use predicates::prelude::*;
use serial_test::serial;
use std::fs::{self, write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, NamedTempFile, TempDir};

const PROFILES: &str = r#"
default_profile: mbari
profiles:
  mbari:
    region: us-west-2
    role_arn: "arn:aws:iam::168552337187:role/DeepSeaAI"
    input_s3: s3://902005-video-in/Dive1423
    output_s3: s3://902005-tracks-out/Dive1423
tags:
  organization: mbari
  project_number: "902005"
  stage: dev
  application: detection-tracking
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(config.path(), contents).expect("Writing temp config failed");
    config
}

fn document() -> ProfileDocument {
    deepsea_ai::load_config::load_config(write_config(PROFILES).path()).expect("config loads")
}

fn video_dir(names: &[&str]) -> TempDir {
    let dir = tempdir().unwrap();
    for name in names {
        fs::write(dir.path().join(name), b"video").unwrap();
    }
    dir
}

fn identity() -> MockIdentityProvider {
    let mut identity = MockIdentityProvider::new();
    identity.expect_caller_identity().returning(|| {
        Ok(CallerIdentity {
            account: "168552337187".into(),
            arn: "arn:aws:iam::168552337187:user/dcline".into(),
            user_name: "dcline".into(),
        })
    });
    identity
}

fn resources(name: &str) -> ClusterResources {
    ClusterResources {
        cluster: name.to_string(),
        processor: "strongsort-yolov5".into(),
        video_queue: "benthic33-video.fifo".into(),
        track_queue: None,
        dead_queue: Some("benthic33-dead.fifo".into()),
        video_bucket: "902005-video-in".into(),
        track_bucket: None,
    }
}

fn clients(cluster: MockClusterService, store: MockObjectStore) -> CloudClients {
    CloudClients {
        identity: Arc::new(identity()),
        store: Arc::new(store),
        processing: Arc::new(MockProcessingService::new()),
        cluster: Arc::new(cluster),
    }
}

fn quiet_store() -> MockObjectStore {
    let mut store = MockObjectStore::new();
    store.expect_object_exists().returning(|_| Ok(false));
    store.expect_put_object().returning(|_, _| Ok(()));
    store
}

fn ecsprocess(input: &Path) -> Commands {
    Commands::Ecsprocess {
        job: "Dive 1423".into(),
        input: input.to_path_buf(),
        exclude: vec![],
        cluster: "benthic33".into(),
        config: None,
        profile: None,
        upload: false,
        clean: false,
        conf_thres: None,
        iou_thres: None,
        tracker: None,
        model_size: None,
        config_s3: None,
        reid_model_url: None,
        batch_size: None,
        concurrency: Some(2),
        wait: false,
        poll_timeout_secs: 60,
        dry_run: false,
    }
}

#[test]
fn help_lists_every_command() {
    let mut cmd = Command::cargo_bin("deepsea-ai").expect("Binary exists");
    cmd.arg("--help").assert().success().stdout(
        predicate::str::contains("process")
            .and(predicate::str::contains("ecsprocess"))
            .and(predicate::str::contains("monitor"))
            .and(predicate::str::contains("upload")),
    );
}

#[test]
fn missing_config_file_fails_before_any_cloud_call() {
    let dir = video_dir(&["D1.mov"]);
    let mut cmd = Command::cargo_bin("deepsea-ai").expect("Binary exists");
    cmd.arg("ecsprocess")
        .args(["-j", "x", "-c", "benthic33", "--config", "/nonexistent/deepsea-ai.yaml"])
        .arg("-i")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn unknown_profile_exits_with_resolving_error() {
    let config = write_config(PROFILES);
    let mut cmd = Command::cargo_bin("deepsea-ai").expect("Binary exists");
    cmd.arg("monitor")
        .args(["-c", "benthic33", "--profile", "elsewhere", "--config"])
        .arg(config.path())
        .env_remove("DEEPSEA_AI_PROFILE")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("[ERROR] resolving failed"));
}

#[tokio::test]
async fn ecsprocess_with_one_rejected_task_exits_partially_failed() {
    let dir = video_dir(&["D1.mov", "D2.mov", "D3.mov"]);
    let mut cluster = MockClusterService::new();
    cluster
        .expect_describe_cluster()
        .returning(|name| Ok(resources(name)));
    cluster.expect_send_task().returning(|_, task| match &task.message.videos {
        TaskVideos::Single { video } if video.ends_with("D2.mov") => {
            Err(BackendError::Rejected("InvalidParameterValue".into()))
        }
        _ => Ok("message-id".into()),
    });

    let outcome = execute(
        ecsprocess(dir.path()),
        clients(cluster, quiet_store()),
        Some(&document()),
        &EnvVars::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, RunOutcome::PartiallyFailed);
    assert_eq!(outcome.exit_code(), 2);
}

#[tokio::test]
async fn ecsprocess_with_no_videos_fails() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), b"not a video").unwrap();
    let mut cluster = MockClusterService::new();
    cluster
        .expect_describe_cluster()
        .returning(|name| Ok(resources(name)));

    let outcome = execute(
        ecsprocess(dir.path()),
        clients(cluster, MockObjectStore::new()),
        Some(&document()),
        &EnvVars::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, RunOutcome::Failed);
}

#[tokio::test]
async fn process_dry_run_submits_nothing() {
    let dir = video_dir(&["D1.mov", "D2.mov"]);
    let command = Commands::Process {
        job: "Dive 1423".into(),
        input: dir.path().to_path_buf(),
        exclude: vec![],
        tracker: Some("deepsort".into()),
        model_s3: None,
        conf_thres: None,
        iou_thres: None,
        input_s3: None,
        output_s3: None,
        instance_type: None,
        model_size: None,
        config_s3: None,
        reid_model_url: None,
        save_vid: false,
        config: None,
        profile: None,
        region: None,
        wait: false,
        poll_timeout_secs: 60,
        dry_run: true,
    };
    let env: EnvVars = [(ROLE_ENV_VAR, "arn:aws:iam::872338704006:role/DeepSeaAI")]
        .into_iter()
        .collect();

    // Neither the store nor the processing service has expectations: any
    // call would panic.
    let outcome = execute(
        command,
        clients(MockClusterService::new(), MockObjectStore::new()),
        Some(&document()),
        &env,
    )
    .await
    .unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
}

fn monitor_with(progress: ClusterProgress) -> (Commands, CloudClients) {
    let mut cluster = MockClusterService::new();
    cluster
        .expect_describe_cluster()
        .with(eq("benthic33"))
        .times(1)
        .returning(|name| Ok(resources(name)));
    cluster
        .expect_cluster_progress()
        .returning(move |_| Ok(progress));
    let command = Commands::Monitor {
        cluster: "benthic33".into(),
        config: None,
        profile: None,
        update_period: 1,
        poll_timeout_secs: 10,
    };
    (command, clients(cluster, MockObjectStore::new()))
}

#[tokio::test]
async fn monitor_of_a_drained_cluster_succeeds() {
    let (command, clients) = monitor_with(ClusterProgress::default());
    let outcome = execute(command, clients, None, &EnvVars::default()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
}

#[tokio::test]
async fn monitor_reports_dead_letter_failures() {
    let (command, clients) = monitor_with(ClusterProgress {
        failed: 3,
        ..ClusterProgress::default()
    });
    let outcome = execute(command, clients, None, &EnvVars::default()).await.unwrap();
    assert_eq!(outcome, RunOutcome::PartiallyFailed);
}

use tracing_subscriber::prelude::*; // needed for .with()
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        use std::fmt::Write as FmtWrite;
        let mut msg = String::new();
        let _ = write!(&mut msg, "{:?}", event);
        self.events.lock().unwrap().push(msg);
    }
}

/// Cluster discovery that never answers.
struct SilentCluster;

#[async_trait]
impl ClusterService for SilentCluster {
    async fn describe_cluster(&self, _cluster: &str) -> Result<ClusterResources, BackendError> {
        std::future::pending().await
    }

    async fn send_task(
        &self,
        _resources: &ClusterResources,
        _task: &ClusterTask,
    ) -> Result<String, BackendError> {
        std::future::pending().await
    }

    async fn cluster_progress(
        &self,
        _resources: &ClusterResources,
    ) -> Result<ClusterProgress, BackendError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn monitor_gives_up_when_the_cluster_lookup_hangs() {
    let clients = CloudClients {
        identity: Arc::new(identity()),
        store: Arc::new(MockObjectStore::new()),
        processing: Arc::new(MockProcessingService::new()),
        cluster: Arc::new(SilentCluster),
    };
    let command = Commands::Monitor {
        cluster: "benthic33".into(),
        config: None,
        profile: None,
        update_period: 1,
        poll_timeout_secs: 10,
    };
    let outcome = execute(command, clients, None, &EnvVars::default()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed);
}

#[tokio::test]
async fn upload_stages_every_video_into_the_bucket() {
    let dir = video_dir(&["D1.mov", "D2.mov"]);
    let mut store = MockObjectStore::new();
    store
        .expect_ensure_bucket()
        .withf(|bucket, tags| {
            bucket == "902005-video-in" && tags.iter().any(|t| t.value == "dev")
        })
        .times(1)
        .returning(|_, _| Ok(false));
    store.expect_object_exists().returning(|_| Ok(false));
    store
        .expect_upload_file()
        .withf(|_, uri| uri.bucket() == "902005-video-in")
        .times(2)
        .returning(|_, _| Ok(()));
    store.expect_tag_object().times(2).returning(|_, _| Ok(()));

    let command = Commands::Upload {
        input: dir.path().to_path_buf(),
        s3: "s3://902005-video-in".into(),
        exclude: vec![],
        config: None,
        profile: None,
        region: None,
    };
    let outcome = execute(
        command,
        clients(MockClusterService::new(), store),
        Some(&document()),
        &EnvVars::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, RunOutcome::Succeeded);
}

#[tokio::test]
async fn upload_to_an_unusable_bucket_fails() {
    let dir = video_dir(&["D1.mov"]);
    let mut store = MockObjectStore::new();
    store
        .expect_ensure_bucket()
        .returning(|_, _| Err(BackendError::AuthFailure("AccessDenied".into())));
    store.expect_upload_file().never();

    let command = Commands::Upload {
        input: dir.path().to_path_buf(),
        s3: "902005-video-in".into(),
        exclude: vec![],
        config: None,
        profile: None,
        region: None,
    };
    let outcome = execute(
        command,
        clients(MockClusterService::new(), store),
        None,
        &EnvVars::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, RunOutcome::Failed);
}

#[test]
#[serial]
fn config_path_from_environment_is_honoured() {
    let dir = video_dir(&["D1.mov"]);
    let mut cmd = Command::cargo_bin("deepsea-ai").expect("Binary exists");
    cmd.arg("ecsprocess")
        .args(["-j", "x", "-c", "benthic33", "-i"])
        .arg(dir.path())
        .env("DEEPSEA_AI_CONFIG", "/nonexistent/from-env.yaml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("from-env.yaml"));
}

#[tokio::test]
#[serial]
async fn run_reads_the_config_path_from_the_process_environment() {
    use deepsea_ai::cli::{run, Cli};

    std::env::set_var("DEEPSEA_AI_CONFIG", "/nonexistent/process-env.yaml");
    let cli = Cli {
        command: Commands::Monitor {
            cluster: "benthic33".into(),
            config: None,
            profile: None,
            update_period: 60,
            poll_timeout_secs: 60,
        },
    };
    let result = run(cli).await;
    std::env::remove_var("DEEPSEA_AI_CONFIG");

    let err = result.unwrap_err();
    assert!(err.to_string().contains("process-env.yaml"));
}

#[tokio::test]
#[serial]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use deepsea_ai::cli::{run, Cli};

    // A config path that does not exist stops the run before any AWS call.
    let cli = Cli {
        command: Commands::Monitor {
            cluster: "benthic33".into(),
            config: Some(PathBuf::from("dummy.yaml")),
            profile: None,
            update_period: 60,
            poll_timeout_secs: 60,
        },
    };

    let result = run(cli).await;
    assert!(result.is_err());

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
