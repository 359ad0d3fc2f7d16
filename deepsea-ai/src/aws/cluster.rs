//! ECS cluster fan-out: stack discovery through CloudFormation, work queued
//! on SQS, progress from queue depth and running ECS tasks.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_ecs::types::DesiredStatus;
use aws_sdk_sqs::types::QueueAttributeName;
use deepsea_ai_core::contract::{ClusterProgress, ClusterResources, ClusterService, ClusterTask};
use deepsea_ai_core::error::BackendError;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::{classify, invalid_request};

const TASK_DEFINITION_TYPE: &str = "AWS::ECS::TaskDefinition";

/// Task environment names the pipeline stack exposes. Matched by substring,
/// so stack-specific prefixes are allowed.
const RESOURCE_KEYS: [&str; 6] = [
    "PROCESSOR",
    "TRACK_QUEUE",
    "VIDEO_QUEUE",
    "DEAD_QUEUE",
    "TRACK_BUCKET",
    "VIDEO_BUCKET",
];

/// Maps the task definition environment of a cluster stack onto its
/// resources. `PROCESSOR`, `VIDEO_QUEUE` and `VIDEO_BUCKET` are required.
pub fn resources_from_environment<'a>(
    cluster: &str,
    environment: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<ClusterResources, BackendError> {
    let mut found: HashMap<&'static str, String> = HashMap::new();
    for (name, value) in environment {
        for key in RESOURCE_KEYS {
            if name.contains(key) {
                found.insert(key, value.to_string());
            }
        }
    }
    let mut required = |key: &str| {
        found.remove(key).ok_or_else(|| {
            BackendError::Rejected(format!(
                "cluster '{cluster}' task definition has no {key} environment variable"
            ))
        })
    };
    let processor = required("PROCESSOR")?;
    let video_queue = required("VIDEO_QUEUE")?;
    let video_bucket = required("VIDEO_BUCKET")?;
    Ok(ClusterResources {
        cluster: cluster.to_string(),
        processor,
        video_queue,
        track_queue: found.remove("TRACK_QUEUE"),
        dead_queue: found.remove("DEAD_QUEUE"),
        video_bucket,
        track_bucket: found.remove("TRACK_BUCKET"),
    })
}

pub struct EcsCluster {
    cloudformation: aws_sdk_cloudformation::Client,
    ecs: aws_sdk_ecs::Client,
    sqs: aws_sdk_sqs::Client,
    queue_urls: Mutex<HashMap<String, String>>,
}

impl EcsCluster {
    pub fn new(
        cloudformation: aws_sdk_cloudformation::Client,
        ecs: aws_sdk_ecs::Client,
        sqs: aws_sdk_sqs::Client,
    ) -> Self {
        Self {
            cloudformation,
            ecs,
            sqs,
            queue_urls: Mutex::new(HashMap::new()),
        }
    }

    async fn task_definition_arn(&self, stack: &str) -> Result<String, BackendError> {
        let mut next_token: Option<String> = None;
        loop {
            let out = self
                .cloudformation
                .list_stack_resources()
                .stack_name(stack)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify("list stack resources", e))?;
            let summaries: Option<&[aws_sdk_cloudformation::types::StackResourceSummary]> =
                out.stack_resource_summaries().into();
            for summary in summaries.unwrap_or_default() {
                let kind: Option<&str> = summary.resource_type().into();
                let physical: Option<&str> = summary.physical_resource_id().into();
                if let (Some(kind), Some(arn)) = (kind, physical) {
                    if kind.contains(TASK_DEFINITION_TYPE) {
                        return Ok(arn.to_string());
                    }
                }
            }
            match out.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Err(BackendError::Rejected(format!(
            "stack '{stack}' has no ECS task definition"
        )))
    }

    async fn queue_url(&self, queue_name: &str) -> Result<String, BackendError> {
        let mut cache = self.queue_urls.lock().await;
        if let Some(url) = cache.get(queue_name) {
            return Ok(url.clone());
        }
        let out = self
            .sqs
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| classify("get queue url", e))?;
        let url = out
            .queue_url()
            .ok_or_else(|| BackendError::Rejected(format!("queue '{queue_name}' has no URL")))?
            .to_string();
        cache.insert(queue_name.to_string(), url.clone());
        Ok(url)
    }

    async fn queue_depth(&self, queue_name: &str) -> Result<(u64, u64), BackendError> {
        let url = self.queue_url(queue_name).await?;
        let out = self
            .sqs
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| classify("get queue attributes", e))?;
        let count = |name: QueueAttributeName| {
            out.attributes()
                .and_then(|attrs| attrs.get(&name))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Ok((
            count(QueueAttributeName::ApproximateNumberOfMessages),
            count(QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
        ))
    }

    async fn running_tasks(&self, cluster: &str) -> Result<u64, BackendError> {
        let mut total = 0u64;
        let mut next_token: Option<String> = None;
        loop {
            let out = self
                .ecs
                .list_tasks()
                .cluster(cluster)
                .desired_status(DesiredStatus::Running)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify("list tasks", e))?;
            let arns: Option<&[String]> = out.task_arns().into();
            total += arns.map_or(0, |a| a.len() as u64);
            match out.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl ClusterService for EcsCluster {
    async fn describe_cluster(&self, cluster: &str) -> Result<ClusterResources, BackendError> {
        let arn = self.task_definition_arn(cluster).await?;
        let out = self
            .ecs
            .describe_task_definition()
            .task_definition(&arn)
            .send()
            .await
            .map_err(|e| classify("describe task definition", e))?;

        let mut environment: Vec<(&str, &str)> = Vec::new();
        if let Some(definition) = out.task_definition() {
            let containers: Option<&[aws_sdk_ecs::types::ContainerDefinition]> =
                definition.container_definitions().into();
            if let Some(container) = containers.and_then(|c| c.first()) {
                let vars: Option<&[aws_sdk_ecs::types::KeyValuePair]> =
                    container.environment().into();
                for pair in vars.unwrap_or_default() {
                    if let (Some(name), Some(value)) = (pair.name(), pair.value()) {
                        environment.push((name, value));
                    }
                }
            }
        }
        let resources = resources_from_environment(cluster, environment)?;
        info!(
            cluster,
            processor = %resources.processor,
            video_queue = %resources.video_queue,
            video_bucket = %resources.video_bucket,
            "[CLUSTER] Discovered cluster resources"
        );
        Ok(resources)
    }

    async fn send_task(
        &self,
        resources: &ClusterResources,
        task: &ClusterTask,
    ) -> Result<String, BackendError> {
        let url = self.queue_url(&resources.video_queue).await?;
        let body = serde_json::to_string_pretty(&task.message)
            .map_err(|e| invalid_request("task message", e))?;
        let out = self
            .sqs
            .send_message()
            .queue_url(url)
            .message_body(body)
            .message_group_id(&task.group_id)
            .message_deduplication_id(&task.task_id)
            .send()
            .await
            .map_err(|e| classify("send message", e))?;
        let message_id = out.message_id().unwrap_or_default().to_string();
        debug!(
            queue = %resources.video_queue,
            task_id = %task.task_id,
            message_id = %message_id,
            "Queued task"
        );
        Ok(message_id)
    }

    async fn cluster_progress(
        &self,
        resources: &ClusterResources,
    ) -> Result<ClusterProgress, BackendError> {
        let (queued, in_flight) = self.queue_depth(&resources.video_queue).await?;
        let failed = match &resources.dead_queue {
            Some(dead) => self.queue_depth(dead).await?.0,
            None => 0,
        };
        let running_tasks = self.running_tasks(&resources.cluster).await?;
        Ok(ClusterProgress {
            queued,
            in_flight,
            running_tasks,
            failed,
        })
    }
}
