//! Single managed processing job on SageMaker.

use async_trait::async_trait;
use aws_sdk_sagemaker::types::{
    AppSpecification, ProcessingClusterConfig, ProcessingInput, ProcessingInstanceType,
    ProcessingJobStatus, ProcessingOutput, ProcessingOutputConfig, ProcessingResources,
    ProcessingS3DataType, ProcessingS3Input, ProcessingS3InputMode, ProcessingS3Output,
    ProcessingS3UploadMode, ProcessingStoppingCondition, Tag,
};
use deepsea_ai_core::contract::{
    ProcessingJobDescription, ProcessingJobRequest, ProcessingService, RemoteJobState,
};
use deepsea_ai_core::error::BackendError;
use tracing::debug;

use super::error::classify;
use super::Finish;

/// Container paths the tracking image reads from and writes to.
pub const INPUT_PATH: &str = "/opt/ml/processing/input";
pub const OUTPUT_PATH: &str = "/opt/ml/processing/output";

pub struct SageMakerProcessing {
    client: aws_sdk_sagemaker::Client,
}

impl SageMakerProcessing {
    pub fn new(client: aws_sdk_sagemaker::Client) -> Self {
        Self { client }
    }
}

fn remote_state(status: Option<&ProcessingJobStatus>) -> RemoteJobState {
    match status {
        Some(ProcessingJobStatus::Completed) => RemoteJobState::Completed,
        Some(ProcessingJobStatus::Failed) => RemoteJobState::Failed,
        Some(ProcessingJobStatus::Stopping) => RemoteJobState::Stopping,
        Some(ProcessingJobStatus::Stopped) => RemoteJobState::Stopped,
        _ => RemoteJobState::InProgress,
    }
}

#[async_trait]
impl ProcessingService for SageMakerProcessing {
    async fn create_processing_job(
        &self,
        request: &ProcessingJobRequest,
    ) -> Result<String, BackendError> {
        let app = AppSpecification::builder()
            .image_uri(&request.image_uri)
            .set_container_arguments(Some(request.arguments.clone()))
            .build()
            .finish("app specification")?;
        let cluster = ProcessingClusterConfig::builder()
            .instance_count(1)
            .instance_type(ProcessingInstanceType::from(request.instance_type.as_str()))
            .volume_size_in_gb(request.volume_size_gb)
            .build()
            .finish("cluster config")?;
        let resources = ProcessingResources::builder()
            .cluster_config(cluster)
            .build()
            .finish("processing resources")?;
        let stopping = ProcessingStoppingCondition::builder()
            .max_runtime_in_seconds(request.max_runtime_secs)
            .build()
            .finish("stopping condition")?;
        let input = ProcessingInput::builder()
            .input_name("input")
            .s3_input(
                ProcessingS3Input::builder()
                    .s3_uri(request.input_manifest.to_string())
                    .s3_data_type(ProcessingS3DataType::ManifestFile)
                    .s3_input_mode(ProcessingS3InputMode::File)
                    .local_path(INPUT_PATH)
                    .build()
                    .finish("s3 input")?,
            )
            .build()
            .finish("processing input")?;
        let output = ProcessingOutput::builder()
            .output_name("output")
            .s3_output(
                ProcessingS3Output::builder()
                    .s3_uri(request.output.as_prefix())
                    .local_path(OUTPUT_PATH)
                    .s3_upload_mode(ProcessingS3UploadMode::EndOfJob)
                    .build()
                    .finish("s3 output")?,
            )
            .build()
            .finish("processing output")?;
        let outputs = ProcessingOutputConfig::builder()
            .outputs(output)
            .build()
            .finish("output config")?;
        let tags = request
            .tags
            .iter()
            .map(|t| Tag::builder().key(&t.key).value(&t.value).build().finish("tag"))
            .collect::<Result<Vec<_>, _>>()?;

        let out = self
            .client
            .create_processing_job()
            .processing_job_name(&request.job_name)
            .role_arn(&request.role_arn)
            .app_specification(app)
            .processing_resources(resources)
            .stopping_condition(stopping)
            .processing_inputs(input)
            .processing_output_config(outputs)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| classify("create processing job", e))?;

        let arn: Option<&str> = out.processing_job_arn().into();
        Ok(arn.unwrap_or(&request.job_name).to_string())
    }

    async fn describe_processing_job(
        &self,
        job_name: &str,
    ) -> Result<ProcessingJobDescription, BackendError> {
        let out = self
            .client
            .describe_processing_job()
            .processing_job_name(job_name)
            .send()
            .await
            .map_err(|e| classify("describe processing job", e))?;
        let status: Option<&ProcessingJobStatus> = out.processing_job_status().into();
        let arn: Option<&str> = out.processing_job_arn().into();
        debug!(job_name, ?status, "Described processing job");
        Ok(ProcessingJobDescription {
            job_id: arn.unwrap_or(job_name).to_string(),
            state: remote_state(status),
            failure_reason: out.failure_reason().map(str::to_string),
        })
    }

    async fn list_processing_jobs(&self, name_contains: &str) -> Result<Vec<String>, BackendError> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let out = self
                .client
                .list_processing_jobs()
                .name_contains(name_contains)
                .max_results(100)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify("list processing jobs", e))?;
            let summaries: Option<&[aws_sdk_sagemaker::types::ProcessingJobSummary]> =
                out.processing_job_summaries().into();
            for summary in summaries.unwrap_or_default() {
                let name: Option<&str> = summary.processing_job_name().into();
                if let Some(name) = name {
                    names.push(name.to_string());
                }
            }
            match out.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(names)
    }
}
