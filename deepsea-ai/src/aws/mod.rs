//! AWS SDK implementations of the core capability traits.
//!
//! One shared SDK config is loaded per invocation (credentials from the usual
//! provider chain, region from the resolved config) and every service client
//! is built from it.

pub mod cluster;
pub mod error;
pub mod s3;
pub mod sagemaker;
pub mod sts;

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use deepsea_ai_core::error::BackendError;
use deepsea_ai_core::orchestrator::CloudClients;
use tracing::info;

pub use cluster::EcsCluster;
pub use s3::S3Store;
pub use sagemaker::SageMakerProcessing;
pub use sts::StsIdentity;

/// Normalises SDK builder results: some `build()` calls are fallible (required
/// members), others are not.
pub(crate) trait Finish<T> {
    fn finish(self, what: &str) -> Result<T, BackendError>;
}

impl<T> Finish<T> for Result<T, aws_sdk_s3::error::BuildError> {
    fn finish(self, what: &str) -> Result<T, BackendError> {
        self.map_err(|e| error::invalid_request(what, e))
    }
}

macro_rules! infallible_build {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Finish<$ty> for $ty {
                fn finish(self, _what: &str) -> Result<$ty, BackendError> {
                    Ok(self)
                }
            }
        )*
    };
}

infallible_build!(
    aws_sdk_sagemaker::types::ProcessingResources,
    aws_sdk_sagemaker::types::ProcessingClusterConfig,
    aws_sdk_sagemaker::types::ProcessingStoppingCondition,
    aws_sdk_sagemaker::types::ProcessingInput,
    aws_sdk_sagemaker::types::ProcessingS3Input,
    aws_sdk_sagemaker::types::ProcessingOutput,
    aws_sdk_sagemaker::types::ProcessingS3Output,
    aws_sdk_sagemaker::types::ProcessingOutputConfig,
    aws_sdk_sagemaker::types::AppSpecification,
    aws_sdk_sagemaker::types::Tag,
    aws_sdk_s3::types::Tag,
    aws_sdk_s3::types::Tagging,
);

/// All AWS-backed capabilities for one region.
#[derive(Clone)]
pub struct AwsCloud {
    pub identity: Arc<StsIdentity>,
    pub store: Arc<S3Store>,
    pub processing: Arc<SageMakerProcessing>,
    pub cluster: Arc<EcsCluster>,
}

impl AwsCloud {
    pub async fn connect(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        info!(region, "Loaded AWS configuration");
        Self {
            identity: Arc::new(StsIdentity::new(aws_sdk_sts::Client::new(&config))),
            store: Arc::new(S3Store::new(aws_sdk_s3::Client::new(&config))),
            processing: Arc::new(SageMakerProcessing::new(aws_sdk_sagemaker::Client::new(
                &config,
            ))),
            cluster: Arc::new(EcsCluster::new(
                aws_sdk_cloudformation::Client::new(&config),
                aws_sdk_ecs::Client::new(&config),
                aws_sdk_sqs::Client::new(&config),
            )),
        }
    }

    pub fn clients(&self) -> CloudClients {
        CloudClients {
            identity: self.identity.clone(),
            store: self.store.clone(),
            processing: self.processing.clone(),
            cluster: self.cluster.clone(),
        }
    }
}
