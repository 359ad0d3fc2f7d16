use async_trait::async_trait;
use deepsea_ai_core::contract::{CallerIdentity, IdentityProvider};
use deepsea_ai_core::error::BackendError;

use super::error::classify;

pub struct StsIdentity {
    client: aws_sdk_sts::Client,
}

impl StsIdentity {
    pub fn new(client: aws_sdk_sts::Client) -> Self {
        Self { client }
    }
}

/// User name from a caller ARN: the last path segment, which is the IAM user
/// or, for assumed roles, the session name.
pub fn user_name_from_arn(arn: &str) -> String {
    arn.rsplit(['/', ':']).next().unwrap_or(arn).to_string()
}

#[async_trait]
impl IdentityProvider for StsIdentity {
    async fn caller_identity(&self) -> Result<CallerIdentity, BackendError> {
        let out = self
            .client
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| classify("get caller identity", e))?;
        let account = out.account().unwrap_or_default().to_string();
        let arn = out.arn().unwrap_or_default().to_string();
        tracing::debug!(account = %account, arn = %arn, "Resolved caller identity");
        Ok(CallerIdentity {
            user_name: user_name_from_arn(&arn),
            account,
            arn,
        })
    }
}
