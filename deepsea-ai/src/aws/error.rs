//! Maps AWS SDK failures onto [`BackendError`] so the core retry policy can
//! tell transient failures from permanent ones.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use deepsea_ai_core::error::BackendError;

const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthFailure",
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidAccessKeyId",
    "InvalidClientTokenId",
    "InvalidToken",
    "MissingAuthenticationToken",
    "SignatureDoesNotMatch",
    "UnauthorizedOperation",
    "UnrecognizedClientException",
];

const QUOTA_CODES: &[&str] = &[
    "LimitExceededException",
    "OverLimit",
    "QuotaExceeded",
    "ResourceLimitExceeded",
    "ServiceQuotaExceededException",
    "TooManyBuckets",
];

const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "RequestTimeout",
    "RequestTimeoutException",
    "ServiceUnavailable",
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
];

/// Classifies a service error code. Unknown codes are permanent rejections.
pub fn classify_code(code: Option<&str>, message: String) -> BackendError {
    match code {
        Some(c) if AUTH_CODES.contains(&c) => BackendError::AuthFailure(message),
        Some(c) if QUOTA_CODES.contains(&c) => BackendError::QuotaExceeded(message),
        Some(c) if TRANSIENT_CODES.contains(&c) => BackendError::TransientNetwork(message),
        _ => BackendError::Rejected(message),
    }
}

/// Classifies any SDK operation error. Timeouts, dispatch failures and
/// unparseable responses are transient.
pub fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{operation}: {}", DisplayErrorContext(&err));
    tracing::debug!(operation, error = %message, "AWS call failed");
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            BackendError::TransientNetwork(message)
        }
        _ => classify_code(err.code(), message),
    }
}

/// Wraps a builder failure for a request we assembled ourselves.
pub fn invalid_request(what: &str, err: impl std::fmt::Display) -> BackendError {
    BackendError::Rejected(format!("invalid {what} request: {err}"))
}
