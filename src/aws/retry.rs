use std::future::Future;

use aws_smithy_runtime_api::client::{orchestrator::HttpResponse, result::SdkError};
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::errors::AwsError;

/// Error codes retried in place before surfacing. `AccessDenied` is in the
/// list because freshly created roles and users take a few seconds to
/// propagate.
const RETRYABLE_CODES: &[&str] = &[
    "AccessDenied",
    "ServiceException",
    "TooManyRequests",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
];

pub const RETRY_ATTEMPTS: u32 = 5;
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(3);

fn is_retryable_code(code: &str) -> bool {
    RETRYABLE_CODES.contains(&code)
}

/// Classify a service error code into the crate error taxonomy.
pub fn classify(code: &str, message: &str) -> AwsError {
    let code = code.to_string();
    let message = message.to_string();
    match code.as_str() {
        "TooManyRequests"
        | "Throttling"
        | "ThrottlingException"
        | "RequestLimitExceeded"
        | "ServiceException"
        | "ServiceUnavailable"
        | "UnrecognizedClientException"
        | "InvalidClientTokenId" => AwsError::Transient { code, message },
        "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" => {
            AwsError::AccessDenied { code, message }
        }
        "MalformedPolicyDocument" | "ValidationError" | "ValidationException" | "InvalidInput" => {
            AwsError::Validation { code, message }
        }
        c if c.ends_with("NotFoundException")
            || c.ends_with("NotFound")
            || c.starts_with("NoSuch") =>
        {
            AwsError::NotFound { code, message }
        }
        _ => AwsError::Fatal { code, message },
    }
}

fn classify_sdk_error<E>(err: &SdkError<E, HttpResponse>) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match err {
        SdkError::ServiceError(_) => {
            let code = err.code().unwrap_or("Unknown").to_string();
            let message = err.message().unwrap_or_default().to_string();
            classify(&code, &message)
        }
        // Dispatch/timeout/response failures are connectivity problems.
        other => AwsError::Transient {
            code: "RequestFailure".to_string(),
            message: format!("{other}"),
        },
    }
}

/// Run `call`, retrying transient codes with exponential backoff
/// (5 attempts, 3s initial delay). Non-retryable errors surface unchanged
/// after classification.
pub async fn retry_transient<T, E, F, Fut>(operation: &str, mut call: F) -> Result<T, AwsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SdkError<E, HttpResponse>>>,
    E: ProvideErrorMetadata + std::error::Error,
{
    let mut delay = RETRY_INITIAL_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(out) => return Ok(out),
            Err(err) => {
                let code = err.code().unwrap_or("RequestFailure").to_string();
                let retryable =
                    is_retryable_code(&code) || !matches!(err, SdkError::ServiceError(_));
                if retryable && attempt < RETRY_ATTEMPTS {
                    debug!(
                        "{operation} failed with {code} (attempt {attempt}/{RETRY_ATTEMPTS}), retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    continue;
                }
                let classified = classify_sdk_error(&err);
                if attempt > 1 {
                    warn!("{operation} failed after {attempt} attempts: {classified}");
                }
                return Err(classified);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_codes_classify_as_transient() {
        assert!(matches!(
            classify("TooManyRequests", "slow down"),
            AwsError::Transient { .. }
        ));
        assert!(matches!(
            classify("InvalidClientTokenId", ""),
            AwsError::Transient { .. }
        ));
    }

    #[test]
    fn access_and_validation_codes_classify() {
        assert!(matches!(
            classify("AccessDenied", "nope"),
            AwsError::AccessDenied { .. }
        ));
        assert!(matches!(
            classify("MalformedPolicyDocument", "bad json"),
            AwsError::Validation { .. }
        ));
    }

    #[test]
    fn not_found_shapes_classify_as_not_found() {
        for code in ["NoSuchEntity", "NoSuchBucket", "ResourceNotFoundException"] {
            assert!(classify(code, "").is_not_found(), "{code}");
        }
    }

    #[test]
    fn unknown_codes_are_fatal() {
        assert!(matches!(
            classify("ConstraintViolationException", "org limit"),
            AwsError::Fatal { .. }
        ));
    }

    #[test]
    fn retryable_set_matches_contract() {
        for code in [
            "AccessDenied",
            "ServiceException",
            "TooManyRequests",
            "UnrecognizedClientException",
            "InvalidClientTokenId",
        ] {
            assert!(is_retryable_code(code), "{code}");
        }
        assert!(!is_retryable_code("MalformedPolicyDocument"));
    }
}
