//! Support utilities for [`keen_retry`]'s retry API.

use keen_retry::RetryResult;
use reqwest::StatusCode;
use thiserror::Error;

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if $crate::retry::IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_potentially_transient;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// An HTTP service answered, but not with a status we can use.
#[derive(Debug, Error)]
#[error("{service} returned HTTP {status}: {body}")]
pub struct UnexpectedStatus {
    /// Which service we were talking to.
    pub service: &'static str,
    /// The status we got.
    pub status: StatusCode,
    /// The response body, for debugging.
    pub body: String,
}

impl UnexpectedStatus {
    /// Build an error from a response, consuming its body.
    pub async fn from_response(service: &'static str, response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|err| format!("<could not read body: {err}>"));
        Self {
            service,
            status,
            body,
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from polling forever with exponential backoff on errors that will never
/// resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. `reqwest`
            // doesn't expose most of them in enough detail to be certain.
            !self.is_builder() && !self.is_decode()
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for UnexpectedStatus {
    fn is_known_transient(&self) -> bool {
        self.status.is_known_transient()
    }
}

impl IsKnownTransient for anyhow::Error {
    /// Look through the error chain for something we know how to classify.
    fn is_known_transient(&self) -> bool {
        self.chain().any(|cause| {
            if let Some(err) = cause.downcast_ref::<UnexpectedStatus>() {
                err.is_known_transient()
            } else if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
                err.is_known_transient()
            } else {
                false
            }
        })
    }
}
