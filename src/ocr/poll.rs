//! Waiting for an OCR job to finish.
//!
//! The read service gives us no notification when a job completes, so we ask
//! until the answer is something other than "not started" or "running". To
//! avoid blocking an invocation forever on a job that never finishes, we
//! bound the number of status checks and (optionally) the wall-clock time,
//! and we back off exponentially between checks.

use std::{
    ops::RangeInclusive,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use thiserror::Error;
use tokio::time::{self, Instant};

use crate::{
    error::ExtractError,
    prelude::*,
    retry::{retry_result_ok, retry_result_transient, try_potentially_transient},
};

use super::{OcrService, OperationId, OperationStatus, ReadOperationResult};

/// How to poll an OCR job.
#[derive(Clone, Debug, PartialEq)]
pub struct PollPolicy {
    /// How long to wait after submitting, before the first status check.
    pub initial_delay: Duration,

    /// The shortest wait between status checks.
    pub min_backoff: Duration,

    /// The longest wait between status checks.
    pub max_backoff: Duration,

    /// How many times we re-check a pending job before giving up.
    pub max_attempts: u8,

    /// Random variation applied to each wait, between 0.0 and 1.0.
    pub jitter_ratio: f32,

    /// An upper bound on total polling time, including `initial_delay`.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2_000),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(10_000),
            max_attempts: 60,
            jitter_ratio: 0.2,
            timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl PollPolicy {
    /// The range of waits between status checks, in milliseconds.
    fn backoff_range_millis(&self) -> RangeInclusive<u32> {
        let millis =
            |d: Duration| u32::try_from(d.as_millis()).unwrap_or(u32::MAX).max(1);
        let min = millis(self.min_backoff);
        let max = millis(self.max_backoff).max(min);
        min..=max
    }
}

/// The final answer from the OCR service.
#[derive(Debug)]
pub struct PollOutcome {
    /// The first non-pending response we saw.
    pub result: ReadOperationResult,

    /// How many status checks we made, including the last one.
    pub polls: u64,
}

/// The job hasn't finished yet. This is how a pending status travels through
/// [`keen_retry`] as a transient failure.
#[derive(Debug, Error)]
#[error("OCR job {operation_id} is still {status}")]
struct StillPending {
    operation_id: OperationId,
    status: OperationStatus,
}

/// Check the job status until it is `succeeded` or `failed`.
///
/// Both terminal statuses end the loop. Deciding what a `failed` job means is
/// up to the caller.
#[instrument(level = "debug", skip_all, fields(%operation_id))]
pub async fn poll_until_terminal(
    ocr: &dyn OcrService,
    operation_id: OperationId,
    policy: &PollPolicy,
) -> Result<PollOutcome> {
    let started = Instant::now();
    let polls = AtomicU64::new(0);

    let polling = async {
        if !policy.initial_delay.is_zero() {
            debug!(delay = ?policy.initial_delay, "Waiting before first status check");
            time::sleep(policy.initial_delay).await;
        }
        check_status(ocr, operation_id, &polls)
            .await
            .retry_with_async(|_| check_status(ocr, operation_id, &polls))
            .with_exponential_jitter(|| ExponentialJitter::FromBackoffRange {
                backoff_range_millis: policy.backoff_range_millis(),
                re_attempts: policy.max_attempts,
                jitter_ratio: policy.jitter_ratio,
            })
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                debug!(
                    "OCR job finished after {} pending checks",
                    retry_errors_list.len()
                )
            })
    };

    let resolved = match policy.timeout {
        Some(timeout) => match time::timeout(timeout, polling).await {
            Ok(resolved) => resolved,
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(?elapsed, "Gave up waiting for OCR job");
                return Err(ExtractError::OcrTimedOut {
                    operation_id,
                    elapsed,
                }
                .into());
            }
        },
        None => polling.await,
    };
    let polls = polls.load(Ordering::SeqCst);

    match resolved {
        ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
            info!(status = %output.status, polls, "OCR job reached a terminal status");
            Ok(PollOutcome {
                result: output,
                polls,
            })
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        ResolvedResult::GivenUp { fatal_error, .. } => {
            if fatal_error.downcast_ref::<StillPending>().is_some() {
                error!(polls, "OCR job still pending after exhausting all polls");
                Err(ExtractError::OcrPollingExhausted {
                    operation_id,
                    polls,
                }
                .into())
            } else {
                error!(polls, "FAILED after exhausting all polls with error {fatal_error:?}");
                Err(fatal_error.context(format!(
                    "gave up on OCR job {operation_id} after {polls} status checks"
                )))
            }
        }
    }
}

/// Check the job status once.
async fn check_status(
    ocr: &dyn OcrService,
    operation_id: OperationId,
    polls: &AtomicU64,
) -> RetryResult<(), (), ReadOperationResult, anyhow::Error> {
    let attempt = polls.fetch_add(1, Ordering::SeqCst) + 1;
    let result = try_potentially_transient!(ocr.read_result(operation_id).await);
    debug!(attempt, status = %result.status, "Waiting to read the results");
    if result.status.is_pending() {
        retry_result_transient(anyhow::Error::new(StillPending {
            operation_id,
            status: result.status,
        }))
    } else {
        retry_result_ok(result)
    }
}
