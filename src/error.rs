//! Domain errors for the extraction pipeline.
//!
//! Most plumbing uses [`anyhow`], but the failures below are ones that
//! callers (and the webhook host) may want to match on, so they get names.
//! They travel inside [`anyhow::Error`] and can be recovered with
//! `downcast_ref::<ExtractError>()`.

use std::time::Duration;

use thiserror::Error;

use crate::ocr::OperationId;

/// A named failure of one pipeline invocation.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The trigger payload had no `url` or `data.url` string.
    #[error("trigger payload has no `url` or `data.url` field")]
    MissingBlobUrl,

    /// The blob URL could not be parsed as an absolute URL.
    #[error("invalid blob URL {url:?}: {reason}")]
    InvalidBlobUrl { url: String, reason: String },

    /// The blob URL does not end in a usable file name.
    #[error("blob URL {url:?} has no file name to derive output names from")]
    EmptyBaseName { url: String },

    /// The OCR service returned an `Operation-Location` we can't use.
    #[error("cannot extract an operation ID from Operation-Location {location:?}")]
    InvalidOperationLocation { location: String },

    /// The OCR job reached the terminal `failed` status.
    #[error("OCR job {operation_id} failed")]
    OcrJobFailed { operation_id: OperationId },

    /// The OCR job succeeded, but the response had no `analyzeResult`.
    #[error("OCR job {operation_id} succeeded without an analyzeResult")]
    MissingAnalyzeResult { operation_id: OperationId },

    /// We used up our polling budget while the job was still pending.
    #[error("OCR job {operation_id} still pending after {polls} status checks")]
    OcrPollingExhausted {
        operation_id: OperationId,
        polls: u64,
    },

    /// The polling deadline passed while the job was still pending.
    #[error("OCR job {operation_id} still pending after {elapsed:?}")]
    OcrTimedOut {
        operation_id: OperationId,
        elapsed: Duration,
    },
}

impl ExtractError {
    /// Was this error caused by a bad trigger payload, rather than by one of
    /// the services we call?
    pub fn is_bad_trigger(&self) -> bool {
        matches!(
            self,
            ExtractError::MissingBlobUrl
                | ExtractError::InvalidBlobUrl { .. }
                | ExtractError::EmptyBaseName { .. }
        )
    }
}
