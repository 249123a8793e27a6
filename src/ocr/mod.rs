//! OCR using an asynchronous "read" service.
//!
//! The service works in two phases. We submit the URL of an image, and get
//! back an `Operation-Location` header naming a job. Then we ask about that
//! job until it reaches a terminal status, at which point the response
//! contains the recognized text, page by page and line by line.

use std::fmt;

use uuid::Uuid;

use crate::{error::ExtractError, prelude::*};

pub mod poll;
pub mod vision;

/// The number of characters in an operation ID (a hyphenated UUID).
pub const OPERATION_ID_LEN: usize = 36;

/// Identifies a running OCR job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Extract the operation ID from an `Operation-Location` URL. The ID is
    /// the last 36 characters, and it must be a UUID.
    pub fn from_operation_location(location: &str) -> Result<Self, ExtractError> {
        let invalid = || ExtractError::InvalidOperationLocation {
            location: location.to_owned(),
        };
        let location = location.trim();
        let start = location
            .len()
            .checked_sub(OPERATION_ID_LEN)
            .ok_or_else(invalid)?;
        let tail = location.get(start..).ok_or_else(invalid)?;
        let uuid = Uuid::try_parse(tail).map_err(|_| invalid())?;
        Ok(Self(uuid))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// The status of an OCR job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    /// Queued.
    NotStarted,
    /// In progress.
    Running,
    /// Done, with results.
    Succeeded,
    /// Done, without results.
    Failed,
}

impl OperationStatus {
    /// Should we keep waiting?
    pub fn is_pending(self) -> bool {
        matches!(self, OperationStatus::NotStarted | OperationStatus::Running)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::NotStarted => "notStarted",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A response to a status query.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOperationResult {
    /// Where the job is at.
    pub status: OperationStatus,

    /// The results, once the job has succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyze_result: Option<AnalyzeResult>,
}

/// Recognized text for a whole document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResult {
    /// One entry per page, in document order.
    #[serde(default)]
    pub read_results: Vec<ReadResult>,
}

/// Recognized text for a single page.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    /// Page number, starting at 1.
    #[serde(default)]
    pub page: u32,

    /// Lines, in reading order.
    #[serde(default)]
    pub lines: Vec<Line>,
}

/// A single line of text.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Line {
    /// The text of the line.
    pub text: String,
}

impl AnalyzeResult {
    /// Build a result from plain text, one inner `Vec` per page.
    #[cfg(test)]
    pub fn from_pages(pages: &[&[&str]]) -> Self {
        let read_results = pages
            .iter()
            .enumerate()
            .map(|(idx, lines)| ReadResult {
                page: u32::try_from(idx + 1).expect("too many pages"),
                lines: lines
                    .iter()
                    .map(|text| Line {
                        text: (*text).to_owned(),
                    })
                    .collect(),
            })
            .collect();
        Self { read_results }
    }
}

/// Join every line of every page, each followed by a newline.
pub fn assemble_text(result: &AnalyzeResult) -> String {
    let mut text = String::new();
    for page in &result.read_results {
        for line in &page.lines {
            debug!(page = page.page, line = %line.text, "Recognized line");
            text.push_str(&line.text);
            text.push('\n');
        }
    }
    text
}

/// Interface to an asynchronous OCR service.
#[async_trait]
pub trait OcrService: Send + Sync + 'static {
    /// Start reading the image at `image_url`. `language` is an optional
    /// hint, like `"fr"`.
    async fn submit_read(
        &self,
        image_url: &str,
        language: Option<&str>,
    ) -> Result<OperationId>;

    /// Ask about a job we submitted earlier.
    async fn read_result(&self, operation_id: OperationId)
    -> Result<ReadOperationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_text_preserves_order() {
        let result = AnalyzeResult::from_pages(&[&["A", "B"], &["C"]]);
        assert_eq!(assemble_text(&result), "A\nB\nC\n");
    }

    #[test]
    fn test_assemble_text_empty() {
        assert_eq!(assemble_text(&AnalyzeResult::default()), "");
        let result = AnalyzeResult::from_pages(&[&[], &["only"]]);
        assert_eq!(assemble_text(&result), "only\n");
    }

    #[test]
    fn test_operation_id_from_location() {
        let location = "https://westeurope.api.cognitive.microsoft.com/vision/v3.2/read/analyzeResults/49a36324-fc4b-4387-aa06-090cfbf0064f";
        let id = OperationId::from_operation_location(location).unwrap();
        assert_eq!(id.to_string(), "49a36324-fc4b-4387-aa06-090cfbf0064f");
    }

    #[test]
    fn test_operation_id_rejects_bad_locations() {
        for location in [
            "",
            "49a36324-fc4b",
            "https://example.com/vision/v3.2/read/analyzeResults/not-a-uuid-but-thirty-six-chars!!",
        ] {
            let err = OperationId::from_operation_location(location).unwrap_err();
            assert!(
                matches!(err, ExtractError::InvalidOperationLocation { .. }),
                "unexpected error for {location:?}: {err:?}"
            );
        }
    }

    #[test]
    fn test_parse_read_result() {
        let result: ReadOperationResult = serde_json::from_value(json!({
            "status": "succeeded",
            "createdDateTime": "2024-01-01T00:00:00Z",
            "analyzeResult": {
                "version": "3.2.0",
                "readResults": [{
                    "page": 1,
                    "angle": 0.0,
                    "lines": [
                        {"boundingBox": [0, 0, 1, 1], "text": "Bonjour", "words": []},
                        {"text": "le monde"}
                    ]
                }]
            }
        }))
        .unwrap();
        assert_eq!(result.status, OperationStatus::Succeeded);
        let text = assemble_text(result.analyze_result.as_ref().unwrap());
        assert_eq!(text, "Bonjour\nle monde\n");

        let pending: ReadOperationResult =
            serde_json::from_value(json!({"status": "notStarted"})).unwrap();
        assert!(pending.status.is_pending());
        assert!(pending.analyze_result.is_none());
    }
}
