//! Trigger payloads.
//!
//! We accept Event Grid events (blob URL at `data.url`) and bare blob-created
//! payloads (blob URL at `url`). Event Grid delivers events in arrays, and
//! expects a handshake before it will deliver anything at all.

use schemars::JsonSchema;
use serde_json::Map;

use crate::{error::ExtractError, prelude::*};

/// Event type for new blobs.
pub const BLOB_CREATED_EVENT: &str = "Microsoft.Storage.BlobCreated";

/// Event type for the Event Grid webhook handshake.
pub const SUBSCRIPTION_VALIDATION_EVENT: &str =
    "Microsoft.EventGrid.SubscriptionValidationEvent";

/// A notification that a blob was created.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// Event ID, if delivered by Event Grid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Event type, for example `Microsoft.Storage.BlobCreated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Event subject, usually the blob path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Blob URL, for payloads that carry the event data at the top level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Blob type, for payloads that carry the event data at the top level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_type: Option<String>,

    /// Event data, for Event Grid events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BlobEventData>,

    /// Other fields.
    #[serde(flatten)]
    #[schemars(skip)]
    pub other: Map<String, Value>,
}

/// The `data` field of an Event Grid event.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobEventData {
    /// The URL of the new blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// `BlockBlob`, `AppendBlob` or `PageBlob`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_type: Option<String>,

    /// Content type reported by storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Handshake code, for subscription validation events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_code: Option<String>,

    /// Other fields.
    #[serde(flatten)]
    #[schemars(skip)]
    pub other: Map<String, Value>,
}

impl TriggerEvent {
    /// Parse a single event from JSON.
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse trigger payload")
    }

    /// Build an event for a blob URL, as a bare blob-created payload.
    pub fn for_blob_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// The URL of the blob that triggered us. Top-level `url` wins over
    /// `data.url`.
    pub fn blob_url(&self) -> Result<&str, ExtractError> {
        self.url
            .as_deref()
            .or_else(|| self.data.as_ref().and_then(|d| d.url.as_deref()))
            .filter(|url| !url.trim().is_empty())
            .ok_or(ExtractError::MissingBlobUrl)
    }

    /// The blob type, if the payload told us.
    pub fn blob_type(&self) -> Option<&str> {
        self.blob_type
            .as_deref()
            .or_else(|| self.data.as_ref().and_then(|d| d.blob_type.as_deref()))
    }

    /// If this is an Event Grid subscription handshake, return the code we
    /// need to echo back.
    pub fn validation_code(&self) -> Option<&str> {
        if self.event_type.as_deref() != Some(SUBSCRIPTION_VALIDATION_EVENT) {
            return None;
        }
        self.data.as_ref().and_then(|d| d.validation_code.as_deref())
    }
}

/// Event Grid sends arrays of events, but we also accept a single object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TriggerBatch {
    /// Several events.
    Many(Vec<TriggerEvent>),
    /// Just one event.
    One(Box<TriggerEvent>),
}

impl TriggerBatch {
    /// Parse one event or an array of events.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse trigger payload")
    }

    /// Convert to a list of events.
    pub fn into_events(self) -> Vec<TriggerEvent> {
        match self {
            TriggerBatch::Many(events) => events,
            TriggerBatch::One(event) => vec![*event],
        }
    }
}

/// Response body for a subscription validation handshake.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    /// The code from the validation event.
    pub validation_response: String,
}
