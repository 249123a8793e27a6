//! OCR using the Azure Computer Vision Read API (v3.2).

use std::time::Duration;

use reqwest::header::HeaderName;
use url::Url;

use crate::{prelude::*, retry::UnexpectedStatus};

use super::{OcrService, OperationId, ReadOperationResult};

/// Header carrying the API key.
const SUBSCRIPTION_KEY_HEADER: HeaderName =
    HeaderName::from_static("ocp-apim-subscription-key");

/// Header carrying the URL of the submitted job.
const OPERATION_LOCATION_HEADER: HeaderName =
    HeaderName::from_static("operation-location");

/// Service name for error messages.
const SERVICE: &str = "Computer Vision";

/// Client for the Computer Vision Read API.
#[derive(Debug, Clone)]
pub struct ComputerVisionClient {
    /// The HTTP client.
    client: reqwest::Client,

    /// Resource endpoint, like `https://myvision.cognitiveservices.azure.com/`.
    endpoint: Url,

    /// API key.
    key: String,
}

impl ComputerVisionClient {
    /// Create a new client.
    ///
    /// An unusable endpoint or an empty key is reported here, rather than on
    /// the first request.
    pub fn new(endpoint: &str, key: &str, request_timeout: Duration) -> Result<Self> {
        if key.trim().is_empty() {
            return Err(anyhow!("Computer Vision key is empty"));
        }
        let mut endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid Computer Vision endpoint {endpoint:?}"))?;
        if endpoint.cannot_be_a_base() {
            return Err(anyhow!("invalid Computer Vision endpoint {endpoint}"));
        }
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            key: key.to_owned(),
        })
    }

    /// Build an API URL relative to our endpoint.
    fn api_url(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path)
            .with_context(|| format!("failed to build URL for {path:?}"))
    }
}

#[async_trait]
impl OcrService for ComputerVisionClient {
    #[instrument(level = "debug", skip(self))]
    async fn submit_read(
        &self,
        image_url: &str,
        language: Option<&str>,
    ) -> Result<OperationId> {
        let mut url = self.api_url("vision/v3.2/read/analyze")?;
        if let Some(language) = language {
            url.query_pairs_mut().append_pair("language", language);
        }

        let response = self
            .client
            .post(url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.key)
            .json(&json!({ "url": image_url }))
            .send()
            .await
            .context("failed to submit OCR job")?;
        // The service answers 202 Accepted.
        if !response.status().is_success() {
            return Err(UnexpectedStatus::from_response(SERVICE, response).await)
                .context("failed to submit OCR job");
        }

        let location = response
            .headers()
            .get(OPERATION_LOCATION_HEADER)
            .ok_or_else(|| anyhow!("OCR submission response had no Operation-Location"))?
            .to_str()
            .context("Operation-Location header is not valid text")?;
        debug!(%location, "OperationLocation");
        let operation_id = OperationId::from_operation_location(location)?;
        debug!(%operation_id, "OperationId");
        Ok(operation_id)
    }

    #[instrument(level = "trace", skip(self))]
    async fn read_result(
        &self,
        operation_id: OperationId,
    ) -> Result<ReadOperationResult> {
        let url =
            self.api_url(&format!("vision/v3.2/read/analyzeResults/{operation_id}"))?;
        let response = self
            .client
            .get(url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.key)
            .send()
            .await
            .context("failed to query OCR job")?;
        if !response.status().is_success() {
            return Err(UnexpectedStatus::from_response(SERVICE, response).await)
                .context("failed to query OCR job");
        }
        let result = response
            .json::<ReadOperationResult>()
            .await
            .context("failed to parse OCR job status")?;
        trace!(?result, "OCR job status");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Json, Router,
        extract::{Path as AxumPath, Query, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::{get, post},
    };
    use reqwest::StatusCode;
    use tokio::net::TcpListener;

    use super::*;
    use crate::ocr::{OperationStatus, assemble_text};

    const JOB_ID: &str = "49a36324-fc4b-4387-aa06-090cfbf0064f";

    /// What our fake service saw.
    #[derive(Default)]
    struct Seen {
        keys: Vec<String>,
        languages: Vec<Option<String>>,
        bodies: Vec<Value>,
        polls: usize,
    }

    type Shared = Arc<Mutex<Seen>>;

    fn key_of(headers: &HeaderMap) -> String {
        headers
            .get("ocp-apim-subscription-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    }

    async fn analyze(
        State(seen): State<Shared>,
        Query(query): Query<std::collections::HashMap<String, String>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let mut seen = seen.lock().unwrap();
        seen.keys.push(key_of(&headers));
        seen.languages.push(query.get("language").cloned());
        seen.bodies.push(body);
        let location = format!(
            "https://fake.cognitiveservices.azure.com/vision/v3.2/read/analyzeResults/{JOB_ID}"
        );
        (AxumStatus::ACCEPTED, [("Operation-Location", location)])
    }

    async fn analyze_results(
        State(seen): State<Shared>,
        AxumPath(id): AxumPath<String>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        let mut seen = seen.lock().unwrap();
        seen.keys.push(key_of(&headers));
        if id != JOB_ID {
            return (AxumStatus::NOT_FOUND, Json(json!({"error": "unknown"})));
        }
        seen.polls += 1;
        if seen.polls < 2 {
            return (AxumStatus::OK, Json(json!({"status": "running"})));
        }
        (
            AxumStatus::OK,
            Json(json!({
                "status": "succeeded",
                "analyzeResult": {
                    "readResults": [
                        {"page": 1, "lines": [{"text": "Bonjour"}, {"text": "tout"}]},
                        {"page": 2, "lines": [{"text": "le monde"}]}
                    ]
                }
            })),
        )
    }

    /// Start a fake Computer Vision service and return its base URL.
    async fn fake_vision_service(seen: Shared) -> String {
        let app = Router::new()
            .route("/vision/v3.2/read/analyze", post(analyze))
            .route("/vision/v3.2/read/analyzeResults/{id}", get(analyze_results))
            .with_state(seen);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_submit_and_read() {
        let seen = Shared::default();
        let endpoint = fake_vision_service(seen.clone()).await;
        let client =
            ComputerVisionClient::new(&endpoint, "secret", Duration::from_secs(10)).unwrap();

        let id = client
            .submit_read("https://acct.blob.core.windows.net/c/photo.jpg", Some("fr"))
            .await
            .unwrap();
        assert_eq!(id.to_string(), JOB_ID);

        let first = client.read_result(id).await.unwrap();
        assert_eq!(first.status, OperationStatus::Running);
        let second = client.read_result(id).await.unwrap();
        assert_eq!(second.status, OperationStatus::Succeeded);
        assert_eq!(
            assemble_text(second.analyze_result.as_ref().unwrap()),
            "Bonjour\ntout\nle monde\n"
        );

        let seen = seen.lock().unwrap();
        assert!(seen.keys.iter().all(|k| k == "secret"));
        assert_eq!(seen.languages, vec![Some("fr".to_owned())]);
        assert_eq!(
            seen.bodies,
            vec![json!({"url": "https://acct.blob.core.windows.net/c/photo.jpg"})]
        );
    }

    #[tokio::test]
    async fn test_error_statuses_are_reported() {
        let app = Router::new().route(
            "/vision/v3.2/read/analyze",
            post(|| async { (AxumStatus::UNAUTHORIZED, "Access denied") }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = ComputerVisionClient::new(
            &format!("http://{addr}/"),
            "wrong",
            Duration::from_secs(10),
        )
        .unwrap();
        let err = client
            .submit_read("https://a/c/photo.jpg", None)
            .await
            .unwrap_err();
        let status = err.downcast_ref::<UnexpectedStatus>().map(|e| e.status);
        assert_eq!(status, Some(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_rejects_bad_configuration() {
        assert!(ComputerVisionClient::new("https://x/", " ", Duration::from_secs(1)).is_err());
        assert!(ComputerVisionClient::new("not a url", "k", Duration::from_secs(1)).is_err());
    }
}
