//! Sending extracted text to an OpenAI-compatible completion endpoint.
//!
//! We support both the legacy `/completions` body (a single `prompt` string)
//! and the `/chat/completions` body (a list of messages). The endpoint is a
//! full URL, so this works with OpenAI, Azure OpenAI deployments, LiteLLM and
//! similar gateways.

use std::time::Duration;

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, CreateCompletionRequestArgs, FinishReason,
};
use clap::ValueEnum;
use reqwest::StatusCode;
use tokio::time;
use url::Url;

use crate::prelude::*;

/// Which request body format the endpoint expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum CompletionStyle {
    /// Legacy completions: `{"prompt": ...}`, answer in `choices[0].text`.
    #[default]
    Prompt,

    /// Chat completions: `{"messages": [...]}`, answer in
    /// `choices[0].message.content`.
    Chat,
}

impl CompletionStyle {
    /// A reasonable model for this style, if the user doesn't pick one.
    pub fn default_model(self) -> &'static str {
        match self {
            CompletionStyle::Prompt => "gpt-3.5-turbo-instruct",
            CompletionStyle::Chat => "gpt-4o-mini",
        }
    }
}

/// What happened when we asked for a completion.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// The endpoint answered.
    Completed {
        /// The generated text.
        text: String,
        /// The full response body.
        raw: String,
    },

    /// The endpoint refused, with a non-success HTTP status.
    Rejected {
        /// The status we got.
        status: StatusCode,
        /// The response body, for the logs.
        body: String,
    },
}

/// Interface to a text completion service.
#[async_trait]
pub trait CompletionService: Send + Sync + 'static {
    /// Ask for a completion of `prompt`.
    ///
    /// A non-success HTTP status is reported as
    /// [`CompletionOutcome::Rejected`], not as an error.
    async fn complete(&self, prompt: &str) -> Result<CompletionOutcome>;
}

/// Client for OpenAI-compatible completion endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiCompletionClient {
    /// The HTTP client.
    client: reqwest::Client,

    /// The full URL we POST to.
    endpoint: Url,

    /// Bearer token.
    key: String,

    /// Model name to put in the request body.
    model: String,

    /// Which body format to use.
    style: CompletionStyle,

    /// Upper limit on generated tokens.
    max_tokens: u32,

    /// How long to wait for the whole response.
    timeout: Option<Duration>,
}

impl OpenAiCompletionClient {
    /// Create a new client.
    pub fn new(
        endpoint: &str,
        key: &str,
        model: &str,
        style: CompletionStyle,
        max_tokens: u32,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid completion endpoint {endpoint:?}"))?;
        if key.trim().is_empty() {
            return Err(anyhow!("completion API key is empty"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            key: key.to_owned(),
            model: model.to_owned(),
            style,
            max_tokens,
            timeout,
        })
    }

    /// Build our request body.
    fn request_body(&self, prompt: &str) -> Result<Value> {
        let body = match self.style {
            CompletionStyle::Prompt => {
                let req = CreateCompletionRequestArgs::default()
                    .model(self.model.clone())
                    .prompt(prompt)
                    .max_tokens(self.max_tokens)
                    .build()
                    .context("Error building request")?;
                serde_json::to_value(req)
            }
            CompletionStyle::Chat => {
                let message = ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()
                    .context("Error building message")?;
                let messages: Vec<ChatCompletionRequestMessage> = vec![message.into()];
                // Plenty of gateways still only understand `max_tokens`.
                #[allow(deprecated)]
                let req = CreateChatCompletionRequestArgs::default()
                    .model(self.model.clone())
                    .messages(messages)
                    .max_tokens(self.max_tokens)
                    .build()
                    .context("Error building request")?;
                serde_json::to_value(req)
            }
        };
        body.context("Error serializing request")
    }

    /// Pull the generated text out of a successful response.
    ///
    /// We only insist on the fields we actually use, because gateways differ
    /// in which of the others they bother to send.
    fn response_text(&self, raw: &str) -> Result<String> {
        let response = serde_json::from_str::<CompletionResponse>(raw)
            .context("Error parsing completion response")?;
        if let Some(usage) = &response.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Token usage"
            );
        }
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No choices in completion response"))?;
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return Err(anyhow!("Content filter triggered"));
        }
        match self.style {
            CompletionStyle::Prompt => choice
                .text
                .ok_or_else(|| anyhow!("No `text` in completion choice")),
            CompletionStyle::Chat => {
                let message = choice
                    .message
                    .ok_or_else(|| anyhow!("No `message` in chat completion choice"))?;
                Ok(message.content.unwrap_or_default())
            }
        }
    }
}

/// The parts of a completion response we read. This covers both the legacy
/// and chat shapes.
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    /// Legacy completions.
    #[serde(default)]
    text: Option<String>,
    /// Chat completions.
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default, deserialize_with = "lenient_finish_reason")]
    finish_reason: Option<FinishReason>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

/// Unknown finish reasons are treated as absent instead of failing the parse.
fn lenient_finish_reason<'de, D>(deserializer: D) -> Result<Option<FinishReason>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

#[async_trait]
impl CompletionService for OpenAiCompletionClient {
    #[instrument(level = "debug", skip_all, fields(model = %self.model, style = ?self.style))]
    async fn complete(&self, prompt: &str) -> Result<CompletionOutcome> {
        let body = self.request_body(prompt)?;
        trace!(%body, "Request");

        let request = async {
            let response = self
                .client
                .post(self.endpoint.clone())
                .bearer_auth(&self.key)
                .json(&body)
                .send()
                .await
                .context("failed to call completion endpoint")?;
            let status = response.status();
            let raw = response
                .text()
                .await
                .context("failed to read completion response")?;
            Ok::<_, anyhow::Error>((status, raw))
        };
        let (status, raw) = match self.timeout {
            Some(timeout) => time::timeout(timeout, request)
                .await
                .map_err(|_| anyhow!("completion request timed out after {timeout:?}"))??,
            None => request.await?,
        };
        if !status.is_success() {
            return Ok(CompletionOutcome::Rejected { status, body: raw });
        }
        debug!(%raw, "Completion response");
        let text = self.response_text(&raw)?;
        Ok(CompletionOutcome::Completed { text, raw })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Json, Router, extract::State, http::HeaderMap, response::IntoResponse,
        routing::post,
    };
    use tokio::net::TcpListener;

    use super::*;

    /// Requests our fake endpoint received: (authorization header, body).
    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    /// Start a fake completion endpoint that always answers with `status`
    /// and `response`.
    async fn fake_endpoint(status: StatusCode, response: Value) -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/v1/completions",
                post(
                    move |State(seen): State<Seen>,
                          headers: HeaderMap,
                          Json(body): Json<Value>| {
                        let response = response.clone();
                        async move {
                            let auth = headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_owned();
                            seen.lock().unwrap().push((auth, body));
                            (status, Json(response)).into_response()
                        }
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/v1/completions"), seen)
    }

    fn client(endpoint: &str, style: CompletionStyle) -> OpenAiCompletionClient {
        OpenAiCompletionClient::new(
            endpoint,
            "sk-test",
            style.default_model(),
            style,
            200,
            Some(Duration::from_secs(10)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_prompt_style() {
        let (endpoint, seen) = fake_endpoint(
            StatusCode::OK,
            json!({
                "id": "cmpl-1",
                "object": "text_completion",
                "created": 1700000000,
                "model": "gpt-3.5-turbo-instruct",
                "choices": [{"text": "Bonjour / Hello", "index": 0, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14}
            }),
        )
        .await;
        let outcome = client(&endpoint, CompletionStyle::Prompt)
            .complete("Fix: Bonjur")
            .await
            .unwrap();
        match outcome {
            CompletionOutcome::Completed { text, raw } => {
                assert_eq!(text, "Bonjour / Hello");
                assert!(raw.contains("cmpl-1"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth, "Bearer sk-test");
        assert_eq!(body["prompt"], "Fix: Bonjur");
        assert_eq!(body["max_tokens"], 200);
        assert_eq!(body["model"], "gpt-3.5-turbo-instruct");
    }

    #[tokio::test]
    async fn test_chat_style() {
        let (endpoint, seen) = fake_endpoint(
            StatusCode::OK,
            json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "gpt-4o-mini",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello"},
                    "finish_reason": "stop"
                }]
            }),
        )
        .await;
        let outcome = client(&endpoint, CompletionStyle::Chat)
            .complete("Translate: Bonjour")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompletionOutcome::Completed { ref text, .. } if text == "Hello"
        ));

        let seen = seen.lock().unwrap();
        let (_, body) = &seen[0];
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Translate: Bonjour");
        assert_eq!(body["max_tokens"], 200);
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[tokio::test]
    async fn test_minimal_responses() {
        let (endpoint, _seen) =
            fake_endpoint(StatusCode::OK, json!({"choices": [{"text": "Bonjour"}]})).await;
        let outcome = client(&endpoint, CompletionStyle::Prompt)
            .complete("Fix: Bonjur")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompletionOutcome::Completed { ref text, .. } if text == "Bonjour"
        ));

        let (endpoint, _seen) = fake_endpoint(
            StatusCode::OK,
            json!({"choices": [{"message": {"content": "Hello"}, "finish_reason": "eos"}]}),
        )
        .await;
        let outcome = client(&endpoint, CompletionStyle::Chat)
            .complete("Translate: Bonjour")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompletionOutcome::Completed { ref text, .. } if text == "Hello"
        ));
    }

    #[test]
    fn test_content_filter_is_an_error() {
        let client = client("http://127.0.0.1:9/", CompletionStyle::Chat);
        let raw = r#"{"choices": [{"message": {"content": null}, "finish_reason": "content_filter"}]}"#;
        assert!(client.response_text(raw).is_err());
        let raw = r#"{"choices": []}"#;
        assert!(client.response_text(raw).is_err());
    }

    #[tokio::test]
    async fn test_server_error_is_rejected_not_failed() {
        let (endpoint, _seen) = fake_endpoint(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": {"message": "boom"}}),
        )
        .await;
        let outcome = client(&endpoint, CompletionStyle::Prompt)
            .complete("Fix: Bonjur")
            .await
            .unwrap();
        match outcome {
            CompletionOutcome::Rejected { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert!(body.contains("boom"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_success_is_an_error() {
        let (endpoint, _seen) = fake_endpoint(StatusCode::OK, json!({"nope": true})).await;
        let result = client(&endpoint, CompletionStyle::Prompt)
            .complete("Fix: Bonjur")
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let new = |endpoint: &str, key: &str| {
            OpenAiCompletionClient::new(endpoint, key, "m", CompletionStyle::Prompt, 1, None)
        };
        assert!(new("not a url", "k").is_err());
        assert!(new("https://api.openai.com/v1/completions", "").is_err());
        assert!(new("https://api.openai.com/v1/completions", "k").is_ok());
    }
}
