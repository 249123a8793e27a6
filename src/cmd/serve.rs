//! The `serve` subcommand: an HTTP webhook for blob-created events.
//!
//! This can sit behind Event Grid directly (`POST /api/events`), or run as an
//! Azure Functions custom handler. For custom handlers, the Functions host
//! wraps trigger data in an invoke envelope and POSTs it to `/{function}`, and
//! HTTP-triggered functions with request forwarding arrive at
//! `/api/{function}` as plain Event Grid deliveries.
//!
//! Each event is processed sequentially within its request, and any failure
//! becomes a 500 so the sender's own retry and dead-letter policies kick in.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Args;
use serde_json::Map;
use tokio::net::TcpListener;

use crate::{
    config::ExtractorOpts,
    pipeline::{ExtractionReport, Extractor},
    prelude::*,
    trigger::{TriggerBatch, TriggerEvent, ValidationResponse},
};

/// Serve command line arguments.
#[derive(Args)]
pub struct ServeOpts {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1:7071")]
    pub listen: SocketAddr,

    /// Port to listen on, overriding the port in `--listen`. Set by the
    /// Functions host for custom handlers.
    #[clap(long, env = "FUNCTIONS_CUSTOMHANDLER_PORT")]
    pub port: Option<u16>,

    /// Function name accepted at `POST /{function}` and `POST /api/{function}`.
    #[clap(long, default_value = "TextExtractor")]
    pub function_name: String,

    /// Name of the trigger binding in custom handler invocations. If the
    /// invocation carries exactly one binding, we use it whatever its name.
    #[clap(long, default_value = "eventGridEvent")]
    pub trigger_binding: String,

    #[clap(flatten)]
    pub extractor: ExtractorOpts,
}

impl ServeOpts {
    /// The address we actually bind.
    fn listen_addr(&self) -> SocketAddr {
        match self.port {
            Some(port) => SocketAddr::new(self.listen.ip(), port),
            None => self.listen,
        }
    }
}

/// Shared state for our handlers.
#[derive(Clone)]
pub struct AppState {
    extractor: Arc<Extractor>,
    function_name: Arc<str>,
    trigger_binding: Arc<str>,
}

impl AppState {
    pub fn new(extractor: Extractor, function_name: &str, trigger_binding: &str) -> Self {
        Self {
            extractor: Arc::new(extractor),
            function_name: Arc::from(function_name),
            trigger_binding: Arc::from(trigger_binding),
        }
    }
}

/// The body the Functions host sends a custom handler for non-HTTP triggers.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvokeRequest {
    /// Input bindings, by name. The trigger binding carries our event.
    #[serde(default)]
    data: Map<String, Value>,
}

/// The body the Functions host expects back from a custom handler.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct InvokeResponse {
    outputs: Map<String, Value>,
    logs: Vec<String>,
    return_value: Value,
}

/// Build our routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/events", post(events))
        .route("/api/{function}", post(function))
        .route("/{function}", post(invoke))
        .with_state(state)
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    let extractor = opts.extractor.build_extractor().await?;
    let app = router(AppState::new(extractor, &opts.function_name, &opts.trigger_binding));

    let addr = opts.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(%addr, function = %opts.function_name, "Listening for blob events");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl-C.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn health() -> &'static str {
    "ok"
}

async fn events(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch(&state.extractor, &body).await
}

async fn function(
    State(state): State<AppState>,
    AxumPath(function): AxumPath<String>,
    body: Bytes,
) -> Response {
    if function != *state.function_name {
        warn!(%function, "Request for unknown function");
        return error_response(StatusCode::NOT_FOUND, format!("unknown function {function:?}"));
    }
    dispatch(&state.extractor, &body).await
}

/// Handle a request body containing one or more events.
#[instrument(level = "debug", skip_all, fields(bytes = body.len()))]
async fn dispatch(extractor: &Extractor, body: &[u8]) -> Response {
    let events = match serde_json::from_slice::<TriggerBatch>(body) {
        Ok(batch) => batch.into_events(),
        Err(err) => {
            warn!("Malformed trigger payload: {err}");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("malformed trigger payload: {err}"),
            );
        }
    };

    if let Some(code) = events.iter().find_map(|event| event.validation_code()) {
        info!("Answering subscription validation handshake");
        return Json(ValidationResponse {
            validation_response: code.to_owned(),
        })
        .into_response();
    }

    match run_events(extractor, &events).await {
        Ok(reports) => Json(reports).into_response(),
        // Already logged by the extractor.
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

/// Handle a custom handler invocation from the Functions host.
#[instrument(level = "debug", skip_all, fields(%function, bytes = body.len()))]
async fn invoke(
    State(state): State<AppState>,
    AxumPath(function): AxumPath<String>,
    body: Bytes,
) -> Response {
    if function != *state.function_name {
        warn!(%function, "Invocation of unknown function");
        return error_response(StatusCode::NOT_FOUND, format!("unknown function {function:?}"));
    }
    let events = match serde_json::from_slice::<InvokeRequest>(&body)
        .context("malformed invoke request")
        .and_then(|request| trigger_events(request, &state.trigger_binding))
    {
        Ok(events) => events,
        Err(err) => {
            warn!("Bad invocation: {err:#}");
            let logs = vec![format!("{err:#}")];
            return invoke_response(StatusCode::BAD_REQUEST, logs, Value::Null);
        }
    };

    match run_events(&state.extractor, &events).await {
        Ok(reports) => {
            let logs = reports
                .iter()
                .map(|report| match &report.extracted_blob {
                    Some(blob) => format!("Extracted text from {} to {blob}", report.blob_url),
                    None => format!("Skipped {}", report.blob_url),
                })
                .collect();
            invoke_response(StatusCode::OK, logs, json!(reports))
        }
        Err(err) => invoke_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            vec![format!("{err:#}")],
            Value::Null,
        ),
    }
}

/// Find the trigger events in an invoke request.
fn trigger_events(request: InvokeRequest, trigger_binding: &str) -> Result<Vec<TriggerEvent>> {
    let mut data = request.data;
    let value = match data.remove(trigger_binding) {
        Some(value) => value,
        None if data.len() == 1 => data.into_iter().next().map(|(_, v)| v).unwrap_or_default(),
        None => {
            return Err(anyhow!(
                "invocation has no {trigger_binding:?} binding (found: {:?})",
                data.keys().collect::<Vec<_>>()
            ));
        }
    };
    // The host sometimes passes trigger data as a JSON string.
    let batch = match value {
        Value::String(json) => TriggerBatch::from_json(&json)?,
        value => serde_json::from_value::<TriggerBatch>(value)
            .context("failed to parse trigger payload")?,
    };
    Ok(batch.into_events())
}

/// Run the pipeline for each event, stopping at the first failure.
async fn run_events(
    extractor: &Extractor,
    events: &[TriggerEvent],
) -> Result<Vec<ExtractionReport>> {
    let mut reports = Vec::with_capacity(events.len());
    for event in events {
        reports.push(extractor.run(event).await?);
    }
    Ok(reports)
}

fn invoke_response(status: StatusCode, logs: Vec<String>, return_value: Value) -> Response {
    let body = InvokeResponse {
        logs,
        return_value,
        ..InvokeResponse::default()
    };
    (status, Json(body)).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
