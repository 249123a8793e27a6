//! One invocation: image blob in, text blobs out.

use std::sync::Arc;

use schemars::JsonSchema;

use crate::{
    blob_name::{OutputNames, is_supported_format, parse_blob_url},
    completion::{CompletionOutcome, CompletionService},
    error::ExtractError,
    ocr::{
        OcrService, OperationId, OperationStatus, assemble_text,
        poll::{PollPolicy, poll_until_terminal},
    },
    prelude::*,
    prompt::PromptTemplate,
    storage::BlobStore,
    trigger::{BLOB_CREATED_EVENT, TriggerEvent},
};

/// Settings for the [`Extractor`].
#[derive(Clone, Debug)]
pub struct ExtractorConfig {
    /// Container that receives `<base>.json`.
    pub extracted_text_container: String,

    /// Optional OCR language hint.
    pub ocr_language: Option<String>,

    /// How we wait for OCR jobs.
    pub poll_policy: PollPolicy,

    /// Skip blobs that don't look like images or PDFs.
    pub supported_formats_only: bool,
}

/// The optional correction/translation pass.
pub struct TranslationStep {
    /// Container that receives `<base>_tranlation.json`.
    pub container: String,

    /// The prompt we wrap the extracted text in.
    pub prompt: PromptTemplate,

    /// Store the full response body instead of the generated text.
    pub store_raw_response: bool,

    /// Where we send the prompt.
    pub service: Arc<dyn CompletionService>,
}

/// What happened to the translation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TranslationOutcome {
    /// No completion endpoint is configured.
    Disabled,

    /// The blob was skipped before OCR, so there was nothing to translate.
    Skipped,

    /// The completion was stored.
    Stored {
        /// The name of the blob we wrote.
        blob_name: String,
    },

    /// The completion endpoint answered with a non-success status. Nothing
    /// was written.
    Rejected {
        /// The HTTP status code.
        status: u16,
    },
}

/// A summary of one successful invocation.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionReport {
    /// The blob that triggered us.
    pub blob_url: String,

    /// The base name used for output blobs.
    pub base_name: String,

    /// True if the blob was not an image or PDF, and we did nothing.
    #[serde(default)]
    pub skipped: bool,

    /// The OCR job ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub operation_id: Option<OperationId>,

    /// How many times we asked about the OCR job.
    #[serde(default)]
    pub polls: u64,

    /// The name of the extracted-text blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_blob: Option<String>,

    /// The size of the extracted text, in bytes.
    #[serde(default)]
    pub extracted_bytes: usize,

    /// What happened to the translation pass.
    pub translation: TranslationOutcome,
}

/// Runs the pipeline for trigger events.
pub struct Extractor {
    config: ExtractorConfig,
    ocr: Arc<dyn OcrService>,
    store: Arc<dyn BlobStore>,
    translation: Option<TranslationStep>,
}

impl Extractor {
    /// Create an extractor without a translation pass.
    pub fn new(
        config: ExtractorConfig,
        ocr: Arc<dyn OcrService>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            config,
            ocr,
            store,
            translation: None,
        }
    }

    /// Turn on the translation pass.
    pub fn with_translation(mut self, step: TranslationStep) -> Self {
        self.translation = Some(step);
        self
    }

    /// Will we run the translation pass?
    pub fn translates(&self) -> bool {
        self.translation.is_some()
    }

    /// Process one trigger event.
    ///
    /// Errors are logged here before being returned, so the host only needs
    /// to decide how to report them.
    #[instrument(level = "info", skip_all, fields(id = ?event.id))]
    pub async fn run(&self, event: &TriggerEvent) -> Result<ExtractionReport> {
        let result = self.run_inner(event).await;
        if let Err(err) = &result {
            match err.downcast_ref::<ExtractError>() {
                Some(extract_err) if extract_err.is_bad_trigger() => {
                    error!("Rejected trigger payload: {err:#}");
                }
                _ => error!("Extraction failed: {err:?}"),
            }
        }
        result
    }

    async fn run_inner(&self, event: &TriggerEvent) -> Result<ExtractionReport> {
        // Everything we can check locally happens before we call any service.
        if let Some(event_type) = event.event_type.as_deref() {
            if event_type != BLOB_CREATED_EVENT {
                warn!(%event_type, "Unexpected event type, processing anyway");
            }
        }
        let blob_url = event.blob_url()?;
        let url = parse_blob_url(blob_url)?;
        let names = OutputNames::from_url(&url)?;
        info!(
            %blob_url,
            blob_type = event.blob_type().unwrap_or("unknown"),
            base_name = %names.base_name,
            "Processing blob"
        );

        if self.config.supported_formats_only && !is_supported_format(&url) {
            info!(%blob_url, "Skipping blob with unsupported format");
            return Ok(ExtractionReport {
                blob_url: blob_url.to_owned(),
                base_name: names.base_name,
                skipped: true,
                operation_id: None,
                polls: 0,
                extracted_blob: None,
                extracted_bytes: 0,
                translation: TranslationOutcome::Skipped,
            });
        }

        let operation_id = self
            .ocr
            .submit_read(blob_url, self.config.ocr_language.as_deref())
            .await?;
        let outcome =
            poll_until_terminal(self.ocr.as_ref(), operation_id, &self.config.poll_policy)
                .await?;
        let analyze_result = match outcome.result.status {
            OperationStatus::Succeeded => outcome
                .result
                .analyze_result
                .ok_or(ExtractError::MissingAnalyzeResult { operation_id })?,
            OperationStatus::Failed => {
                return Err(ExtractError::OcrJobFailed { operation_id }.into());
            }
            status => {
                return Err(anyhow!(
                    "OCR job {operation_id} stopped polling while still {status}"
                ));
            }
        };
        let text = assemble_text(&analyze_result);

        let extracted_blob = names.extracted_text();
        self.store
            .write_blob(
                &self.config.extracted_text_container,
                &extracted_blob,
                text.clone().into_bytes(),
            )
            .await?;
        info!(
            container = %self.config.extracted_text_container,
            blob = %extracted_blob,
            bytes = text.len(),
            "Stored extracted text"
        );

        let translation = match &self.translation {
            Some(step) => self.translate(step, &names, &text).await?,
            None => TranslationOutcome::Disabled,
        };

        Ok(ExtractionReport {
            blob_url: blob_url.to_owned(),
            base_name: names.base_name,
            skipped: false,
            operation_id: Some(operation_id),
            polls: outcome.polls,
            extracted_blob: Some(extracted_blob),
            extracted_bytes: text.len(),
            translation,
        })
    }

    /// Run the translation pass on extracted text.
    #[instrument(level = "debug", skip_all, fields(container = %step.container))]
    async fn translate(
        &self,
        step: &TranslationStep,
        names: &OutputNames,
        text: &str,
    ) -> Result<TranslationOutcome> {
        let prompt = step.prompt.render(text)?;
        match step.service.complete(&prompt).await? {
            CompletionOutcome::Completed { text, raw } => {
                let blob_name = names.translation();
                let data = if step.store_raw_response { raw } else { text };
                self.store
                    .write_blob(&step.container, &blob_name, data.into_bytes())
                    .await?;
                info!(blob = %blob_name, "Stored translated text");
                Ok(TranslationOutcome::Stored { blob_name })
            }
            CompletionOutcome::Rejected { status, body } => {
                error!(%status, %body, "Failed to process the text. Status Code: {status}");
                Ok(TranslationOutcome::Rejected {
                    status: status.as_u16(),
                })
            }
        }
    }
}
