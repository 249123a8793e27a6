//! Configuration.
//!
//! Everything can be set with command-line flags, and most settings fall back
//! to the environment variable names used by the Azure Functions deployment
//! (which may also come from a `.env` file). We parse all of this once, at
//! startup, into explicit structs that we hand to the [`Extractor`].

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    completion::{CompletionStyle, OpenAiCompletionClient},
    ocr::{poll::PollPolicy, vision::ComputerVisionClient},
    pipeline::{Extractor, ExtractorConfig, TranslationStep},
    prelude::*,
    prompt::PromptTemplate,
    storage::OpendalBlobStore,
};

/// Everything we need to build an [`Extractor`].
#[derive(Args, Clone)]
pub struct ExtractorOpts {
    #[clap(flatten)]
    pub storage: StorageOpts,

    #[clap(flatten)]
    pub ocr: OcrOpts,

    #[clap(flatten)]
    pub poll: PollOpts,

    #[clap(flatten)]
    pub translation: TranslationOpts,
}

/// Blob storage options.
#[derive(Args, Clone)]
pub struct StorageOpts {
    /// Storage account connection string. Use `memory://` for a throwaway
    /// in-memory store.
    #[clap(long, env = "AzureWebJobsStorage", hide_env_values = true)]
    pub storage_connection_string: String,

    /// Container that receives extracted text.
    #[clap(long, env = "EXTRACTEDTEXT_CONTAINER_NAME")]
    pub extracted_text_container: String,
}

/// OCR service options.
#[derive(Args, Clone)]
pub struct OcrOpts {
    /// Computer Vision endpoint, like
    /// `https://<resource>.cognitiveservices.azure.com/`.
    #[clap(long, env = "VISION_ENDPOINT")]
    pub vision_endpoint: String,

    /// Computer Vision API key.
    #[clap(long, env = "VISION_KEY", hide_env_values = true)]
    pub vision_key: String,

    /// Language hint for OCR, like `fr`. By default the service guesses.
    #[clap(long, env = "VISION_LANGUAGE")]
    pub ocr_language: Option<String>,

    /// Timeout for each individual OCR request, in seconds.
    #[clap(long, default_value = "30")]
    pub ocr_request_timeout: u64,

    /// Skip blobs whose extension isn't an image format or PDF.
    #[clap(long)]
    pub supported_formats_only: bool,
}

/// Options controlling how we wait for OCR jobs.
#[derive(Args, Clone)]
pub struct PollOpts {
    /// Wait this long after submitting a job before checking on it, in
    /// milliseconds.
    #[clap(long, default_value = "2000")]
    pub poll_initial_delay_ms: u64,

    /// Shortest wait between status checks, in milliseconds.
    #[clap(long, default_value = "500", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_min_backoff_ms: u64,

    /// Longest wait between status checks, in milliseconds.
    #[clap(long, default_value = "10000", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_max_backoff_ms: u64,

    /// Give up after re-checking a pending job this many times.
    #[clap(long, default_value = "60", value_parser = clap::value_parser!(u8).range(1..))]
    pub poll_max_attempts: u8,

    /// Give up on a job after this many seconds. 0 means no limit.
    #[clap(long, default_value = "300")]
    pub poll_timeout: u64,
}

impl PollOpts {
    /// Convert to a [`PollPolicy`].
    pub fn to_policy(&self) -> Result<PollPolicy> {
        if self.poll_min_backoff_ms > self.poll_max_backoff_ms {
            return Err(anyhow!(
                "--poll-min-backoff-ms ({}) is larger than --poll-max-backoff-ms ({})",
                self.poll_min_backoff_ms,
                self.poll_max_backoff_ms
            ));
        }
        Ok(PollPolicy {
            initial_delay: Duration::from_millis(self.poll_initial_delay_ms),
            min_backoff: Duration::from_millis(self.poll_min_backoff_ms),
            max_backoff: Duration::from_millis(self.poll_max_backoff_ms),
            max_attempts: self.poll_max_attempts,
            timeout: (self.poll_timeout > 0).then(|| Duration::from_secs(self.poll_timeout)),
            ..PollPolicy::default()
        })
    }
}

/// Options for the optional correction/translation pass.
#[derive(Args, Clone)]
pub struct TranslationOpts {
    /// Completion endpoint URL. Setting this turns on the translation pass.
    #[clap(long, env = "OPENAI_ENDPOINT")]
    pub completion_endpoint: Option<String>,

    /// Bearer token for the completion endpoint.
    #[clap(long, env = "OPENAI_KEY", hide_env_values = true)]
    pub completion_key: Option<String>,

    /// Model to request. Defaults depend on `--completion-style`.
    #[clap(long, env = "OPENAI_MODEL")]
    pub completion_model: Option<String>,

    /// Request body format used by the completion endpoint.
    #[clap(long, value_enum, env = "OPENAI_API_STYLE", default_value_t = CompletionStyle::default())]
    pub completion_style: CompletionStyle,

    /// Upper limit on the number of generated tokens.
    #[clap(long, default_value = "200")]
    pub max_tokens: u32,

    /// Timeout for the completion request, in seconds.
    #[clap(long)]
    pub completion_timeout: Option<u64>,

    /// A file containing a Handlebars prompt template. `{{text}}` is replaced
    /// by the extracted text.
    #[clap(long)]
    pub prompt_template: Option<PathBuf>,

    /// Store the full JSON response instead of just the generated text.
    #[clap(long)]
    pub store_raw_response: bool,

    /// Container that receives completion output.
    #[clap(long, env = "TRANSLATEDTEXT_CONTAINER_NAME")]
    pub translated_text_container: Option<String>,

    /// Don't run the translation pass, even if an endpoint is configured.
    #[clap(long)]
    pub skip_translation: bool,
}

impl TranslationOpts {
    /// Build the translation step, if it's turned on.
    pub async fn to_translation_step(&self) -> Result<Option<TranslationStep>> {
        let Some(endpoint) = self.completion_endpoint.as_deref() else {
            return Ok(None);
        };
        if self.skip_translation {
            info!("Translation pass disabled by --skip-translation");
            return Ok(None);
        }
        let key = self.completion_key.as_deref().ok_or_else(|| {
            anyhow!("--completion-key (or OPENAI_KEY) is required with a completion endpoint")
        })?;
        let container = self.translated_text_container.clone().ok_or_else(|| {
            anyhow!(
                "--translated-text-container (or TRANSLATEDTEXT_CONTAINER_NAME) is required with a completion endpoint"
            )
        })?;
        let model = self
            .completion_model
            .as_deref()
            .unwrap_or_else(|| self.completion_style.default_model());

        let service = OpenAiCompletionClient::new(
            endpoint,
            key,
            model,
            self.completion_style,
            self.max_tokens,
            self.completion_timeout.map(Duration::from_secs),
        )?;
        let prompt = match &self.prompt_template {
            Some(path) => PromptTemplate::from_path(path).await?,
            None => PromptTemplate::default(),
        };
        Ok(Some(TranslationStep {
            container,
            prompt,
            store_raw_response: self.store_raw_response,
            service: Arc::new(service),
        }))
    }
}

impl ExtractorOpts {
    /// Build an [`Extractor`], connecting to real services.
    #[instrument(level = "debug", skip_all)]
    pub async fn build_extractor(&self) -> Result<Extractor> {
        let store =
            OpendalBlobStore::from_connection_string(&self.storage.storage_connection_string)?;
        let ocr = ComputerVisionClient::new(
            &self.ocr.vision_endpoint,
            &self.ocr.vision_key,
            Duration::from_secs(self.ocr.ocr_request_timeout),
        )?;
        let config = ExtractorConfig {
            extracted_text_container: self.storage.extracted_text_container.clone(),
            ocr_language: self.ocr.ocr_language.clone(),
            poll_policy: self.poll.to_policy()?,
            supported_formats_only: self.ocr.supported_formats_only,
        };
        let mut extractor = Extractor::new(config, Arc::new(ocr), Arc::new(store));
        match self.translation.to_translation_step().await? {
            Some(step) => {
                info!(container = %step.container, "Translation pass enabled");
                extractor = extractor.with_translation(step);
            }
            None => debug!("No translation step configured"),
        }
        info!(
            container = %self.storage.extracted_text_container,
            translates = extractor.translates(),
            "Extractor ready"
        );
        Ok(extractor)
    }
}
