use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::prelude::*;

mod blob_name;
mod cmd;
mod completion;
mod config;
mod error;
mod io;
mod ocr;
mod pipeline;
mod prelude;
mod prompt;
mod retry;
mod storage;
mod trigger;

/// Extract text from newly uploaded images, and optionally correct and
/// translate it with an LLM.
#[derive(Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - AzureWebJobsStorage: Storage connection string (`memory://` for testing).
  - VISION_ENDPOINT, VISION_KEY: Computer Vision resource.
  - EXTRACTEDTEXT_CONTAINER_NAME: Container for extracted text.
  - OPENAI_ENDPOINT, OPENAI_KEY (optional): Completion endpoint. Setting
    OPENAI_ENDPOINT turns on the translation pass.
  - TRANSLATEDTEXT_CONTAINER_NAME: Container for translated text.
  - FUNCTIONS_CUSTOMHANDLER_PORT (optional): Port for `serve`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Subcommand)]
enum Cmd {
    /// Process a single blob-created event (or an array of them) from a file
    /// or stdin.
    Process(cmd::process::ProcessOpts),
    /// Listen for blob-created events over HTTP.
    Serve(cmd::serve::ServeOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// A short name for logging. We don't log the full options, because
    /// they contain secrets.
    fn name(&self) -> &'static str {
        match self {
            Cmd::Process(_) => "process",
            Cmd::Serve(_) => "serve",
            Cmd::Schema(_) => "schema",
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    // Logs go to stderr, so that stdout stays clean for JSON output.
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!(subcommand = opts.subcmd.name(), "Parsed options");

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Process(opts) => {
            cmd::process::cmd_process(opts).await?;
        }
        Cmd::Serve(opts) => {
            cmd::serve::cmd_serve(opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
