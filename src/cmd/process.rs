//! The `process` subcommand.

use clap::Args;

use crate::{
    config::ExtractorOpts,
    io::{read_input, write_json_output},
    prelude::*,
    trigger::{TriggerBatch, TriggerEvent},
};

/// Process command line arguments.
#[derive(Args)]
pub struct ProcessOpts {
    /// A JSON file containing a blob-created event, or an array of events.
    /// Defaults to standard input.
    pub input_path: Option<PathBuf>,

    /// Process this blob URL instead of reading an event.
    #[clap(long, conflicts_with = "input_path")]
    pub blob_url: Option<String>,

    /// Where to write the JSON report. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub extractor: ExtractorOpts,
}

/// The `process` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process(opts: &ProcessOpts) -> Result<()> {
    let events = match &opts.blob_url {
        Some(blob_url) => vec![TriggerEvent::for_blob_url(blob_url.as_str())],
        None => {
            let input = read_input(opts.input_path.as_deref()).await?;
            TriggerBatch::from_json(&input)?.into_events()
        }
    };

    let extractor = opts.extractor.build_extractor().await?;
    let mut reports = Vec::with_capacity(events.len());
    for event in &events {
        reports.push(extractor.run(event).await?);
    }

    match reports.as_slice() {
        [report] => write_json_output(opts.output_path.as_deref(), report).await,
        reports => write_json_output(opts.output_path.as_deref(), &reports).await,
    }
}
