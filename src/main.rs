use std::{process::ExitCode, str::FromStr, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{
    async_utils::io::write_json,
    batch::run_batch,
    config::{BatchConfig, BatchOpts},
    engines::ocrmypdf::OcrMyPdfEngine,
    prelude::*,
    report::{BatchStatus, display_summary},
    shutdown::cancel_on_signal,
    ui::Ui,
};

mod async_utils;
mod batch;
mod config;
mod discover;
mod engines;
mod job;
mod outcome;
mod pool;
mod prelude;
mod report;
mod shutdown;
mod ui;

/// OCR whole directories of scanned PDFs, without touching the originals.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Requirements:
  - `ocrmypdf` (or the program named by --ocr_command) must be installed,
    along with the tools it uses: Tesseract, Ghostscript and, for
    --denoise, unpaper.

Exit status:
  0  every file was processed
  1  some files failed, timed out or were skipped; see the summary
  2  nothing was processed: bad options or unreadable input directory

Environment Variables:
  - RUST_LOG (optional): Override log filtering, e.g. `scanocr=debug`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(flatten)]
    batch: BatchOpts,

    /// Log debugging information.
    #[clap(long)]
    verbose: bool,
}

/// Our entry point. Fatal errors are printed here and turned into an exit
/// status, the same way per-file failures are.
#[tokio::main]
async fn main() -> ExitCode {
    let ui = Ui::init();

    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments. `clap` exits with status 2 on its own
    // if they are malformed.
    let opts = Opts::parse();

    // Initialize tracing.
    let default_level = if opts.verbose { "debug" } else { "info" };
    let directive =
        Directive::from_str(default_level).expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(if opts.verbose {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    match real_main(ui.clone(), &opts).await {
        Ok(status) => status.exit_code(),
        Err(err) => {
            debug!("Fatal error: {:?}", err);
            ui.display_message("❌", &format!("{:#}", err));
            BatchStatus::TotalFailure.exit_code()
        }
    }
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: &Opts) -> Result<BatchStatus> {
    debug!("Parsed options: {:?}", opts);
    let config = BatchConfig::try_from(&opts.batch)?;

    let cancel = CancellationToken::new();
    cancel_on_signal(ui.clone(), cancel.clone());

    let engine = Arc::new(OcrMyPdfEngine::new(&config.ocr_command));
    let report = run_batch(&ui, &config, engine, cancel.clone()).await?;
    // Stop listening for signals.
    cancel.cancel();

    display_summary(&ui, &report.summary);
    let mut status = BatchStatus::from_summary(&report.summary);
    if let Some(target) = &config.report {
        if let Err(err) = write_json(target.path(), &report).await {
            error!("Could not write report: {:#}", err);
            status = BatchStatus::PartialFailure;
        }
    }
    Ok(status)
}
