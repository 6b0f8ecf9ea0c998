//! Running a whole batch: discovery, dispatch and aggregation.

use std::sync::Arc;

use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    config::BatchConfig,
    discover::{discover_jobs, prepare_output_tree},
    engines::ProcessingEngine,
    pool::WorkerPool,
    prelude::*,
    report::{Aggregator, BatchReport},
    ui::{ProgressConfig, Ui},
};

/// Process every PDF under `config.input_dir`.
///
/// Returns an error only if the batch could not start at all. Everything that
/// goes wrong with individual files ends up in the report instead.
#[instrument(level = "debug", skip_all, fields(input = %config.input_dir.display()))]
pub async fn run_batch(
    ui: &Ui,
    config: &BatchConfig,
    engine: Arc<dyn ProcessingEngine>,
    cancel: CancellationToken,
) -> Result<BatchReport> {
    let discovery =
        discover_jobs(&config.input_dir, &config.output_dir, &config.options).await?;
    let jobs = discovery.jobs;
    if jobs.is_empty() {
        ui.display_message(
            "🤷",
            &format!("No PDF files found in {}", config.input_dir.display()),
        );
    } else {
        info!(
            count = jobs.len(),
            workers = config.workers.get(),
            "Processing PDF files into {}",
            config.output_dir.display()
        );
    }

    prepare_output_tree(&config.output_dir, &jobs).await;

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing files",
            done_msg: "OCRed files",
        },
        jobs.len() as u64,
    );
    let pool = WorkerPool::new(config.workers, config.policy, engine, cancel);

    // Results arrive as jobs finish, in no particular order.
    let mut results = pool.submit(jobs);
    let mut aggregator = Aggregator::default();
    for (path, reason) in discovery.unreadable {
        aggregator.record_unreadable(path, reason);
    }
    while let Some(result) = results.next().await {
        aggregator.record(result);
        let summary = aggregator.summary();
        pb.set_message(format!(
            "OCRing files ({} failed)",
            summary.total - summary.succeeded
        ));
        pb.inc(1);
    }
    drop(results);
    pb.finish_using_style();

    let state = pool.state();
    debug!(?state, "Final worker pool state");
    pool.close().await?;
    Ok(aggregator.finish())
}
