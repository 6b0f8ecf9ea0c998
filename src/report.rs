//! Aggregating job results into a batch summary, and reporting it.

use std::process::ExitCode;

use serde::{Serialize, Serializer};

use crate::{
    outcome::{JobOutcome, JobResult},
    prelude::*,
    ui::Ui,
};

/// The final tally for a batch run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,

    /// Every input that did not succeed, with the reason, sorted by path.
    #[serde(serialize_with = "serialize_entries_lossy")]
    pub failures: Vec<(PathBuf, String)>,

    /// Parts of the input tree we could not read, with the reason. Any PDFs
    /// in there were never seen, so they are not in the counts above.
    #[serde(serialize_with = "serialize_entries_lossy")]
    pub unreadable: Vec<(PathBuf, String)>,
}

/// Serialize `(path, reason)` pairs, with paths converted the same way as in
/// [`serialize_path_lossy`](crate::job::serialize_path_lossy).
fn serialize_entries_lossy<S>(
    entries: &[(PathBuf, String)],
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(
        entries
            .iter()
            .map(|(path, reason)| (path.to_string_lossy(), reason)),
    )
}

/// A summary plus every individual result.
#[derive(Clone, Debug, Serialize)]
pub struct BatchReport {
    pub summary: BatchSummary,

    /// All job results, sorted by job ID.
    pub results: Vec<JobResult>,
}

/// Accumulates job results as they arrive, in any order.
#[derive(Debug, Default)]
pub struct Aggregator {
    summary: BatchSummary,
    results: Vec<JobResult>,
}

impl Aggregator {
    /// Record one result.
    pub fn record(&mut self, result: JobResult) {
        let summary = &mut self.summary;
        summary.total += 1;
        let reason = match &result.outcome {
            JobOutcome::Success => {
                summary.succeeded += 1;
                None
            }
            JobOutcome::Failure { kind, reason } => {
                summary.failed += 1;
                Some(format!("{kind}: {reason}"))
            }
            JobOutcome::TimedOut => {
                summary.timed_out += 1;
                Some("TimedOut".to_owned())
            }
            JobOutcome::Skipped => {
                summary.skipped += 1;
                Some("Skipped".to_owned())
            }
        };
        if let Some(reason) = reason {
            summary
                .failures
                .push((result.job.source_path.clone(), reason));
        }
        self.results.push(result);
    }

    /// Record part of the input tree that could not be searched.
    pub fn record_unreadable(&mut self, path: PathBuf, reason: String) {
        self.summary.unreadable.push((path, reason));
    }

    /// The summary so far.
    pub fn summary(&self) -> &BatchSummary {
        &self.summary
    }

    /// Finish up. The output does not depend on the order results arrived in.
    pub fn finish(self) -> BatchReport {
        let Self {
            mut summary,
            mut results,
        } = self;
        summary.failures.sort();
        summary.unreadable.sort();
        results.sort_by_key(|result| result.job.id);
        BatchReport { summary, results }
    }
}

/// How the run as a whole went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every job succeeded (including the case of no jobs at all), and the
    /// whole input tree was searched.
    Success,

    /// Some jobs did not succeed. Everything else was still processed.
    PartialFailure,

    /// We could not even start: bad configuration or unreadable input.
    TotalFailure,
}

impl BatchStatus {
    /// Decide the status of a run that got as far as producing a summary.
    pub fn from_summary(summary: &BatchSummary) -> Self {
        if summary.failed == 0
            && summary.timed_out == 0
            && summary.skipped == 0
            && summary.unreadable.is_empty()
        {
            BatchStatus::Success
        } else {
            BatchStatus::PartialFailure
        }
    }

    pub fn exit_code(self) -> ExitCode {
        match self {
            BatchStatus::Success => ExitCode::SUCCESS,
            BatchStatus::PartialFailure => ExitCode::from(1),
            BatchStatus::TotalFailure => ExitCode::from(2),
        }
    }
}

/// Show a summary to the user.
pub fn display_summary(ui: &Ui, summary: &BatchSummary) {
    ui.display_message(
        "📊",
        &format!(
            "{} files: {} succeeded, {} failed, {} timed out, {} skipped",
            summary.total,
            summary.succeeded,
            summary.failed,
            summary.timed_out,
            summary.skipped
        ),
    );
    for (path, reason) in &summary.failures {
        ui.display_message("❌", &format!("{}: {}", path.display(), reason));
    }
    for (path, reason) in &summary.unreadable {
        ui.display_message(
            "⚠️",
            &format!("{}: not searched: {}", path.display(), reason),
        );
    }
    if BatchStatus::from_summary(summary) == BatchStatus::Success {
        ui.display_message("✅", "All files processed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        job::JobRef,
        outcome::{FailureKind, JobFailure},
    };

    fn result(id: usize, name: &str, outcome: JobOutcome) -> JobResult {
        JobResult {
            job: JobRef {
                id,
                source_path: PathBuf::from("/in").join(name),
                destination_path: PathBuf::from("/out").join(name),
            },
            outcome,
            elapsed: Duration::from_millis(10),
            diagnostic: None,
        }
    }

    fn sample() -> Vec<JobResult> {
        vec![
            result(0, "a.pdf", JobOutcome::Success),
            result(
                1,
                "corrupt.pdf",
                JobFailure::new(FailureKind::InputError, "bad xref table").into(),
            ),
            result(2, "b.pdf", JobOutcome::Success),
            result(3, "hang.pdf", JobOutcome::TimedOut),
            result(4, "z.pdf", JobOutcome::Skipped),
        ]
    }

    #[test]
    fn counts_add_up() {
        let mut agg = Aggregator::default();
        for r in sample() {
            agg.record(r);
        }
        let summary = agg.finish().summary;
        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            summary.succeeded + summary.failed + summary.timed_out + summary.skipped,
            summary.total
        );
        assert_eq!(
            summary.failures,
            [
                (
                    PathBuf::from("/in/corrupt.pdf"),
                    "InputError: bad xref table".to_owned()
                ),
                (PathBuf::from("/in/hang.pdf"), "TimedOut".to_owned()),
                (PathBuf::from("/in/z.pdf"), "Skipped".to_owned()),
            ]
        );
    }

    #[test]
    fn order_does_not_matter() {
        let mut forward = Aggregator::default();
        for r in sample() {
            forward.record(r);
        }
        let mut backward = Aggregator::default();
        for r in sample().into_iter().rev() {
            backward.record(r);
        }
        let forward = forward.finish();
        let backward = backward.finish();
        assert_eq!(forward.summary, backward.summary);
        let ids = |report: &BatchReport| {
            report.results.iter().map(|r| r.job.id).collect::<Vec<_>>()
        };
        assert_eq!(ids(&forward), ids(&backward));
    }

    #[test]
    fn status_is_a_function_of_the_summary() {
        assert_eq!(
            BatchStatus::from_summary(&BatchSummary::default()),
            BatchStatus::Success
        );
        let all_good = BatchSummary {
            total: 2,
            succeeded: 2,
            ..BatchSummary::default()
        };
        assert_eq!(BatchStatus::from_summary(&all_good), BatchStatus::Success);
        let one_bad = BatchSummary {
            total: 2,
            succeeded: 1,
            timed_out: 1,
            ..BatchSummary::default()
        };
        assert_eq!(
            BatchStatus::from_summary(&one_bad),
            BatchStatus::PartialFailure
        );
    }

    #[test]
    fn unreadable_directories_make_a_partial_failure() {
        let mut agg = Aggregator::default();
        agg.record(result(0, "a.pdf", JobOutcome::Success));
        agg.record_unreadable(
            PathBuf::from("/in/z-locked"),
            "Permission denied".to_owned(),
        );
        agg.record_unreadable(PathBuf::from("/in/a-locked"), "Permission denied".to_owned());
        let summary = agg.finish().summary;
        assert_eq!(summary.total, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.unreadable[0].0, PathBuf::from("/in/a-locked"));
        assert_eq!(
            BatchStatus::from_summary(&summary),
            BatchStatus::PartialFailure
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn report_with_non_utf8_paths_is_still_written() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt as _};

        use crate::async_utils::io::write_json;

        let name = OsStr::from_bytes(b"memo_\xe9t\xe9.pdf");
        let mut agg = Aggregator::default();
        agg.record(result(0, "a.pdf", JobOutcome::Success));
        let mut latin1 = result(
            1,
            "placeholder.pdf",
            JobFailure::new(FailureKind::InputError, "bad xref table").into(),
        );
        latin1.job.source_path = PathBuf::from("/in").join(name);
        latin1.job.destination_path = PathBuf::from("/out").join(name);
        agg.record(latin1);
        agg.record_unreadable(PathBuf::from("/in").join(name), "Permission denied".to_owned());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        write_json(Some(path.as_path()), &agg.finish()).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["summary"]["total"], 2);
        assert_eq!(
            json["summary"]["failures"][0][0],
            "/in/memo_\u{fffd}t\u{fffd}.pdf"
        );
        assert_eq!(
            json["summary"]["unreadable"][0][0],
            "/in/memo_\u{fffd}t\u{fffd}.pdf"
        );
        assert_eq!(
            json["results"][1]["source_path"],
            "/in/memo_\u{fffd}t\u{fffd}.pdf"
        );
    }

    #[test]
    fn report_serializes() {
        let mut agg = Aggregator::default();
        for r in sample() {
            agg.record(r);
        }
        let json = serde_json::to_value(agg.finish()).unwrap();
        assert_eq!(json["summary"]["total"], 5);
        assert_eq!(json["results"][1]["status"], "failure");
        assert_eq!(json["results"][1]["kind"], "InputError");
        assert_eq!(json["results"][3]["status"], "timed_out");
    }
}
