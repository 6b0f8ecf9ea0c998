//! An engine that calls the `ocrmypdf` CLI tool.
//!
//! `ocrmypdf` does all the heavy lifting: page rotation, deskewing, cleaning,
//! OCR and PDF rewriting. We just build a command line, run it as a separate
//! process, and translate its exit status into our failure taxonomy.

use std::{ffi::OsString, process::Stdio, sync::LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::ProcessingEngine;
use crate::{
    job::JobOptions,
    outcome::{FailureKind, JobFailure, classify_io_error},
    prelude::*,
};

/// How many trailing lines of standard error we keep in failure messages.
const STDERR_TAIL_LINES: usize = 5;

/// Standard error output which means we ran out of disk or memory, no matter
/// what the exit code says.
static RESOURCE_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no space left on device|MemoryError|cannot allocate memory|out of memory")
        .expect("failed to compile regex")
});

/// Engine wrapping the `ocrmypdf` CLI tool.
pub struct OcrMyPdfEngine {
    /// The program to run. Usually just `ocrmypdf`, found on `PATH`.
    command: PathBuf,
}

impl OcrMyPdfEngine {
    /// Create a new `ocrmypdf` engine.
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Build the argument list for one file.
    fn args(source: &Path, output: &Path, options: &JobOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![];
        // Pre-processing, in the order we want it applied.
        if options.auto_rotate {
            args.push("--rotate-pages".into());
        }
        if options.deskew {
            args.push("--deskew".into());
        }
        if options.denoise {
            args.push("--clean".into());
        }
        args.extend([
            "--oversample".into(),
            options.dpi.to_string().into(),
            "--optimize".into(),
            options.optimize_level.to_string().into(),
            "--language".into(),
            options.language.clone().into(),
            // Scans that already have a text layer are passed through.
            "--skip-text".into(),
            "--output-type".into(),
            "pdf".into(),
        ]);
        args.push(source.as_os_str().to_owned());
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl ProcessingEngine for OcrMyPdfEngine {
    fn name(&self) -> &str {
        "ocrmypdf"
    }

    #[instrument(level = "debug", skip_all, fields(source = %source.display()))]
    async fn process(
        &self,
        source: &Path,
        output: &Path,
        options: &JobOptions,
    ) -> Result<(), JobFailure> {
        let mut command = Command::new(&self.command);
        command
            .args(Self::args(source, output, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If our task is aborted (timeout or cancellation), the child
            // gets killed when the handle is dropped.
            .kill_on_drop(true);
        // Put the child in its own process group, so we can also take down
        // the `tesseract` and `gs` processes it spawns.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|err| {
            let kind = match err.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    FailureKind::ToolchainError
                }
                _ => classify_io_error(&err),
            };
            JobFailure::new(
                kind,
                format!("cannot run {}: {}", self.command.display(), err),
            )
        })?;
        let group = ProcessGroupGuard::new(child.id());

        let output = child.wait_with_output().await.map_err(|err| {
            JobFailure::from_io(&format!("cannot wait for {}", self.name()), &err)
        })?;
        group.disarm();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(output = %stdout, "Standard output from ocrmypdf");
        debug!(output = %stderr, "Standard error from ocrmypdf");

        if output.status.success() {
            return Ok(());
        }
        let failure = classify_exit(output.status.code(), exit_signal(&output.status), &stderr);
        warn!(kind = %failure.kind, "ocrmypdf failed: {}", failure.message);
        Err(failure)
    }
}

/// The signal that killed a process, if any.
#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Translate an `ocrmypdf` exit status into a [`JobFailure`].
///
/// Exit codes are the ones `ocrmypdf` documents: 2 bad input, 3 missing
/// dependency, 5 file access, 6 already has text, 8 encrypted, and so on.
pub fn classify_exit(code: Option<i32>, signal: Option<i32>, stderr: &str) -> JobFailure {
    let tail = stderr_tail(stderr);
    let kind = if RESOURCE_ERROR_REGEX.is_match(stderr) {
        FailureKind::ResourceError
    } else {
        match (code, signal) {
            (Some(2 | 5 | 6 | 8), _) => FailureKind::InputError,
            (Some(1 | 3 | 4 | 7 | 9 | 10 | 15), _) => FailureKind::ToolchainError,
            (Some(_), _) => FailureKind::Unknown,
            // The kernel's OOM killer uses SIGKILL.
            (None, Some(9)) => FailureKind::ResourceError,
            (None, Some(_)) => FailureKind::ToolchainError,
            (None, None) => FailureKind::Unknown,
        }
    };
    let status = match (code, signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_owned(),
    };
    let message = if tail.is_empty() {
        format!("ocrmypdf failed with {status}")
    } else {
        format!("ocrmypdf failed with {status}: {tail}")
    };
    JobFailure::new(kind, message)
}

/// The last few non-empty lines of standard error, joined with spaces.
fn stderr_tail(stderr: &str) -> String {
    let lines = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" ")
}

/// Kills a child's whole process group when dropped, unless disarmed.
///
/// `kill_on_drop` only reaches the direct child, and `ocrmypdf` leaves
/// grandchildren of its own.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// The child exited normally, so there's nothing left to kill.
    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.and_then(|pgid| i32::try_from(pgid).ok()) {
            debug!(pgid, "Killing abandoned process group");
            // SAFETY: `killpg` has no memory-safety preconditions. The group
            // was created for our child and is still alive, because we have
            // not reaped it yet.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_options() {
        let options = JobOptions {
            auto_rotate: true,
            deskew: false,
            denoise: true,
            dpi: 400,
            optimize_level: 2,
            language: "eng+fra".to_owned(),
        };
        let args = OcrMyPdfEngine::args(Path::new("in.pdf"), Path::new("out.pdf"), &options);
        let args = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            args,
            [
                "--rotate-pages",
                "--clean",
                "--oversample",
                "400",
                "--optimize",
                "2",
                "--language",
                "eng+fra",
                "--skip-text",
                "--output-type",
                "pdf",
                "in.pdf",
                "out.pdf",
            ]
        );
    }

    #[test]
    fn exit_codes_are_classified() {
        assert_eq!(classify_exit(Some(2), None, "").kind, FailureKind::InputError);
        assert_eq!(classify_exit(Some(8), None, "").kind, FailureKind::InputError);
        assert_eq!(
            classify_exit(Some(3), None, "tesseract not found").kind,
            FailureKind::ToolchainError
        );
        assert_eq!(classify_exit(Some(42), None, "").kind, FailureKind::Unknown);
        assert_eq!(classify_exit(None, Some(9), "").kind, FailureKind::ResourceError);
        assert_eq!(classify_exit(None, Some(11), "").kind, FailureKind::ToolchainError);
    }

    #[test]
    fn resource_errors_win_over_exit_codes() {
        let failure = classify_exit(
            Some(15),
            None,
            "OSError: [Errno 28] No space left on device",
        );
        assert_eq!(failure.kind, FailureKind::ResourceError);
    }

    #[test]
    fn failure_message_keeps_stderr_tail() {
        let stderr = (1..=8).map(|i| format!("line {i}\n")).collect::<String>();
        let failure = classify_exit(Some(2), None, &stderr);
        assert_eq!(
            failure.message,
            "ocrmypdf failed with exit code 2: line 4 line 5 line 6 line 7 line 8"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_group() {
        use std::{
            num::NonZeroUsize,
            os::unix::fs::PermissionsExt as _,
            sync::Arc,
            time::{Duration, Instant},
        };

        use futures::StreamExt as _;
        use tokio_util::sync::CancellationToken;

        use crate::{
            engines::testing::write_fake_pdf,
            job::JobDescriptor,
            outcome::JobOutcome,
            pool::{JobPolicy, WorkerPool},
        };

        let dir = tempfile::TempDir::new().unwrap();
        // A stand-in for `ocrmypdf` that leaves a grandchild behind, the way
        // `tesseract` and `gs` would, and then never finishes.
        let marker = dir.path().join("grandchild-survived");
        let script = dir.path().join("stuck-ocrmypdf");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n(sleep 1; touch '{}') &\nsleep 30\n",
                marker.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = dir.path().join("in/memo.pdf");
        write_fake_pdf(&source);
        let job = JobDescriptor::new(
            0,
            source,
            dir.path().join("out/memo.pdf"),
            JobOptions::default(),
        )
        .unwrap();
        let policy = JobPolicy {
            timeout: Some(Duration::from_millis(500)),
            ..JobPolicy::default()
        };
        let pool = WorkerPool::new(
            NonZeroUsize::MIN,
            policy,
            Arc::new(OcrMyPdfEngine::new(&script)),
            CancellationToken::new(),
        );

        let started = Instant::now();
        let results = pool.submit(vec![job]).collect::<Vec<_>>().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, JobOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        pool.close().await.unwrap();

        // Long enough for the grandchild to finish its nap, if it's alive.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists(), "grandchild outlived the timeout");
        let leftovers = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect::<Vec<_>>();
        assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
    }

    #[tokio::test]
    async fn missing_binary_is_toolchain_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = OcrMyPdfEngine::new(dir.path().join("no-such-ocrmypdf"));
        let failure = engine
            .process(
                &dir.path().join("in.pdf"),
                &dir.path().join("out.pdf"),
                &JobOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ToolchainError);
    }
}
