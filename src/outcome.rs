//! Per-job outcomes and the failure taxonomy.

use std::{fmt, io, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::job::JobRef;

/// Why a job failed. This is a closed set: every failure we observe gets
/// mapped onto one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FailureKind {
    /// The source file is missing, unreadable, corrupt or encrypted.
    InputError,

    /// The OCR toolchain is missing, misconfigured or crashed.
    ToolchainError,

    /// We ran out of disk space or memory.
    ResourceError,

    /// The job was still running when the batch was cancelled.
    Interrupted,

    /// Anything we could not classify.
    Unknown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::InputError => "InputError",
            FailureKind::ToolchainError => "ToolchainError",
            FailureKind::ResourceError => "ResourceError",
            FailureKind::Interrupted => "Interrupted",
            FailureKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// A classified per-job failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build a failure from an I/O error, using [`classify_io_error`].
    pub fn from_io(context: &str, err: &io::Error) -> Self {
        Self::new(classify_io_error(err), format!("{context}: {err}"))
    }
}

/// Map an I/O error onto our failure taxonomy.
pub fn classify_io_error(err: &io::Error) -> FailureKind {
    match err.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidData
        | io::ErrorKind::IsADirectory => FailureKind::InputError,
        io::ErrorKind::StorageFull
        | io::ErrorKind::OutOfMemory
        | io::ErrorKind::QuotaExceeded
        | io::ErrorKind::FileTooLarge => FailureKind::ResourceError,
        _ => FailureKind::Unknown,
    }
}

/// The terminal state of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure { kind: FailureKind, reason: String },
    TimedOut,
    Skipped,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }
}

impl From<JobFailure> for JobOutcome {
    fn from(failure: JobFailure) -> Self {
        JobOutcome::Failure {
            kind: failure.kind,
            reason: failure.message,
        }
    }
}

/// The result of running one job. Exactly one of these is produced for every
/// job that is submitted.
#[derive(Clone, Debug, Serialize)]
pub struct JobResult {
    pub job: JobRef,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl JobResult {
    /// A result for a job that never reached a worker.
    pub fn skipped(job: JobRef, reason: &str) -> Self {
        Self {
            job,
            outcome: JobOutcome::Skipped,
            elapsed: Duration::ZERO,
            diagnostic: Some(reason.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(classify_io_error(&not_found), FailureKind::InputError);
        let full = io::Error::from(io::ErrorKind::StorageFull);
        assert_eq!(classify_io_error(&full), FailureKind::ResourceError);
        let other = io::Error::other("mystery");
        assert_eq!(classify_io_error(&other), FailureKind::Unknown);
    }

    #[test]
    fn failure_displays_kind_and_message() {
        let failure = JobFailure::new(FailureKind::InputError, "file is encrypted");
        assert_eq!(failure.to_string(), "InputError: file is encrypted");
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = JobOutcome::from(JobFailure::new(
            FailureKind::ToolchainError,
            "ocrmypdf not found",
        ));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "ToolchainError");
        assert_eq!(json["reason"], "ocrmypdf not found");
    }
}
