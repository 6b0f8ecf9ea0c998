//! The external processing adapter.
//!
//! The actual pre-processing and OCR happen in an external toolchain, behind
//! the [`ProcessingEngine`] trait. [`process_job`] wraps an engine call with
//! everything that makes a job safe to run against an archive: input checks,
//! idempotent skipping of finished outputs, and atomic output writes.

use async_trait::async_trait;
use tokio::{fs::File, io::AsyncReadExt as _};

use crate::{
    job::{JobDescriptor, JobOptions},
    outcome::{FailureKind, JobFailure},
    prelude::*,
};

pub mod ocrmypdf;

/// Every PDF starts with this, give or take some leading junk.
const PDF_MAGIC: &[u8] = b"%PDF-";

/// How far into the file we look for [`PDF_MAGIC`].
const PDF_MAGIC_SEARCH_LEN: usize = 1024;

/// Interface to the OCR toolchain.
///
/// Implementations read `source`, apply whatever pre-processing `options`
/// enables (auto-rotate, then deskew, then denoise), run OCR, and write a
/// complete PDF to `output`. They never touch any other path.
#[async_trait]
pub trait ProcessingEngine: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Process one file.
    async fn process(
        &self,
        source: &Path,
        output: &Path,
        options: &JobOptions,
    ) -> Result<(), JobFailure>;
}

/// A successfully completed job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    /// Anything worth telling the user about, even though the job worked.
    pub diagnostic: Option<String>,
}

/// Run a single job through `engine`.
///
/// The destination is only ever created by an atomic rename of a fully
/// written temporary file in the same directory, so a failed (or aborted)
/// job leaves nothing behind at `job.destination_path()`.
#[instrument(level = "debug", skip_all, fields(id = job.id(), path = %job.source_path().display()))]
pub async fn process_job(
    engine: &dyn ProcessingEngine,
    job: &JobDescriptor,
) -> Result<Completion, JobFailure> {
    let destination = job.destination_path();

    // Finished outputs are left alone, which makes re-running a batch safe.
    if let Ok(metadata) = tokio::fs::metadata(destination).await {
        if metadata.is_file() && metadata.len() > 0 {
            debug!("Output already exists, leaving it alone");
            return Ok(Completion {
                diagnostic: Some("output already exists".to_owned()),
            });
        }
    }

    check_source(job.source_path()).await?;

    let parent = destination.parent().ok_or_else(|| {
        JobFailure::new(
            FailureKind::InputError,
            format!("destination {:?} has no parent directory", destination),
        )
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|err| JobFailure::from_io("cannot create output directory", &err))?;

    // `TempPath` deletes the file when dropped, which covers early returns,
    // panics and aborted tasks alike.
    let temp_path = tempfile::Builder::new()
        .prefix(".scanocr-")
        .suffix(".pdf.partial")
        .tempfile_in(parent)
        .map_err(|err| JobFailure::from_io("cannot create temporary output", &err))?
        .into_temp_path();

    debug!(engine = engine.name(), temp = %temp_path.display(), "Running engine");
    engine
        .process(job.source_path(), &temp_path, job.options())
        .await?;

    let metadata = tokio::fs::metadata(&temp_path)
        .await
        .map_err(|err| JobFailure::from_io("cannot inspect engine output", &err))?;
    if metadata.len() == 0 {
        return Err(JobFailure::new(
            FailureKind::ToolchainError,
            format!("{} produced an empty output file", engine.name()),
        ));
    }

    temp_path
        .persist(destination)
        .map_err(|err| JobFailure::from_io("cannot move output into place", &err.error))?;
    Ok(Completion::default())
}

/// Make sure `source` is a readable file that at least claims to be a PDF.
async fn check_source(source: &Path) -> Result<(), JobFailure> {
    let mut file = File::open(source)
        .await
        .map_err(|err| JobFailure::from_io("cannot open input file", &err))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| JobFailure::from_io("cannot read input metadata", &err))?;
    if !metadata.is_file() {
        return Err(JobFailure::new(
            FailureKind::InputError,
            "input is not a regular file",
        ));
    }

    let mut header = Vec::with_capacity(PDF_MAGIC_SEARCH_LEN);
    (&mut file)
        .take(PDF_MAGIC_SEARCH_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(|err| JobFailure::from_io("cannot read input file", &err))?;
    if !header.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC) {
        return Err(JobFailure::new(
            FailureKind::InputError,
            "input does not look like a PDF file",
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake engines for tests.

    use std::time::Duration;

    use super::*;

    /// An engine that copies its input, and fails in ways controlled by the
    /// input file's name.
    ///
    /// - `corrupt*` fails with an [`FailureKind::InputError`].
    /// - `hang*` never finishes.
    /// - `slow*` takes a little while.
    /// - `panic*` panics.
    pub struct FakeEngine;

    #[async_trait]
    impl ProcessingEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        async fn process(
            &self,
            source: &Path,
            output: &Path,
            _options: &JobOptions,
        ) -> Result<(), JobFailure> {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.starts_with("corrupt") {
                return Err(JobFailure::new(
                    FailureKind::InputError,
                    "input file is not a valid PDF",
                ));
            } else if name.starts_with("hang") {
                futures::future::pending::<()>().await;
            } else if name.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            } else if name.starts_with("panic") {
                panic!("engine exploded on {name}");
            }
            let mut data = tokio::fs::read(source)
                .await
                .map_err(|err| JobFailure::from_io("read", &err))?;
            data.extend_from_slice(b"\n% ocr text layer\n");
            tokio::fs::write(output, data)
                .await
                .map_err(|err| JobFailure::from_io("write", &err))
        }
    }

    /// Write a minimal file that passes our PDF header check.
    pub fn write_fake_pdf(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"%PDF-1.4\n% fake scan\n%%EOF\n").unwrap();
    }
}
