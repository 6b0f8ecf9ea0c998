//! Finding input files and turning them into jobs.

use std::{ffi::OsStr, io};

use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    job::{JobDescriptor, JobOptions},
    prelude::*,
};

/// Problems with the input root. These abort the whole batch.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("input directory {0:?} does not exist")]
    NotFound(PathBuf),

    #[error("input path {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("cannot read input directory {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What we found below the input root.
#[derive(Debug, Default)]
pub struct Discovery {
    /// One job per PDF, sorted by input path.
    pub jobs: Vec<JobDescriptor>,

    /// Directories we could not search, with the reason.
    pub unreadable: Vec<(PathBuf, String)>,
}

/// Find every PDF below `input_root`, and build a job for each one.
///
/// Each output path is the input's path relative to `input_root`, re-rooted at
/// `output_root`. If `output_root` is inside `input_root`, it is not searched.
/// Jobs are sorted by input path.
///
/// Only problems with `input_root` itself are errors. Unreadable directories
/// further down are returned in [`Discovery::unreadable`], and unreadable PDFs
/// still get a job, which will fail when it runs.
#[instrument(level = "debug", skip(options))]
pub async fn discover_jobs(
    input_root: &Path,
    output_root: &Path,
    options: &JobOptions,
) -> Result<Discovery, DiscoveryError> {
    let input_root = input_root.to_owned();
    let output_root = output_root.to_owned();
    let options = options.to_owned();
    // Walking a big archive is slow, blocking I/O.
    spawn_blocking_propagating_panics(move || {
        discover_jobs_blocking(&input_root, &output_root, &options)
    })
    .await
}

fn discover_jobs_blocking(
    input_root: &Path,
    output_root: &Path,
    options: &JobOptions,
) -> Result<Discovery, DiscoveryError> {
    check_input_root(input_root)?;

    let mut sources = vec![];
    let mut unreadable = vec![];
    let walker = WalkDir::new(input_root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.path() != output_root);
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && is_pdf(entry.path()) {
                    sources.push(entry.into_path());
                }
            }
            Err(err) => match err.path() {
                // Let the job report this one.
                Some(path) if is_pdf(path) && !path.is_dir() => {
                    warn!("Cannot inspect {}: {}", path.display(), err);
                    sources.push(path.to_owned());
                }
                Some(path) => {
                    warn!("Cannot search {}: {}", path.display(), err);
                    let reason = match err.io_error() {
                        Some(io_err) => io_err.to_string(),
                        None => err.to_string(),
                    };
                    unreadable.push((path.to_owned(), reason));
                }
                None => warn!("Skipping part of input directory: {}", err),
            },
        }
    }
    sources.sort();
    sources.dedup();

    let mut jobs = Vec::with_capacity(sources.len());
    for source in sources {
        let Ok(relative) = source.strip_prefix(input_root) else {
            warn!("Skipping {} outside of input directory", source.display());
            continue;
        };
        let destination = output_root.join(relative);
        match JobDescriptor::new(jobs.len(), source, destination, options.to_owned()) {
            Ok(job) => jobs.push(job),
            Err(err) => warn!("Skipping input: {:#}", err),
        }
    }
    unreadable.sort();
    debug!(
        count = jobs.len(),
        unreadable = unreadable.len(),
        "Discovered input files"
    );
    Ok(Discovery { jobs, unreadable })
}

/// Make sure the input root exists and can be listed.
fn check_input_root(input_root: &Path) -> Result<(), DiscoveryError> {
    let metadata = std::fs::metadata(input_root).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => DiscoveryError::NotFound(input_root.to_owned()),
        _ => DiscoveryError::Unreadable {
            path: input_root.to_owned(),
            source: err,
        },
    })?;
    if !metadata.is_dir() {
        return Err(DiscoveryError::NotADirectory(input_root.to_owned()));
    }
    std::fs::read_dir(input_root).map_err(|err| DiscoveryError::Unreadable {
        path: input_root.to_owned(),
        source: err,
    })?;
    Ok(())
}

/// Does this path have a `.pdf` extension, in any case?
fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Create the output root and the directory for every job's output.
///
/// This never removes anything, so it's safe to run repeatedly. Failures are
/// only logged: the affected jobs will fail on their own and say why.
pub async fn prepare_output_tree(output_root: &Path, jobs: &[JobDescriptor]) {
    let mut dirs = jobs
        .iter()
        .filter_map(|job| job.destination_path().parent())
        .collect::<Vec<_>>();
    dirs.push(output_root);
    dirs.sort();
    dirs.dedup();
    for dir in dirs {
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!("Cannot create output directory {}: {}", dir.display(), err);
        }
    }
}
