//! Job descriptors: one file's worth of work.

use serde::{Serialize, Serializer};

use crate::prelude::*;

/// Pre-processing and OCR settings shared by every job in a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobOptions {
    /// Detect page orientation and rotate pages upright.
    pub auto_rotate: bool,

    /// Straighten pages that were scanned at an angle.
    pub deskew: bool,

    /// Remove scanner noise before OCR.
    pub denoise: bool,

    /// Resolution used when rasterizing pages for pre-processing and OCR.
    pub dpi: u32,

    /// Output optimization level, from 0 (none) to 3 (aggressive).
    pub optimize_level: u8,

    /// OCR language, in the toolchain's own notation (`eng`, `eng+fra`).
    pub language: String,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            auto_rotate: false,
            deskew: true,
            denoise: true,
            dpi: 300,
            optimize_level: 1,
            language: "eng".to_owned(),
        }
    }
}

/// A reference to a job, carried by its result. This is the part of a
/// [`JobDescriptor`] that reports care about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobRef {
    /// Discovery index of the job, unique within a batch.
    pub id: usize,

    /// The original input file. Never written to.
    #[serde(serialize_with = "serialize_path_lossy")]
    pub source_path: PathBuf,

    /// Where the processed copy ends up.
    #[serde(serialize_with = "serialize_path_lossy")]
    pub destination_path: PathBuf,
}

/// Serialize a path as a string, replacing anything that isn't valid UTF-8.
///
/// Old archives are full of Latin-1 file names, and `serde` refuses to
/// serialize those paths at all.
pub fn serialize_path_lossy<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&path.to_string_lossy())
}

/// Describes the work for a single input file.
///
/// Descriptors are immutable once built. The dispatcher owns them until they
/// are handed to a worker, which owns them until the job finishes.
#[derive(Clone, Debug)]
pub struct JobDescriptor {
    job: JobRef,
    options: JobOptions,
}

impl JobDescriptor {
    /// Create a new job descriptor.
    ///
    /// Fails if `destination_path` is the same as `source_path`, because we
    /// never process files in place.
    pub fn new(
        id: usize,
        source_path: PathBuf,
        destination_path: PathBuf,
        options: JobOptions,
    ) -> Result<Self> {
        if source_path == destination_path {
            return Err(anyhow!(
                "refusing to overwrite input file {:?} with its own output",
                source_path
            ));
        }
        Ok(Self {
            job: JobRef {
                id,
                source_path,
                destination_path,
            },
            options,
        })
    }

    pub fn id(&self) -> usize {
        self.job.id
    }

    pub fn source_path(&self) -> &Path {
        &self.job.source_path
    }

    pub fn destination_path(&self) -> &Path {
        &self.job.destination_path
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// The reference that will be attached to this job's result.
    pub fn job_ref(&self) -> JobRef {
        self.job.clone()
    }
}
