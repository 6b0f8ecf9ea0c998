//! Command-line options, and the validated configuration built from them.

use std::{ffi::OsString, num::NonZeroUsize, time::Duration};

use clap::Args;
use thiserror::Error;

use crate::{job::JobOptions, pool::JobPolicy, prelude::*};

/// Highest optimization level the toolchain understands.
const MAX_OPTIMIZE_LEVEL: u8 = 3;

/// Highest rasterization DPI we accept. Anything above this is almost
/// certainly a typo, and would eat all available memory.
const MAX_DPI: u32 = 2400;

/// Suffix added to the input directory's name to build the default output
/// directory.
const DEFAULT_OUTPUT_SUFFIX: &str = "_ocr";

/// Bad command-line input. The batch never starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--workers must be at least 1")]
    ZeroWorkers,

    #[error("--optimize_level must be between 0 and {MAX_OPTIMIZE_LEVEL}, got {0}")]
    OptimizeLevel(u8),

    #[error("--pdf_dpi must be between 1 and {MAX_DPI}, got {0}")]
    Dpi(u32),

    #[error("--timeout must be at least 1 second")]
    ZeroTimeout,

    #[error("--language must not be empty")]
    EmptyLanguage,

    #[error("cannot derive an output directory from input directory {0:?}; pass --output_dir")]
    NoDefaultOutput(PathBuf),

    #[error("cannot resolve path {path:?}: {message}")]
    BadPath { path: PathBuf, message: String },

    #[error("output directory {0:?} is the same as the input directory")]
    OutputIsInput(PathBuf),

    #[error("output directory {output:?} contains the input directory {input:?}")]
    OutputContainsInput { output: PathBuf, input: PathBuf },
}

/// Options for a batch run.
#[derive(Args, Clone, Debug)]
pub struct BatchOpts {
    /// Directory containing the PDF files to process. Searched recursively.
    #[clap(long = "input_dir", visible_alias = "input-dir", value_name = "PATH")]
    pub input_dir: PathBuf,

    /// Directory for processed PDFs. Defaults to the input directory's name
    /// with "_ocr" appended, next to the input directory.
    #[clap(long = "output_dir", visible_alias = "output-dir", value_name = "PATH")]
    pub output_dir: Option<PathBuf>,

    /// Number of files to process at once. Defaults to the number of CPUs.
    #[clap(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Detect page orientation and rotate pages upright.
    #[clap(long = "auto_rotate", visible_alias = "auto-rotate")]
    pub auto_rotate: bool,

    /// Straighten pages that were scanned at an angle (default).
    #[clap(long, overrides_with = "no_deskew")]
    pub deskew: bool,

    /// Do not deskew pages.
    #[clap(long = "no_deskew", visible_alias = "no-deskew", overrides_with = "deskew")]
    pub no_deskew: bool,

    /// Remove scanner noise before OCR (default).
    #[clap(long, overrides_with = "no_denoise")]
    pub denoise: bool,

    /// Do not denoise pages.
    #[clap(long = "no_denoise", visible_alias = "no-denoise", overrides_with = "denoise")]
    pub no_denoise: bool,

    /// Turn off all pre-processing: no rotation, deskewing or denoising.
    #[clap(long = "disable_preprocessing", visible_alias = "disable-preprocessing")]
    pub disable_preprocessing: bool,

    /// Output optimization level, from 0 (none) to 3 (aggressive).
    #[clap(long = "optimize_level", visible_alias = "optimize-level", default_value = "1")]
    pub optimize_level: u8,

    /// Resolution used when rasterizing pages.
    #[clap(long = "pdf_dpi", visible_alias = "pdf-dpi", default_value = "300")]
    pub pdf_dpi: u32,

    /// OCR language(s), such as "eng" or "eng+fra".
    #[clap(long, default_value = "eng")]
    pub language: String,

    /// Give up on a single file after this many seconds.
    #[clap(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// After Ctrl-C, how many seconds running files get to finish.
    #[clap(long = "grace_period", visible_alias = "grace-period", default_value = "10", value_name = "SECS")]
    pub grace_period: u64,

    /// The OCR program to run.
    #[clap(long = "ocr_command", visible_alias = "ocr-command", default_value = "ocrmypdf", value_name = "PATH")]
    pub ocr_command: PathBuf,

    /// Write a JSON report of every file's result to this path, or to
    /// standard output if the path is "-".
    #[clap(long, value_name = "PATH")]
    pub report: Option<PathBuf>,
}

/// Validated configuration for a batch run.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Absolute path of the input root.
    pub input_dir: PathBuf,

    /// Absolute path of the output root. Never equal to `input_dir`.
    pub output_dir: PathBuf,

    /// How many jobs may run at once.
    pub workers: NonZeroUsize,

    /// Settings passed along with every job.
    pub options: JobOptions,

    /// Time limits.
    pub policy: JobPolicy,

    /// The OCR program to run.
    pub ocr_command: PathBuf,

    /// Where to write a JSON report, if anywhere.
    pub report: Option<ReportTarget>,
}

/// Where the JSON report goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportTarget {
    Stdout,
    File(PathBuf),
}

impl ReportTarget {
    fn from_arg(path: &Path) -> Self {
        if path == Path::new("-") {
            ReportTarget::Stdout
        } else {
            ReportTarget::File(path.to_owned())
        }
    }

    /// The file to write, or `None` for standard output.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ReportTarget::Stdout => None,
            ReportTarget::File(path) => Some(path.as_path()),
        }
    }
}

impl TryFrom<&BatchOpts> for BatchConfig {
    type Error = ConfigError;

    fn try_from(opts: &BatchOpts) -> Result<Self, ConfigError> {
        let workers = match opts.workers {
            Some(n) => NonZeroUsize::new(n).ok_or(ConfigError::ZeroWorkers)?,
            None => NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN),
        };
        if opts.optimize_level > MAX_OPTIMIZE_LEVEL {
            return Err(ConfigError::OptimizeLevel(opts.optimize_level));
        }
        if opts.pdf_dpi == 0 || opts.pdf_dpi > MAX_DPI {
            return Err(ConfigError::Dpi(opts.pdf_dpi));
        }
        let timeout = match opts.timeout {
            Some(0) => return Err(ConfigError::ZeroTimeout),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        let language = opts.language.trim();
        if language.is_empty() {
            return Err(ConfigError::EmptyLanguage);
        }

        let input_dir = absolute(&opts.input_dir)?;
        let output_dir = match &opts.output_dir {
            Some(dir) => absolute(dir)?,
            None => default_output_dir(&input_dir)?,
        };
        if output_dir == input_dir {
            return Err(ConfigError::OutputIsInput(output_dir));
        }
        // Outputs would land on top of inputs. An output directory inside the
        // input directory is fine, because discovery skips it.
        if input_dir.starts_with(&output_dir) {
            return Err(ConfigError::OutputContainsInput {
                output: output_dir,
                input: input_dir,
            });
        }

        let preprocessing = !opts.disable_preprocessing;
        Ok(Self {
            input_dir,
            output_dir,
            workers,
            options: JobOptions {
                auto_rotate: preprocessing && opts.auto_rotate,
                deskew: preprocessing && !opts.no_deskew,
                denoise: preprocessing && !opts.no_denoise,
                dpi: opts.pdf_dpi,
                optimize_level: opts.optimize_level,
                language: language.to_owned(),
            },
            policy: JobPolicy {
                timeout,
                grace_period: Duration::from_secs(opts.grace_period),
            },
            ocr_command: opts.ocr_command.clone(),
            report: opts.report.as_deref().map(ReportTarget::from_arg),
        })
    }
}

/// Make a path absolute and lexically normalized, without touching the
/// filesystem. The output directory usually doesn't exist yet.
fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    let abs = std::path::absolute(path).map_err(|err| ConfigError::BadPath {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    let mut normalized = PathBuf::new();
    for component in abs.components() {
        match component {
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// `/scans/box1` becomes `/scans/box1_ocr`.
fn default_output_dir(input_dir: &Path) -> Result<PathBuf, ConfigError> {
    let (Some(parent), Some(name)) = (input_dir.parent(), input_dir.file_name()) else {
        return Err(ConfigError::NoDefaultOutput(input_dir.to_owned()));
    };
    let mut name = OsString::from(name);
    name.push(DEFAULT_OUTPUT_SUFFIX);
    Ok(parent.join(name))
}
