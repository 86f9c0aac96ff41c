//! Crate-wide error type.
//!
//! Construction-time failures (missing files, misaligned file families) are
//! unrecoverable and surfaced to the caller as dedicated variants; everything
//! discovered while loading a single example travels through [`NpyError`]
//! wrapped with the offending path.

use std::path::PathBuf;

use thiserror::Error;

use crate::npy::NpyError;

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum DatasetError {
    /// No files matched the query under the root directory.
    #[error("Not found any files matching {query:?} in {}", root.display())]
    NoFilesFound { root: PathBuf, query: String },

    /// The three file families are not positionally alignable.
    #[error(
        "Number of charactor, mel and duration files are different \
         ({charactor} vs {mel} vs {duration})"
    )]
    CountMismatch {
        charactor: usize,
        mel: usize,
        duration: usize,
    },

    /// Mel matrices inside one batch disagree on the feature dimension.
    /// The time axis is padded; the feature axis must already match.
    #[error("Mel feature dimension differs within a batch ({first} vs {other})")]
    FeatureDimMismatch { first: usize, other: usize },

    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    /// The prefetch worker hung up before producing every queued example.
    #[error("Prefetch worker disconnected before the epoch was drained")]
    WorkerDisconnected,

    #[error("NPY error in {}: {source}", path.display())]
    Npy { path: PathBuf, source: NpyError },

    #[error("Invalid file query")]
    Pattern(#[from] glob::PatternError),

    #[error("Directory walk error")]
    Glob(#[from] glob::GlobError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Config decoding error")]
    ConfigDecode(#[from] serde_json::Error),
}
