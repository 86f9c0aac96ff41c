//! JSON configuration for the dataset and its loader pipeline.
//!
//! Training recipes keep the whole dataset surface in one config file:
//!
//! ```json
//! {
//!   "root_dir": "egs/ljspeech/dump/train",
//!   "mel_length_threshold": 32,
//!   "return_utt_id": false,
//!   "loader": { "batch_size": 16, "is_shuffle": true }
//! }
//! ```
//!
//! Every field except `root_dir` is optional and falls back to the same
//! defaults as [`DatasetBuilder`].

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{
    batch::CreateOptions,
    dataset::{
        DatasetBuilder, DEFAULT_CHARACTOR_QUERY, DEFAULT_DURATION_QUERY, DEFAULT_MEL_QUERY,
    },
    error::Result,
};

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub root_dir: PathBuf,

    #[serde(default = "default_charactor_query")]
    pub charactor_query: String,

    #[serde(default = "default_mel_query")]
    pub mel_query: String,

    #[serde(default = "default_duration_query")]
    pub duration_query: String,

    #[serde(default)]
    pub mel_length_threshold: Option<usize>,

    #[serde(default)]
    pub return_utt_id: bool,

    #[serde(default)]
    pub sample_cap: Option<usize>,

    #[serde(default)]
    pub loader: CreateOptions,
}

fn default_charactor_query() -> String {
    DEFAULT_CHARACTOR_QUERY.to_string()
}

fn default_mel_query() -> String {
    DEFAULT_MEL_QUERY.to_string()
}

fn default_duration_query() -> String {
    DEFAULT_DURATION_QUERY.to_string()
}

impl DatasetConfig {
    /// Read and decode a config file.
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Turn the config into a [`DatasetBuilder`]. Load functions stay at
    /// their defaults; swap them on the returned builder if needed.
    pub fn builder(&self) -> DatasetBuilder {
        let mut builder = DatasetBuilder::new(&self.root_dir)
            .charactor_query(self.charactor_query.clone())
            .mel_query(self.mel_query.clone())
            .duration_query(self.duration_query.clone());
        if let Some(threshold) = self.mel_length_threshold {
            builder = builder.mel_length_threshold(threshold);
        }
        if self.return_utt_id {
            builder = builder.return_utt_id();
        }
        if let Some(cap) = self.sample_cap {
            builder = builder.sample_cap(cap);
        }
        builder
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
