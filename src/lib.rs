//! # melbatch
//!
//! Dataset loader for FastSpeech-style speech-synthesis training: pairs
//! charactor-id, duration and mel-spectrogram arrays dumped as NumPy files,
//! and serves them as padded, prefetched batches.
//!
//! ## Quick start
//!
//! ```no_run
//! use melbatch::{CreateOptions, DatasetBuilder};
//!
//! // Index a feature-dump directory (three .npy files per utterance)
//! let dataset = DatasetBuilder::new("egs/ljspeech/dump/train")
//!     .mel_length_threshold(32)
//!     .build()
//!     .unwrap();
//!
//! // Batched, padded, prefetched iteration
//! let loader = dataset
//!     .create(CreateOptions { batch_size: 16, is_shuffle: true, ..Default::default() })
//!     .unwrap();
//!
//! for _epoch in 0..10 {
//!     for batch in loader.epoch() {
//!         let batch = batch.unwrap();
//!         // batch.charactor: [batch, max_chars]        i32
//!         // batch.duration : [batch, max_chars]        i32
//!         // batch.mel      : [batch, max_frames, bins] f32
//!     }
//! }
//! ```
//!
//! ## Pipeline
//! 1. **Discovery** — three filename queries are globbed recursively under
//!    the root directory; sorted filenames align the families positionally.
//! 2. **Length filter** — utterances with too few mel frames are dropped
//!    (logged as a warning).
//! 3. **Bucket shuffle** — survivors are pseudo-sorted by mel length and
//!    equal-length groups are reordered randomly, keeping padding cheap
//!    without a deterministic epoch order.
//! 4. **Batching** — per-batch zero padding, optional in-memory caching,
//!    optional per-epoch shuffling, background prefetch.

pub mod batch;
pub mod config;
pub mod dataset;
pub mod error;
pub mod npy;

#[cfg(test)]
mod testutil;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use batch::{Batch, CreateOptions, DataLoader, Epoch};
pub use config::DatasetConfig;
pub use dataset::{
    CharactorDurationMelDataset, DatasetBuilder, Example, IdsLoadFn, MelLoadFn,
};
pub use error::{DatasetError, Result};
