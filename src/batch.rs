//! Batched, padded, prefetched iteration over a dataset.
//!
//! [`DataLoader`] wraps a [`CharactorDurationMelDataset`] the way a training
//! loop consumes it: one [`Epoch`] at a time, each yielding padded
//! [`Batch`]es. Examples are produced by a background thread through a
//! bounded channel so file I/O overlaps with the training step.
//!
//! Padding contract per batch:
//!   - charactor and duration are zero-padded to their own batch max length
//!   - mel is zero-padded along the time axis only; the feature axis must
//!     already agree across the batch

use std::{
    fmt,
    sync::{
        mpsc::{sync_channel, Receiver},
        Arc, Mutex,
    },
    thread,
};

use ndarray::{s, Array2, Array3};
use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::{
    dataset::{CharactorDurationMelDataset, Example},
    error::{DatasetError, Result},
};

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline options for [`CharactorDurationMelDataset::create`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOptions {
    /// Keep every example loaded during the first complete epoch in memory;
    /// later epochs are served without touching disk.
    #[serde(default)]
    pub allow_cache: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Shuffle the sample order with a buffer spanning the full dataset.
    #[serde(default)]
    pub is_shuffle: bool,

    /// Redraw the shuffle permutation for every epoch. With `false` the
    /// permutation is drawn once and replayed.
    #[serde(default = "default_reshuffle")]
    pub reshuffle_each_iteration: bool,

    /// How many examples the producer thread may run ahead of consumption.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

fn default_batch_size() -> usize {
    1
}

fn default_reshuffle() -> bool {
    true
}

fn default_prefetch() -> usize {
    8
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            allow_cache: false,
            batch_size: default_batch_size(),
            is_shuffle: false,
            reshuffle_each_iteration: default_reshuffle(),
            prefetch: default_prefetch(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch
// ─────────────────────────────────────────────────────────────────────────────

/// One padded batch of training data.
///
/// `charactor` and `duration` are `[batch, max_len]` with 0 beyond each
/// sample's true length; `mel` is `[batch, max_frames, bins]` with 0.0 in
/// the padded tail of the time axis. True lengths are carried alongside so
/// the training step can mask the padding.
pub struct Batch {
    /// Present when the dataset was built with `return_utt_id`.
    pub utt_ids: Option<Vec<String>>,
    pub charactor: Array2<i32>,
    pub duration: Array2<i32>,
    pub mel: Array3<f32>,
    pub charactor_lengths: Vec<usize>,
    pub duration_lengths: Vec<usize>,
    pub mel_lengths: Vec<usize>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.charactor.nrows()
    }

    /// Padded mel length (time axis) of this batch.
    pub fn max_frames(&self) -> usize {
        self.mel.dim().1
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Batch(size: {}, charactor: {:?}, duration: {:?}, mel: {:?})",
            self.batch_size(),
            self.charactor.dim(),
            self.duration.dim(),
            self.mel.dim()
        ))
    }
}

fn pad_batch(examples: &[Example], with_ids: bool) -> Result<Batch> {
    let batch_size = examples.len();
    let charactor_lengths: Vec<usize> = examples.iter().map(|e| e.charactor.len()).collect();
    let duration_lengths: Vec<usize> = examples.iter().map(|e| e.duration.len()).collect();
    let mel_lengths: Vec<usize> = examples.iter().map(|e| e.mel_frames()).collect();

    let n_bins = examples.first().map(|e| e.mel.ncols()).unwrap_or(0);
    for example in examples {
        if example.mel.ncols() != n_bins {
            return Err(DatasetError::FeatureDimMismatch {
                first: n_bins,
                other: example.mel.ncols(),
            });
        }
    }

    let max_charactor = charactor_lengths.iter().copied().max().unwrap_or(0);
    let max_duration = duration_lengths.iter().copied().max().unwrap_or(0);
    let max_frames = mel_lengths.iter().copied().max().unwrap_or(0);

    let mut charactor = Array2::<i32>::zeros((batch_size, max_charactor));
    let mut duration = Array2::<i32>::zeros((batch_size, max_duration));
    let mut mel = Array3::<f32>::zeros((batch_size, max_frames, n_bins));
    for (row, example) in examples.iter().enumerate() {
        charactor
            .slice_mut(s![row, ..example.charactor.len()])
            .assign(&example.charactor);
        duration
            .slice_mut(s![row, ..example.duration.len()])
            .assign(&example.duration);
        mel.slice_mut(s![row, ..example.mel_frames(), ..]).assign(&example.mel);
    }

    let utt_ids =
        with_ids.then(|| examples.iter().map(|e| e.utt_id.clone()).collect());

    Ok(Batch {
        utt_ids,
        charactor,
        duration,
        mel,
        charactor_lengths,
        duration_lengths,
        mel_lengths,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// DataLoader
// ─────────────────────────────────────────────────────────────────────────────

type CacheSlot = Arc<Mutex<Option<Arc<Vec<Example>>>>>;

#[derive(Debug)]
pub struct DataLoader {
    ds: Arc<CharactorDurationMelDataset>,
    options: CreateOptions,
    cache: CacheSlot,
    fixed_order: Mutex<Option<Vec<usize>>>,
}

impl DataLoader {
    pub(crate) fn new(
        ds: Arc<CharactorDurationMelDataset>,
        options: CreateOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(DatasetError::ZeroBatchSize);
        }
        Ok(Self {
            ds,
            options,
            cache: Arc::new(Mutex::new(None)),
            fixed_order: Mutex::new(None),
        })
    }

    pub fn dataset(&self) -> &CharactorDurationMelDataset {
        &self.ds
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.ds.iter_len().div_ceil(self.options.batch_size)
    }

    fn epoch_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.ds.iter_len()).collect();
        if !self.options.is_shuffle {
            return order;
        }
        if self.options.reshuffle_each_iteration {
            order.shuffle(&mut rand::thread_rng());
            return order;
        }
        // Shuffle once, replay the same permutation every epoch.
        let mut fixed = self.fixed_order.lock().expect("order mutex poisoned");
        if let Some(stored) = fixed.as_ref() {
            return stored.clone();
        }
        order.shuffle(&mut rand::thread_rng());
        *fixed = Some(order.clone());
        order
    }

    /// Start one pass over the dataset.
    ///
    /// Unless a cache from an earlier epoch is available, a producer thread
    /// is spawned that loads examples in epoch order and runs at most
    /// `prefetch` examples ahead. Dropping the returned iterator detaches
    /// the producer; it exits on its next blocked send.
    pub fn epoch(&self) -> Epoch {
        let order = self.epoch_order();
        let with_ids = self.ds.return_utt_id();
        let cached = self.cache.lock().expect("cache mutex poisoned").clone();

        let inner = if let Some(examples) = cached {
            log::debug!("Serving epoch from cache ({} examples)", examples.len());
            EpochInner::Cached { examples, order, pos: 0 }
        } else {
            let (tx, rx) = sync_channel(self.options.prefetch.max(1));
            let ds = Arc::clone(&self.ds);
            let worker_order = order.clone();
            thread::spawn(move || {
                for &i in &worker_order {
                    // A send error means the consumer hung up; stop quietly.
                    if tx.send((i, ds.example(i))).is_err() {
                        return;
                    }
                }
            });
            let pending_cache =
                self.options.allow_cache.then(|| vec![None; self.ds.iter_len()]);
            EpochInner::Streaming {
                rx,
                expected: order.len(),
                received: 0,
                pending_cache,
                cache_slot: Arc::clone(&self.cache),
                done: false,
            }
        };

        Epoch {
            batch_size: self.options.batch_size,
            with_ids,
            inner,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Epoch iterator
// ─────────────────────────────────────────────────────────────────────────────

/// One pass over the dataset, yielding padded batches.
///
/// The final batch is smaller when the sample count is not divisible by the
/// batch size. A load failure is yielded as an `Err` item and ends the
/// epoch.
pub struct Epoch {
    batch_size: usize,
    with_ids: bool,
    inner: EpochInner,
}

enum EpochInner {
    Cached {
        examples: Arc<Vec<Example>>,
        order: Vec<usize>,
        pos: usize,
    },
    Streaming {
        rx: Receiver<(usize, Result<Example>)>,
        expected: usize,
        received: usize,
        pending_cache: Option<Vec<Option<Example>>>,
        cache_slot: CacheSlot,
        done: bool,
    },
}

impl Iterator for Epoch {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch_size = self.batch_size;
        let with_ids = self.with_ids;
        match &mut self.inner {
            EpochInner::Cached { examples, order, pos } => {
                if *pos >= order.len() {
                    return None;
                }
                let end = (*pos + batch_size).min(order.len());
                let items: Vec<Example> =
                    order[*pos..end].iter().map(|&i| examples[i].clone()).collect();
                *pos = end;
                Some(pad_batch(&items, with_ids))
            }
            EpochInner::Streaming {
                rx,
                expected,
                received,
                pending_cache,
                cache_slot,
                done,
            } => {
                if *done {
                    return None;
                }
                let mut items = Vec::with_capacity(batch_size);
                while items.len() < batch_size && *received < *expected {
                    match rx.recv() {
                        Ok((idx, Ok(example))) => {
                            *received += 1;
                            if let Some(fill) = pending_cache {
                                fill[idx] = Some(example.clone());
                            }
                            items.push(example);
                        }
                        Ok((_, Err(e))) => {
                            *done = true;
                            return Some(Err(e));
                        }
                        Err(_) => {
                            *done = true;
                            return Some(Err(DatasetError::WorkerDisconnected));
                        }
                    }
                }
                if *received == *expected {
                    *done = true;
                    if let Some(fill) = pending_cache.take() {
                        if fill.iter().all(Option::is_some) {
                            let examples: Vec<Example> = fill.into_iter().flatten().collect();
                            *cache_slot.lock().expect("cache mutex poisoned") =
                                Some(Arc::new(examples));
                        }
                    }
                }
                if items.is_empty() {
                    None
                } else {
                    Some(pad_batch(&items, with_ids))
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
