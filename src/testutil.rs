//! Shared test fixtures: write aligned charactor/duration/mel triples into a
//! temporary dump directory.

use std::path::Path;

use ndarray::{Array1, Array2};

use crate::npy;

/// Write one utterance triple using the default filename queries.
///
/// Charactor ids are `1..=char_len` (never 0, so padding is detectable),
/// durations are all `frames`, and the mel is a constant-1.0
/// `[frames, bins]` matrix.
pub(crate) fn write_triple(dir: &Path, utt: &str, char_len: usize, frames: usize, bins: usize) {
    let charactor = Array1::from_shape_fn(char_len, |i| (i + 1) as i32);
    let duration = Array1::from_elem(char_len, frames as i32);
    let mel = Array2::from_elem((frames, bins), 1.0f32);

    npy::write_npy_i32(&dir.join(format!("{utt}-ids.npy")), charactor.view()).unwrap();
    npy::write_npy_i32(&dir.join(format!("{utt}-durations.npy")), duration.view()).unwrap();
    npy::write_npy_f32(&dir.join(format!("{utt}-norm-feats.npy")), mel.view()).unwrap();
}
