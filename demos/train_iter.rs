//! Iterates a feature-dump directory the way a training loop would.
//!
//! Usage:
//!   cargo run --example train_iter -- --root egs/ljspeech/dump/train
//!   cargo run --example train_iter -- --root dump --batch-size 16 --shuffle --epochs 2
//!
//! Set RUST_LOG=debug to see discovery and filtering details.

use melbatch::{CreateOptions, DatasetBuilder};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // ── Parse simple CLI arguments ───────────────────────────────────────────
    let mut args = std::env::args().skip(1);

    let mut root       = "dump".to_string();
    let mut batch_size = 4usize;
    let mut threshold  = None;
    let mut epochs     = 1usize;
    let mut shuffle    = false;
    let mut sample_cap = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root"       => { if let Some(v) = args.next() { root       = v; } }
            "--batch-size" => { if let Some(v) = args.next() { batch_size = v.parse()?; } }
            "--threshold"  => { if let Some(v) = args.next() { threshold  = Some(v.parse()?); } }
            "--epochs"     => { if let Some(v) = args.next() { epochs     = v.parse()?; } }
            "--sample-cap" => { if let Some(v) = args.next() { sample_cap = Some(v.parse()?); } }
            "--shuffle"    => { shuffle = true; }
            "--help"       => {
                println!(
                    "Usage: train_iter [--root DIR] [--batch-size N] \
                     [--threshold FRAMES] [--epochs N] [--sample-cap N] [--shuffle]"
                );
                return Ok(());
            }
            _ => {}
        }
    }

    // ── Build the dataset ────────────────────────────────────────────────────
    let mut builder = DatasetBuilder::new(&root).return_utt_id();
    if let Some(t) = threshold {
        builder = builder.mel_length_threshold(t);
    }
    if let Some(cap) = sample_cap {
        builder = builder.sample_cap(cap);
    }
    let dataset = builder.build()?;
    println!("Indexed {} samples under {}", dataset.sample_count(), root);

    let loader = dataset.create(CreateOptions {
        batch_size,
        is_shuffle: shuffle,
        allow_cache: true,
        ..Default::default()
    })?;

    // ── Drive epochs ─────────────────────────────────────────────────────────
    for epoch in 0..epochs {
        let mut batches = 0usize;
        let mut samples = 0usize;
        for batch in loader.epoch() {
            let batch = batch?;
            batches += 1;
            samples += batch.batch_size();
            if batches <= 3 {
                println!("epoch {} batch {}: {:?}", epoch, batches, batch);
            }
        }
        println!("epoch {}: {} batches, {} samples", epoch, batches, samples);
    }

    Ok(())
}
