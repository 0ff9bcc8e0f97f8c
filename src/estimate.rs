//! Sampling statistics taken before indexing: shard sizes and digit frequencies.

use log::debug;

use crate::alphabet::digit_frequencies;
use crate::extract::KmerExtractor;
use crate::index::IndexError;
use crate::layout::BitLayout;
use crate::source::{SequenceRecord, SequenceSource};

pub const DEFAULT_SAMPLE_SIZE: usize = 10_000;

/// Estimated number of entries per shard for the whole input.
#[derive(Clone, Debug)]
pub struct BucketEstimate {
    /// Per-shard estimate, already scaled to the full input.
    pub sizes: Vec<u64>,
    /// Records read while sampling.
    pub sampled_records: usize,
    /// Factor applied to the sampled counts.
    pub scale: f64,
}

impl BucketEstimate {
    pub fn max(&self) -> u64 {
        self.sizes.iter().copied().max().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.sizes.iter().sum()
    }

    /// Shards that fit into `memory_budget` bytes, clamped to `1..=num_buckets`.
    ///
    /// Each shard is charged its first chunk: the largest estimate plus
    /// `slack_slots` for the contingents workers hold open, 8 bytes per slot.
    pub fn suggested_buckets_per_cycle(&self, memory_budget: u64, slack_slots: u64) -> usize {
        let n = self.sizes.len().max(1);
        let per_shard = self.max().saturating_add(slack_slots).saturating_mul(8);
        if per_shard == 0 {
            return n;
        }
        ((memory_budget / per_shard) as usize).clamp(1, n)
    }
}

fn sample<S, F>(source: &mut S, limit: usize, mut f: F) -> Result<usize, IndexError>
where
    S: SequenceSource + ?Sized,
    F: FnMut(&SequenceRecord) -> Result<(), IndexError>,
{
    let mut n = 0;
    while n < limit {
        match source.next_record()? {
            Some(rec) => {
                f(&rec)?;
                n += 1;
            }
            None => break,
        }
    }
    Ok(n)
}

/// Count entries per shard over the first `sample_size` records and scale the
/// counts by `len_hint / sampled` when the source knows its length.
///
/// Fails with `IdOutOfRange` on the first sampled id the layout cannot hold.
/// The source is reset before returning.
pub fn estimate_bucket_sizes<S>(
    source: &mut S,
    extractor: &mut KmerExtractor,
    layout: &BitLayout,
    sample_size: usize,
) -> Result<BucketEstimate, IndexError>
where
    S: SequenceSource + ?Sized,
{
    let mut counts = vec![0u64; layout.num_buckets()];
    let sampled = sample(source, sample_size, |rec| {
        layout.check_id(rec.id)?;
        for kmer in extractor.iter(&rec.symbols) {
            counts[layout.shard_of(kmer)] += 1;
        }
        Ok(())
    })?;
    source.reset()?;

    let scale = match source.len_hint() {
        Some(total) if sampled > 0 && total > sampled => total as f64 / sampled as f64,
        _ => 1.0,
    };
    let sizes = counts
        .iter()
        .map(|&c| (c as f64 * scale).ceil() as u64)
        .collect();
    let estimate = BucketEstimate {
        sizes,
        sampled_records: sampled,
        scale,
    };
    debug!(
        "sampled {} records, scale {:.2}, max shard estimate {}",
        sampled,
        scale,
        estimate.max()
    );
    Ok(estimate)
}

/// Background digit frequencies over the first `sample_size` records.
///
/// The source is reset before returning.
pub fn estimate_digit_frequencies<S>(
    source: &mut S,
    base: u32,
    sample_size: usize,
) -> Result<Vec<f64>, IndexError>
where
    S: SequenceSource + ?Sized,
{
    let mut seqs = Vec::new();
    sample(source, sample_size, |rec| {
        seqs.push(rec.symbols.clone());
        Ok(())
    })?;
    source.reset()?;
    Ok(digit_frequencies(base, seqs.iter().map(|s| &s[..])))
}
