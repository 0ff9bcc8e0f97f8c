//! Spaced k-mer encoding and sharded, memory-bounded index construction
//! for metagenomic classification (edition 2024).
//!
//! - Rolling base-`b` encoding of spaced seeds in O(mask blocks) per symbol
//! - Plain, filtered (complexity / probability) and window (minimizer /
//!   maximizer) k-mer extraction behind one [`KmerExtractor`] enum
//! - 64-bit index entries `[kmer >> bucket_bits | id]` with a scrambled shard id
//! - Concurrent chunked shard buffers with contingent reservation
//! - Multi-cycle build bounded by a memory budget; shards as big-endian
//!   `i32 count + u64 entries` files, optionally delta + varint compressed
//!
//! Entries stored in shard `i` omit the k-mer's low `bucket_bits`; use
//! [`BitLayout::reconstruct_kmer`] with the shard id to recover the k-mer.

pub mod alphabet;
pub mod bucket;
mod builder;
pub mod encode;
mod estimate;
pub mod extract;
mod index;
pub mod io;
pub mod layout;
mod radix;
pub mod source;

pub use crate::alphabet::{Alphabet, translate_six_frames};
pub use crate::encode::{EncoderConfig, Mask, SpacedKmerEncoder, window_hash};
pub use crate::extract::{ExtractionMode, KmerExtractor, KmerFilter, WindowScore};
pub use crate::io::{BucketReader, BucketWriter, Compression, IndexDir};
pub use crate::layout::BitLayout;
pub use crate::source::{CachingSource, InMemorySource, SequenceRecord, SequenceSource};
pub use builder::{BuildConfig, BuildReport, IndexKind, Taxonomy, build_index};
pub use estimate::{BucketEstimate, estimate_bucket_sizes, estimate_digit_frequencies};
pub use index::{IndexError, ShardedIndex};
pub use radix::radix_sort_u64;
