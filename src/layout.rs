//! Bit layout of a 64-bit index entry and the k-mer → shard function.
//!
//! ```text
//! raw k-mer      : [ payload_bits - bucket_bits ][ bucket_bits ]
//! index entry    : [ kmer >> bucket_bits        ][ id_bits     ]
//! shard id       : (kmer & shard_mask) ^ scramble
//! ```
//! The low `bucket_bits` of a k-mer are implied by the shard file an entry
//! lives in, so they are not stored.

use crate::encode::EncoderConfig;
use crate::index::IndexError;

/// Widest shard address supported (16M shard files).
pub const MAX_BUCKET_BITS: u32 = 24;
/// Widest identifier field.
pub const MAX_ID_BITS: u32 = 32;
pub const DEFAULT_BUCKET_BITS: u32 = 10;

/// Alternating `...1010` over the low `bucket_bits` bits.
pub fn default_scramble(bucket_bits: u32) -> u32 {
    let mask = low_mask(bucket_bits) as u32;
    0xAAAA_AAAA & mask
}

#[inline]
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Bits needed for every value in `[0, base^w - 1]`, i.e. `ceil(log2(base^w))`.
pub fn payload_bits(cfg: &EncoderConfig) -> u32 {
    64 - cfg.max_encoding().leading_zeros()
}

/// Split of a 64-bit entry into shard, payload and identifier bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitLayout {
    payload_bits: u32,
    bucket_bits: u32,
    id_bits: u32,
    scramble: u32,
}

impl BitLayout {
    /// Layout with the default scramble constant.
    pub fn new(cfg: &EncoderConfig, bucket_bits: u32, id_bits: u32) -> Result<Self, IndexError> {
        Self::with_scramble(cfg, bucket_bits, id_bits, default_scramble(bucket_bits))
    }

    pub fn with_scramble(
        cfg: &EncoderConfig,
        bucket_bits: u32,
        id_bits: u32,
        scramble: u32,
    ) -> Result<Self, IndexError> {
        Self::from_parts(payload_bits(cfg), bucket_bits, id_bits, scramble)
    }

    /// Validate a layout given the payload width directly.
    pub fn from_parts(
        payload_bits: u32,
        bucket_bits: u32,
        id_bits: u32,
        scramble: u32,
    ) -> Result<Self, IndexError> {
        if !(1..=MAX_ID_BITS).contains(&id_bits) {
            return Err(IndexError::Config(format!(
                "id bits must be in 1..={MAX_ID_BITS}, got {id_bits}"
            )));
        }
        if payload_bits + id_bits > 64 {
            return Err(IndexError::Config(format!(
                "k-mer payload of {payload_bits} bits plus {id_bits} id bits exceeds 64"
            )));
        }
        let max_bucket = payload_bits.min(MAX_BUCKET_BITS);
        if bucket_bits < 1 || bucket_bits > max_bucket {
            return Err(IndexError::Config(format!(
                "bucket bits must be in 1..={max_bucket}, got {bucket_bits}"
            )));
        }
        if scramble as u64 > low_mask(bucket_bits) {
            return Err(IndexError::Config(format!(
                "scramble constant {scramble:#b} is wider than {bucket_bits} bucket bits"
            )));
        }
        Ok(BitLayout {
            payload_bits,
            bucket_bits,
            id_bits,
            scramble,
        })
    }

    pub fn payload_bits(&self) -> u32 {
        self.payload_bits
    }

    pub fn bucket_bits(&self) -> u32 {
        self.bucket_bits
    }

    pub fn id_bits(&self) -> u32 {
        self.id_bits
    }

    pub fn scramble(&self) -> u32 {
        self.scramble
    }

    /// Number of shard files, `2^bucket_bits`.
    pub fn num_buckets(&self) -> usize {
        1usize << self.bucket_bits
    }

    /// Largest identifier that fits, `2^id_bits - 1`.
    pub fn max_id(&self) -> u32 {
        low_mask(self.id_bits) as u32
    }

    #[inline]
    pub fn shard_of(&self, kmer: u64) -> usize {
        ((kmer & low_mask(self.bucket_bits)) as u32 ^ self.scramble) as usize
    }

    /// Drop the bits already encoded by the shard id.
    #[inline]
    pub fn strip_shard(&self, kmer: u64) -> u64 {
        kmer >> self.bucket_bits
    }

    /// `IdOutOfRange` unless `id` fits in the id field.
    #[inline]
    pub fn check_id(&self, id: u32) -> Result<(), IndexError> {
        if id > self.max_id() {
            return Err(IndexError::IdOutOfRange {
                id,
                id_bits: self.id_bits,
            });
        }
        Ok(())
    }

    /// Pack `id` with a k-mer whose shard bits are already stripped.
    #[inline]
    pub fn build_index_entry(&self, id: u32, kmer_without_shard: u64) -> Result<u64, IndexError> {
        self.check_id(id)?;
        Ok((kmer_without_shard << self.id_bits) | id as u64)
    }

    /// Shard id and entry for a raw k-mer.
    #[inline]
    pub fn entry_for(&self, id: u32, kmer: u64) -> Result<(usize, u64), IndexError> {
        let entry = self.build_index_entry(id, self.strip_shard(kmer))?;
        Ok((self.shard_of(kmer), entry))
    }

    #[inline]
    pub fn extract_id(&self, entry: u64) -> u32 {
        (entry & low_mask(self.id_bits)) as u32
    }

    /// The entry without its identifier: equal for equal k-mers within a shard.
    #[inline]
    pub fn kmer_part(&self, entry: u64) -> u64 {
        entry >> self.id_bits
    }

    /// Recover the raw k-mer from a shard id and one of its entries.
    #[inline]
    pub fn reconstruct_kmer(&self, shard: usize, entry: u64) -> u64 {
        let low = (shard as u64 ^ self.scramble as u64) & low_mask(self.bucket_bits);
        (self.kmer_part(entry) << self.bucket_bits) | low
    }
}
