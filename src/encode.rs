//! Spaced k-mer encoding: masks, rolling base-`b` encoder, window hash.
//!
//! Conventions
//! - A window holds the last `k` digits; position 0 is the oldest (leftmost).
//! - Only masked positions contribute. The leftmost masked position is the most
//!   significant digit of the encoding, the rightmost the least significant.
//! - Before `k` digits have been added the window is padded with digit 0 on
//!   the left, so the encoding is that of the zero-padded window.
//!
//! The encoder keeps one rolling value per contiguous run of `1`s in the mask
//! (a "block"), so adding a digit costs O(blocks) regardless of `k`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::index::IndexError;

/// Positional mask ("spaced seed"): `true` positions take part in the encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct Mask {
    bits: Vec<bool>,
}

impl Mask {
    pub fn new(bits: Vec<bool>) -> Result<Self, IndexError> {
        if !bits.iter().any(|&b| b) {
            return Err(IndexError::Config(
                "mask must contain at least one `1` position".into(),
            ));
        }
        Ok(Mask { bits })
    }

    /// Contiguous mask of length `k`.
    pub fn contiguous(k: usize) -> Result<Self, IndexError> {
        Mask::new(vec![true; k])
    }

    /// Window length `k`.
    #[inline]
    pub fn k(&self) -> usize {
        self.bits.len()
    }

    /// Number of masked positions `w`.
    #[inline]
    pub fn weight(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Number of spaces `s = k - w`.
    #[inline]
    pub fn spaces(&self) -> usize {
        self.k() - self.weight()
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Maximal runs of masked positions as `(start, len)`.
    fn blocks(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.bits.len() {
            if self.bits[i] {
                let start = i;
                while i < self.bits.len() && self.bits[i] {
                    i += 1;
                }
                out.push((start, i - start));
            } else {
                i += 1;
            }
        }
        out
    }
}

impl FromStr for Mask {
    type Err = IndexError;

    /// Parse a `0`/`1` string, e.g. `"1110111"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits = s
            .trim()
            .chars()
            .map(|c| match c {
                '1' => Ok(true),
                '0' => Ok(false),
                _ => Err(IndexError::Config(format!(
                    "invalid mask `{s}`: only `0` and `1` are allowed"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Mask::new(bits)
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.bits {
            f.write_str(if b { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mask({self})")
    }
}

/// Everything needed to build an encoder; cheap to clone per worker.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    base: u32,
    mask: Mask,
    frequencies: Option<Arc<[f64]>>,
}

impl EncoderConfig {
    /// Validates that `base^w - 1` fits in 64 bits.
    pub fn new(base: u32, mask: Mask) -> Result<Self, IndexError> {
        if base < 2 || base > 255 {
            return Err(IndexError::Config(format!(
                "alphabet base must be in 2..=255, got {base}"
            )));
        }
        // base^w may be exactly 2^64, in which case base^w - 1 still fits.
        let span = (base as u128).checked_pow(mask.weight() as u32);
        match span {
            Some(n) if n - 1 <= u64::MAX as u128 => {}
            _ => {
                return Err(IndexError::Config(format!(
                    "base {base} with mask weight {} exceeds 64 bits (mask {mask})",
                    mask.weight()
                )));
            }
        }
        Ok(EncoderConfig {
            base,
            mask,
            frequencies: None,
        })
    }

    /// Attach per-digit background frequencies (for probability scores).
    pub fn with_frequencies(mut self, freqs: Vec<f64>) -> Result<Self, IndexError> {
        if freqs.len() != self.base as usize {
            return Err(IndexError::Config(format!(
                "expected {} digit frequencies, got {}",
                self.base,
                freqs.len()
            )));
        }
        self.frequencies = Some(freqs.into());
        Ok(self)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn has_frequencies(&self) -> bool {
        self.frequencies.is_some()
    }

    /// Largest possible encoding, `base^w - 1`.
    pub fn max_encoding(&self) -> u64 {
        let span = (self.base as u128).pow(self.mask.weight() as u32);
        (span - 1) as u64
    }

    pub fn build(&self) -> SpacedKmerEncoder {
        SpacedKmerEncoder::new(self)
    }
}

#[derive(Clone, Debug)]
struct Block {
    start: usize,
    len: usize,
    /// base^(len-1): weight of the block's leftmost digit inside the block.
    lead: u64,
    /// base^(masked positions right of this block): block weight in the k-mer.
    scale: u64,
}

/// Rolling encoder over a window of `k` digits under a mask.
#[derive(Clone, Debug)]
pub struct SpacedKmerEncoder {
    base: u64,
    k: usize,
    blocks: Vec<Block>,
    /// Ring buffer of the window; `head` is the physical slot of position 0.
    window: Vec<u8>,
    head: usize,
    values: Vec<u64>,
    encoding: u64,
    /// Per-digit occurrence counts over masked positions.
    counts: Vec<u32>,
    distinct: u32,
    masked_positions: Vec<usize>,
    frequencies: Option<Arc<[f64]>>,
}

impl SpacedKmerEncoder {
    fn new(cfg: &EncoderConfig) -> Self {
        let base = cfg.base as u64;
        let raw = cfg.mask.blocks();
        let mut blocks = Vec::with_capacity(raw.len());
        let mut right = cfg.mask.weight();
        for &(start, len) in &raw {
            right -= len;
            // Both fit: the whole k-mer range was validated in EncoderConfig::new.
            let lead = base.pow(len as u32 - 1);
            let scale = base.pow(right as u32);
            blocks.push(Block {
                start,
                len,
                lead,
                scale,
            });
        }
        let masked_positions = cfg
            .mask
            .bits()
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
            .collect();
        let mut enc = SpacedKmerEncoder {
            base,
            k: cfg.mask.k(),
            values: vec![0; blocks.len()],
            blocks,
            window: vec![0; cfg.mask.k()],
            head: 0,
            encoding: 0,
            counts: vec![0; cfg.base as usize],
            distinct: 0,
            masked_positions,
            frequencies: cfg.frequencies.clone(),
        };
        enc.reset();
        enc
    }

    /// Clear the window to all-zero digits.
    pub fn reset(&mut self) {
        self.window.iter_mut().for_each(|d| *d = 0);
        self.head = 0;
        self.values.iter_mut().for_each(|v| *v = 0);
        self.encoding = 0;
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.counts[0] = self.masked_positions.len() as u32;
        self.distinct = 1;
    }

    #[inline]
    fn at(&self, pos: usize) -> u8 {
        let i = self.head + pos;
        self.window[if i >= self.k { i - self.k } else { i }]
    }

    #[inline]
    fn count_in(&mut self, d: u8) {
        let c = &mut self.counts[d as usize];
        if *c == 0 {
            self.distinct += 1;
        }
        *c += 1;
    }

    #[inline]
    fn count_out(&mut self, d: u8) {
        let c = &mut self.counts[d as usize];
        *c -= 1;
        if *c == 0 {
            self.distinct -= 1;
        }
    }

    /// Push `digit` on the right edge and return the new encoding.
    ///
    /// `digit` must be below the configured base.
    #[inline]
    pub fn add(&mut self, digit: u8) -> u64 {
        debug_assert!((digit as u64) < self.base, "digit {digit} out of range");
        let mut encoding = 0u64;
        for b in 0..self.blocks.len() {
            let (start, len, lead, scale) = {
                let blk = &self.blocks[b];
                (blk.start, blk.len, blk.lead, blk.scale)
            };
            let leaving = self.at(start);
            let entering = if start + len == self.k {
                digit
            } else {
                self.at(start + len)
            };
            let v = (self.values[b] - leaving as u64 * lead) * self.base + entering as u64;
            self.values[b] = v;
            encoding += v * scale;
            if leaving != entering {
                self.count_out(leaving);
                self.count_in(entering);
            }
        }
        // overwrite the oldest slot, which becomes the newest
        self.window[self.head] = digit;
        self.head += 1;
        if self.head == self.k {
            self.head = 0;
        }
        self.encoding = encoding;
        encoding
    }

    /// Current encoding.
    #[inline]
    pub fn encoding(&self) -> u64 {
        self.encoding
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of distinct digits at masked positions of the window.
    #[inline]
    pub fn complexity(&self) -> u32 {
        self.distinct
    }

    /// Product of background frequencies of the masked digits (1.0 without a model).
    pub fn probability(&self) -> f64 {
        match &self.frequencies {
            None => 1.0,
            Some(freqs) => self
                .masked_positions
                .iter()
                .map(|&p| freqs[self.at(p) as usize])
                .product(),
        }
    }
}

/// Thomas Wang's 64→32-bit integer hash (`hash6432shift`).
#[inline]
pub fn window_hash(key: u64) -> u32 {
    let mut key = (!key).wrapping_add(key << 18);
    key ^= key >> 31;
    key = key.wrapping_mul(21);
    key ^= key >> 11;
    key = key.wrapping_add(key << 6);
    key ^= key >> 22;
    key as u32
}

/// Encode a full window without rolling state (reference implementation).
pub fn encode_window(window: &[u8], mask: &Mask, base: u32) -> u64 {
    debug_assert_eq!(window.len(), mask.k());
    window
        .iter()
        .zip(mask.bits())
        .filter(|&(_, &m)| m)
        .fold(0u64, |acc, (&d, _)| acc * base as u64 + d as u64)
}
