//! Symbol alphabets: byte → digit tables used before k-mer encoding.
//!
//! Every alphabet maps a raw sequence byte to a digit in `[0, base)`. Bytes
//! without a mapping either fall back to a designated digit (e.g. `N` for
//! nucleotides, the "other" class for amino acids) or are rejected.

use std::str::FromStr;

use crate::index::IndexError;

const X: u8 = 0xFF;

/// A, C, G, T/U → 0..3. Nothing else maps.
const DNA4_TABLE: [u8; 256] = {
    let mut t = [X; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t[b'U' as usize] = 3;
    t[b'u' as usize] = 3;
    t
};

static DNA4_LUT: [u8; 256] = DNA4_TABLE;

/// DNA4 plus an explicit `N` digit (4).
static DNA5_LUT: [u8; 256] = {
    let mut t = DNA4_TABLE;
    t[b'N' as usize] = 4;
    t[b'n' as usize] = 4;
    t
};

/// Reduced 11-letter amino-acid alphabet.
///
/// Classes: {B,D,E,K,N,O,Q,R,X,Z} {A,S,T} {I,J,L,V} {G} {P} {F} {Y} {C,U} {H} {M} {W}.
const BASE11_TABLE: [u8; 256] = {
    let mut t = [X; 256];
    let classes: [&[u8]; 11] = [
        b"BDEKNOQRXZ",
        b"AST",
        b"IJLV",
        b"G",
        b"P",
        b"F",
        b"Y",
        b"CU",
        b"H",
        b"M",
        b"W",
    ];
    let mut class = 0;
    while class < classes.len() {
        let members = classes[class];
        let mut i = 0;
        while i < members.len() {
            let upper = members[i];
            t[upper as usize] = class as u8;
            t[(upper + 32) as usize] = class as u8;
            i += 1;
        }
        class += 1;
    }
    t
};

static BASE11_LUT: [u8; 256] = BASE11_TABLE;

/// Standard genetic code, codons ordered by `T C A G` at each position.
const GENETIC_CODE: &[u8; 64] =
    b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

/// Codon index → base11 digit; stop codons map to `X`.
static CODON_LUT: [u8; 64] = {
    let mut t = [X; 64];
    let mut i = 0;
    while i < 64 {
        let aa = GENETIC_CODE[i];
        if aa != b'*' {
            t[i] = BASE11_TABLE[aa as usize];
        }
        i += 1;
    }
    t
};

/// The alphabets known to the indexer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Alphabet {
    /// A, C, G, T (base 4). Ambiguous bases are an error.
    Dna4,
    /// A, C, G, T, N (base 5). Any unknown byte becomes N.
    Dna5,
    /// Reduced amino-acid alphabet (base 11). Unknown residues join class 0.
    Base11,
}

impl Alphabet {
    /// Number of distinct digits.
    pub fn base(self) -> u32 {
        match self {
            Alphabet::Dna4 => 4,
            Alphabet::Dna5 => 5,
            Alphabet::Base11 => 11,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Alphabet::Dna4 => "dna4",
            Alphabet::Dna5 => "dna5",
            Alphabet::Base11 => "base11",
        }
    }

    fn lut(self) -> &'static [u8; 256] {
        match self {
            Alphabet::Dna4 => &DNA4_LUT,
            Alphabet::Dna5 => &DNA5_LUT,
            Alphabet::Base11 => &BASE11_LUT,
        }
    }

    fn fallback(self) -> Option<u8> {
        match self {
            Alphabet::Dna4 => None,
            Alphabet::Dna5 => Some(4),
            Alphabet::Base11 => Some(0),
        }
    }

    /// Map one byte to its digit, applying the fallback for unknown bytes.
    #[inline]
    pub fn digit(self, b: u8) -> Option<u8> {
        let v = self.lut()[b as usize];
        if v != X { Some(v) } else { self.fallback() }
    }

    /// Translate a raw sequence into digits.
    pub fn encode(self, seq: &[u8]) -> Result<Vec<u8>, IndexError> {
        seq.iter()
            .map(|&b| {
                self.digit(b).ok_or(IndexError::InvalidSymbol {
                    byte: b,
                    alphabet: self.name(),
                })
            })
            .collect()
    }
}

impl FromStr for Alphabet {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dna4" | "dna" => Ok(Alphabet::Dna4),
            "dna5" => Ok(Alphabet::Dna5),
            "base11" | "protein" => Ok(Alphabet::Base11),
            other => Err(IndexError::Config(format!("unknown alphabet `{other}`"))),
        }
    }
}

#[inline]
fn nucleotide_rank(b: u8) -> Option<usize> {
    match b {
        b'T' | b't' | b'U' | b'u' => Some(0),
        b'C' | b'c' => Some(1),
        b'A' | b'a' => Some(2),
        b'G' | b'g' => Some(3),
        _ => None,
    }
}

#[inline]
fn complement(b: u8) -> u8 {
    match b {
        b'A' | b'a' => b'T',
        b'C' | b'c' => b'G',
        b'G' | b'g' => b'C',
        b'T' | b't' | b'U' | b'u' => b'A',
        _ => b'N',
    }
}

/// Base11 digit of one codon, or `None` for stop codons and ambiguous bases.
#[inline]
fn translate_codon(codon: &[u8]) -> Option<u8> {
    let mut idx = 0;
    for &b in codon {
        idx = idx * 4 + nucleotide_rank(b)?;
    }
    let digit = CODON_LUT[idx];
    (digit != X).then_some(digit)
}

/// Translate a nucleotide sequence in all six reading frames into base11 digits.
///
/// The three forward frames come first, then the three frames of the reverse
/// complement. Each frame is split at stop codons and at codons containing
/// anything but A, C, G, T/U; only non-empty segments are returned.
pub fn translate_six_frames(seq: &[u8]) -> Vec<Vec<u8>> {
    let reverse: Vec<u8> = seq.iter().rev().map(|&b| complement(b)).collect();
    let mut out = Vec::new();
    for strand in [seq, &reverse[..]] {
        for frame in 0..3 {
            let mut segment = Vec::new();
            for codon in strand.get(frame..).unwrap_or_default().chunks_exact(3) {
                match translate_codon(codon) {
                    Some(digit) => segment.push(digit),
                    None if !segment.is_empty() => out.push(std::mem::take(&mut segment)),
                    None => {}
                }
            }
            if !segment.is_empty() {
                out.push(segment);
            }
        }
    }
    out
}

/// Relative digit frequencies over already-encoded sequences.
///
/// Used as the background model for probability filtering. Digits that never
/// occur get frequency 0; an empty input yields a uniform distribution.
pub fn digit_frequencies<'a, I>(base: u32, sequences: I) -> Vec<f64>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut counts = vec![0u64; base as usize];
    let mut total = 0u64;
    for seq in sequences {
        for &d in seq {
            if let Some(c) = counts.get_mut(d as usize) {
                *c += 1;
                total += 1;
            }
        }
    }
    if total == 0 {
        return vec![1.0 / base as f64; base as usize];
    }
    counts.iter().map(|&c| c as f64 / total as f64).collect()
}
