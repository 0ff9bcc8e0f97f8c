//! K-mer extraction strategies over digit sequences.
//!
//! All strategies drive a [`SpacedKmerEncoder`] across the sequence. They
//! differ in which encodings are yielded:
//! - `Plain`: every window of length `k`.
//! - `Filtered`: windows whose encoder state passes a [`KmerFilter`].
//! - `Minimizer` / `Maximizer`: one representative per window of `W` digits,
//!   chosen by a [`WindowScore`], with consecutive duplicates suppressed.
//!
//! Ties between equal scores always resolve to the leftmost (oldest) k-mer in
//! the window, both when a new k-mer arrives and when the window is rescanned.

use std::fmt;
use std::str::FromStr;

use crate::encode::{EncoderConfig, SpacedKmerEncoder, window_hash};
use crate::index::IndexError;

/// Predicate on the encoder state of the current window.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum KmerFilter {
    /// Keep if the number of distinct masked digits is greater than the threshold.
    Complexity { min_exclusive: u32 },
    /// Keep if the background probability is below the threshold.
    Probability { max_exclusive: f64 },
}

impl KmerFilter {
    #[inline]
    fn keep(&self, enc: &SpacedKmerEncoder) -> bool {
        match *self {
            KmerFilter::Complexity { min_exclusive } => enc.complexity() > min_exclusive,
            KmerFilter::Probability { max_exclusive } => enc.probability() < max_exclusive,
        }
    }
}

/// Score used to pick the representative k-mer of a window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WindowScore {
    /// 32-bit avalanche hash of the encoding.
    Hash,
    /// Distinct masked digits.
    Complexity,
    /// Background probability.
    Probability,
}

impl WindowScore {
    #[inline]
    fn score(self, enc: &SpacedKmerEncoder, encoding: u64) -> f64 {
        match self {
            WindowScore::Hash => window_hash(encoding) as f64,
            WindowScore::Complexity => enc.complexity() as f64,
            WindowScore::Probability => enc.probability(),
        }
    }
}

/// Cloneable description of an extraction strategy.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ExtractionMode {
    Plain,
    Filtered(KmerFilter),
    /// Smallest score per window of `window` digits.
    Minimizer { window: usize, score: WindowScore },
    /// Largest score per window of `window` digits.
    Maximizer { window: usize, score: WindowScore },
}

impl Default for ExtractionMode {
    /// Complexity > 3, which drops low-information repeats.
    fn default() -> Self {
        ExtractionMode::Filtered(KmerFilter::Complexity { min_exclusive: 3 })
    }
}

impl ExtractionMode {
    /// Hash minimizer over windows of `window` digits.
    pub fn minimizer(window: usize) -> Self {
        ExtractionMode::Minimizer {
            window,
            score: WindowScore::Hash,
        }
    }

    /// Complexity maximizer over windows of `window` digits.
    pub fn maximizer(window: usize) -> Self {
        ExtractionMode::Maximizer {
            window,
            score: WindowScore::Complexity,
        }
    }

    /// Lowest-probability k-mer per window of `window` digits.
    pub fn probability_minimizer(window: usize) -> Self {
        ExtractionMode::Minimizer {
            window,
            score: WindowScore::Probability,
        }
    }

    /// True if the mode reads background frequencies.
    pub fn needs_frequencies(&self) -> bool {
        matches!(
            self,
            ExtractionMode::Filtered(KmerFilter::Probability { .. })
                | ExtractionMode::Minimizer {
                    score: WindowScore::Probability,
                    ..
                }
                | ExtractionMode::Maximizer {
                    score: WindowScore::Probability,
                    ..
                }
        )
    }

    /// Check the mode against the encoder it will drive.
    pub fn validate(&self, cfg: &EncoderConfig) -> Result<(), IndexError> {
        let k = cfg.mask().k();
        match *self {
            // an unreachable complexity threshold surfaces as DegenerateFilter
            ExtractionMode::Plain | ExtractionMode::Filtered(KmerFilter::Complexity { .. }) => {
                Ok(())
            }
            ExtractionMode::Filtered(KmerFilter::Probability { max_exclusive }) => {
                if !(0.0..=1.0).contains(&max_exclusive) {
                    return Err(IndexError::Config(format!(
                        "probability threshold must be in [0, 1], got {max_exclusive}"
                    )));
                }
                Ok(())
            }
            ExtractionMode::Minimizer { window, .. } | ExtractionMode::Maximizer { window, .. } => {
                if window <= k {
                    return Err(IndexError::Config(format!(
                        "window size {window} must be larger than k = {k}"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn parse_arg<T: FromStr>(input: &str, raw: &str) -> Result<T, IndexError> {
    raw.trim()
        .parse()
        .map_err(|_| IndexError::Config(format!("invalid filter threshold in `{input}`")))
}

fn window_arg(input: &str, prefix: &str) -> Option<Result<usize, IndexError>> {
    let inner = input.strip_prefix(prefix)?.strip_prefix('(')?.strip_suffix(')')?;
    Some(parse_arg(input, inner))
}

impl FromStr for ExtractionMode {
    type Err = IndexError;

    /// Accepts `none`, `complexity>T`, `probability<T`, `minimizer(W)`,
    /// `maximizer(W)` and `probability-minimizer(W)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input == "none" || input == "plain" {
            return Ok(ExtractionMode::Plain);
        }
        if let Some(t) = input.strip_prefix("complexity>") {
            return Ok(ExtractionMode::Filtered(KmerFilter::Complexity {
                min_exclusive: parse_arg(input, t)?,
            }));
        }
        if let Some(t) = input.strip_prefix("probability<") {
            return Ok(ExtractionMode::Filtered(KmerFilter::Probability {
                max_exclusive: parse_arg(input, t)?,
            }));
        }
        if let Some(w) = window_arg(input, "probability-minimizer") {
            return Ok(ExtractionMode::probability_minimizer(w?));
        }
        if let Some(w) = window_arg(input, "minimizer") {
            return Ok(ExtractionMode::minimizer(w?));
        }
        if let Some(w) = window_arg(input, "maximizer") {
            return Ok(ExtractionMode::maximizer(w?));
        }
        Err(IndexError::Config(format!("unknown filtering mode `{input}`")))
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMode::Plain => write!(f, "none"),
            ExtractionMode::Filtered(KmerFilter::Complexity { min_exclusive }) => {
                write!(f, "complexity>{min_exclusive}")
            }
            ExtractionMode::Filtered(KmerFilter::Probability { max_exclusive }) => {
                write!(f, "probability<{max_exclusive}")
            }
            ExtractionMode::Minimizer { window, score } => match score {
                WindowScore::Probability => write!(f, "probability-minimizer({window})"),
                _ => write!(f, "minimizer({window})"),
            },
            ExtractionMode::Maximizer { window, .. } => write!(f, "maximizer({window})"),
        }
    }
}

/// Circular buffer of the last `W - k + 1` (encoding, score) pairs.
#[derive(Clone, Debug)]
struct WindowState {
    score: WindowScore,
    kmers: Vec<u64>,
    scores: Vec<f64>,
    /// Physical slot of logical position 0 (oldest).
    head: usize,
    filled: usize,
    /// Logical index of the current optimum; `None` forces a rescan.
    best: Option<usize>,
    last_emitted: Option<u64>,
}

impl WindowState {
    fn new(window: usize, k: usize, score: WindowScore) -> Self {
        let cap = window - k + 1;
        WindowState {
            score,
            kmers: vec![0; cap],
            scores: vec![0.0; cap],
            head: 0,
            filled: 0,
            best: None,
            last_emitted: None,
        }
    }

    fn reset(&mut self) {
        self.head = 0;
        self.filled = 0;
        self.best = None;
        self.last_emitted = None;
    }

    /// Window size `W` in digits, given `k`.
    fn span(&self, k: usize) -> usize {
        self.kmers.len() + k - 1
    }

    #[inline]
    fn slot(&self, logical: usize) -> usize {
        let i = self.head + logical;
        if i >= self.kmers.len() { i - self.kmers.len() } else { i }
    }

    /// Drop the oldest entry and append a new one at the last logical position.
    #[inline]
    fn push(&mut self, kmer: u64, score: f64) {
        let cap = self.kmers.len();
        if self.filled < cap {
            let s = self.slot(self.filled);
            self.kmers[s] = kmer;
            self.scores[s] = score;
            self.filled += 1;
        } else {
            self.kmers[self.head] = kmer;
            self.scores[self.head] = score;
            self.head = if self.head + 1 == cap { 0 } else { self.head + 1 };
            self.best = self.best.and_then(|b| b.checked_sub(1));
        }
    }

    fn is_full(&self) -> bool {
        self.filled == self.kmers.len()
    }

    /// Slide in one k-mer and return the window's representative if it
    /// differs from the previously emitted one.
    #[inline]
    fn advance(&mut self, kmer: u64, score: f64, maximize: bool) -> Option<u64> {
        let was_full = self.is_full();
        self.push(kmer, score);
        if !self.is_full() {
            return None;
        }
        let newest = self.kmers.len() - 1;
        match self.best {
            Some(b) if was_full => {
                if better(score, self.scores[self.slot(b)], maximize) {
                    self.best = Some(newest);
                }
            }
            _ => self.rescan(maximize),
        }
        let best = self.best.map(|b| self.kmers[self.slot(b)])?;
        if self.last_emitted == Some(best) {
            return None;
        }
        self.last_emitted = Some(best);
        Some(best)
    }

    /// Leftmost optimum over the whole window.
    fn rescan(&mut self, maximize: bool) {
        let mut best = 0;
        let mut best_score = self.scores[self.slot(0)];
        for i in 1..self.kmers.len() {
            let s = self.scores[self.slot(i)];
            if better(s, best_score, maximize) {
                best = i;
                best_score = s;
            }
        }
        self.best = Some(best);
    }
}

#[inline]
fn better(candidate: f64, current: f64, maximize: bool) -> bool {
    if maximize {
        candidate > current
    } else {
        candidate < current
    }
}

#[derive(Clone, Debug)]
enum Strategy {
    Plain,
    Filtered(KmerFilter),
    Minimizer(WindowState),
    Maximizer(WindowState),
}

/// Extractor with its own encoder and selection state.
///
/// Only built through [`KmerExtractor::new`], which validates the mode
/// against the encoder. Not shared between threads: clone one per worker.
#[derive(Clone, Debug)]
pub struct KmerExtractor {
    encoder: SpacedKmerEncoder,
    strategy: Strategy,
}

impl KmerExtractor {
    pub fn new(cfg: &EncoderConfig, mode: ExtractionMode) -> Result<Self, IndexError> {
        mode.validate(cfg)?;
        if mode.needs_frequencies() && !cfg.has_frequencies() {
            return Err(IndexError::Config(format!(
                "filtering mode `{mode}` requires digit frequencies"
            )));
        }
        let k = cfg.mask().k();
        let strategy = match mode {
            ExtractionMode::Plain => Strategy::Plain,
            ExtractionMode::Filtered(filter) => Strategy::Filtered(filter),
            ExtractionMode::Minimizer { window, score } => {
                Strategy::Minimizer(WindowState::new(window, k, score))
            }
            ExtractionMode::Maximizer { window, score } => {
                Strategy::Maximizer(WindowState::new(window, k, score))
            }
        };
        Ok(KmerExtractor {
            encoder: cfg.build(),
            strategy,
        })
    }

    /// Window length `k` of the underlying mask.
    pub fn k(&self) -> usize {
        self.encoder.k()
    }

    /// Shortest sequence that yields any output.
    pub fn min_len(&self) -> usize {
        match &self.strategy {
            Strategy::Minimizer(window) | Strategy::Maximizer(window) => window.span(self.k()),
            Strategy::Plain | Strategy::Filtered(_) => self.k(),
        }
    }

    /// Lazily yield encodings for `seq`. Restarting resets all state.
    pub fn iter<'e, 's>(&'e mut self, seq: &'s [u8]) -> KmerIter<'e, 's> {
        let done = seq.len() < self.min_len();
        self.encoder.reset();
        if let Strategy::Minimizer(window) | Strategy::Maximizer(window) = &mut self.strategy {
            window.reset();
        }
        KmerIter {
            extractor: self,
            seq,
            pos: 0,
            done,
        }
    }

    /// Collect all encodings for `seq`.
    pub fn extract(&mut self, seq: &[u8]) -> Vec<u64> {
        self.iter(seq).collect()
    }

    /// Append all encodings for `seq` to `out`.
    pub fn extract_into(&mut self, seq: &[u8], out: &mut Vec<u64>) {
        out.extend(self.iter(seq));
    }
}

/// Lazy, finite iterator over the encodings of one sequence.
pub struct KmerIter<'e, 's> {
    extractor: &'e mut KmerExtractor,
    seq: &'s [u8],
    pos: usize,
    done: bool,
}

impl Iterator for KmerIter<'_, '_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.done {
            return None;
        }
        let KmerExtractor { encoder, strategy } = &mut *self.extractor;
        let k = encoder.k();
        while self.pos < self.seq.len() {
            let enc = encoder.add(self.seq[self.pos]);
            self.pos += 1;
            // a full k-mer exists once k digits have been seen
            if self.pos < k {
                continue;
            }
            match &mut *strategy {
                Strategy::Plain => return Some(enc),
                Strategy::Filtered(filter) => {
                    if filter.keep(encoder) {
                        return Some(enc);
                    }
                }
                Strategy::Minimizer(window) => {
                    let score = window.score.score(encoder, enc);
                    if let Some(out) = window.advance(enc, score, false) {
                        return Some(out);
                    }
                }
                Strategy::Maximizer(window) => {
                    let score = window.score.score(encoder, enc);
                    if let Some(out) = window.advance(enc, score, true) {
                        return Some(out);
                    }
                }
            }
        }
        self.done = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Mask;

    fn cfg(base: u32, mask: &str) -> EncoderConfig {
        EncoderConfig::new(base, mask.parse().unwrap()).unwrap()
    }

    #[test]
    fn parse_modes() {
        assert_eq!("none".parse::<ExtractionMode>().unwrap(), ExtractionMode::Plain);
        assert_eq!(
            "complexity>3".parse::<ExtractionMode>().unwrap(),
            ExtractionMode::default()
        );
        assert_eq!(
            "minimizer(15)".parse::<ExtractionMode>().unwrap(),
            ExtractionMode::minimizer(15)
        );
        assert_eq!(
            "probability-minimizer(9)".parse::<ExtractionMode>().unwrap(),
            ExtractionMode::probability_minimizer(9)
        );
        let err = "complexity>x".parse::<ExtractionMode>().unwrap_err();
        assert!(err.to_string().contains("complexity>x"));
        assert!("median(3)".parse::<ExtractionMode>().is_err());
    }

    #[test]
    fn window_must_exceed_k() {
        let c = cfg(4, "111");
        assert!(KmerExtractor::new(&c, ExtractionMode::minimizer(3)).is_err());
        assert!(KmerExtractor::new(&c, ExtractionMode::minimizer(4)).is_ok());
    }

    #[test]
    fn probability_modes_need_frequencies() {
        let c = cfg(4, "111");
        let mode = ExtractionMode::probability_minimizer(5);
        assert!(KmerExtractor::new(&c, mode).is_err());
        let c = c.with_frequencies(vec![0.25; 4]).unwrap();
        assert!(KmerExtractor::new(&c, mode).is_ok());
    }

    #[test]
    fn leftmost_tie_on_arrival_and_rescan() {
        // all-equal complexity: the optimum is always the oldest k-mer
        let c = EncoderConfig::new(4, Mask::contiguous(2).unwrap()).unwrap();
        let mut ex = KmerExtractor::new(&c, ExtractionMode::maximizer(4)).unwrap();
        // k-mers: 01 12 23 30 01, all with complexity 2; the oldest expires each step
        let out = ex.extract(&[0, 1, 2, 3, 0, 1]);
        assert_eq!(out, vec![1, 6, 11]);
    }
}
