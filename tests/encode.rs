use spaced_kmer_shard_indexer::encode::encode_window;
use spaced_kmer_shard_indexer::*;

fn extractor(base: u32, mask: &str, mode: ExtractionMode) -> KmerExtractor {
    let cfg = EncoderConfig::new(base, mask.parse().unwrap()).unwrap();
    KmerExtractor::new(&cfg, mode).unwrap()
}

#[test]
fn test_plain_acgt() {
    let seq = Alphabet::Dna4.encode(b"ACGT").unwrap();
    let mut ex = extractor(4, "111", ExtractionMode::Plain);
    assert_eq!(ex.extract(&seq), vec![6, 27]);
}

#[test]
fn test_spaced_mask_skips_positions() {
    // mask 101 over ACG -> digits A,G = 0*4 + 2
    let seq = Alphabet::Dna4.encode(b"ACGTA").unwrap();
    let mut ex = extractor(4, "101", ExtractionMode::Plain);
    assert_eq!(ex.extract(&seq), vec![2, 7, 8]);
}

#[test]
fn test_rolling_matches_reference() {
    let mask: Mask = "1101100111".parse().unwrap();
    let cfg = EncoderConfig::new(11, mask.clone()).unwrap();
    let seq: Vec<u8> = (0..200u32).map(|i| ((i * 7 + i / 3) % 11) as u8).collect();
    let mut ex = KmerExtractor::new(&cfg, ExtractionMode::Plain).unwrap();
    let got = ex.extract(&seq);
    let expected: Vec<u64> = seq
        .windows(mask.k())
        .map(|w| encode_window(w, &mask, 11))
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn test_zero_padded_prefix() {
    let cfg = EncoderConfig::new(5, "1111".parse().unwrap()).unwrap();
    let mut enc = cfg.build();
    assert_eq!(enc.add(3), 3);
    assert_eq!(enc.add(1), 3 * 5 + 1);
    enc.reset();
    assert_eq!(enc.encoding(), 0);
    assert_eq!(enc.add(4), 4);
}

#[test]
fn test_complexity_tracks_masked_digits() {
    let cfg = EncoderConfig::new(4, "10101".parse().unwrap()).unwrap();
    let mut enc = cfg.build();
    // window after all adds: 0 1 1 2 1 -> masked digits 0, 1, 1
    for d in [0, 1, 1, 2, 1] {
        enc.add(d);
    }
    assert_eq!(enc.complexity(), 2);
    enc.add(3);
    // 1 1 2 1 3 -> masked 1, 2, 3
    assert_eq!(enc.complexity(), 3);
}

#[test]
fn test_probability_product() {
    let cfg = EncoderConfig::new(4, "11".parse().unwrap())
        .unwrap()
        .with_frequencies(vec![0.1, 0.2, 0.3, 0.4])
        .unwrap();
    let mut enc = cfg.build();
    enc.add(1);
    enc.add(3);
    assert!((enc.probability() - 0.08).abs() < 1e-12);
}

#[test]
fn test_config_rejects_overflow_and_bad_masks() {
    // 4^32 - 1 fits, 4^33 - 1 does not
    assert!(EncoderConfig::new(4, Mask::contiguous(32).unwrap()).is_ok());
    assert!(matches!(
        EncoderConfig::new(4, Mask::contiguous(33).unwrap()),
        Err(IndexError::Config(_))
    ));
    assert!(EncoderConfig::new(1, Mask::contiguous(3).unwrap()).is_err());
    assert!("000".parse::<Mask>().is_err());
    assert!("10x1".parse::<Mask>().is_err());
}

#[test]
fn test_short_sequences_are_empty() {
    let mut plain = extractor(4, "1111", ExtractionMode::Plain);
    assert!(plain.extract(&[0, 1, 2]).is_empty());
    let mut win = extractor(4, "1111", ExtractionMode::minimizer(8));
    assert!(win.extract(&[0, 1, 2, 3, 0, 1, 2]).is_empty());
    assert!(!win.extract(&[0, 1, 2, 3, 0, 1, 2, 3]).is_empty());
}

#[test]
fn test_window_hash_is_stable() {
    assert_eq!(window_hash(0), window_hash(0));
    assert_ne!(window_hash(1), window_hash(2));
}

#[test]
fn test_iter_restarts() {
    let mut ex = extractor(4, "11", ExtractionMode::Plain);
    let first: Vec<u64> = ex.iter(&[1, 2, 3]).take(1).collect();
    let again = ex.extract(&[1, 2, 3]);
    assert_eq!(first, vec![6]);
    assert_eq!(again, vec![6, 11]);
}
