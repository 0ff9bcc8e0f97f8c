use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use spaced_kmer_shard_indexer::bucket::DEFAULT_CONTINGENT_SIZE;
use spaced_kmer_shard_indexer::*;

const MASK: &str = "11011";
const BUCKET_BITS: u32 = 3;
const ID_BITS: u32 = 8;

/// Deterministic DNA4 digits.
fn random_seq(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8 & 3
        })
        .collect()
}

fn reads(n: u32) -> Vec<SequenceRecord> {
    (0..n)
        .map(|i| SequenceRecord::new(i, format!("read_{i} sample=A"), random_seq(i as u64, 60)))
        .collect()
}

fn setup(mode: ExtractionMode) -> (KmerExtractor, BitLayout) {
    let cfg = EncoderConfig::new(4, MASK.parse().unwrap()).unwrap();
    let layout = BitLayout::new(&cfg, BUCKET_BITS, ID_BITS).unwrap();
    (KmerExtractor::new(&cfg, mode).unwrap(), layout)
}

fn config() -> BuildConfig {
    BuildConfig::default().with_threads(4).with_batch_size(3)
}

/// Every `(kmer, id)` of an index, sorted.
fn dump(dir: &Path, layout: BitLayout) -> Vec<(u64, u32)> {
    let index = ShardedIndex::open(dir, layout).unwrap();
    let mut out = Vec::new();
    for shard in 0..index.num_buckets() {
        for pair in index.entries(shard).unwrap() {
            out.push(pair.unwrap());
        }
    }
    out.sort_unstable();
    out
}

fn shard_contents(dir: &Path, layout: BitLayout) -> Vec<Vec<u64>> {
    let index = ShardedIndex::open(dir, layout).unwrap();
    (0..index.num_buckets())
        .map(|s| index.reader(s).unwrap().read_to_vec().unwrap())
        .collect()
}

/// Child → parent; the root is its own parent.
struct ParentMap(HashMap<u32, u32>);

impl ParentMap {
    fn lineage(&self, mut taxon: u32) -> Vec<u32> {
        let mut out = vec![taxon];
        while let Some(&p) = self.0.get(&taxon) {
            if p == taxon {
                break;
            }
            out.push(p);
            taxon = p;
        }
        out
    }
}

impl Taxonomy for ParentMap {
    fn contains(&self, tax_id: u32) -> bool {
        self.0.contains_key(&tax_id)
    }

    fn lca(&self, a: u32, b: u32) -> u32 {
        let up: BTreeSet<u32> = self.lineage(a).into_iter().collect();
        self.lineage(b)
            .into_iter()
            .find(|t| up.contains(t))
            .unwrap_or(1)
    }
}

//        1
//      /   \
//     2     3
//    / \     \
//   4   5    300
fn small_tree() -> ParentMap {
    ParentMap(HashMap::from([(1, 1), (2, 1), (3, 1), (4, 2), (5, 2), (300, 3)]))
}

struct CountingSource<'a> {
    inner: InMemorySource,
    resets: &'a AtomicUsize,
}

impl SequenceSource for CountingSource<'_> {
    fn next_record(&mut self) -> Result<Option<SequenceRecord>, IndexError> {
        self.inner.next_record()
    }

    fn reset(&mut self) -> Result<(), IndexError> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        self.inner.reset()
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }
}

#[test]
fn test_multi_cycle_matches_single_cycle() {
    let (mut extractor, layout) = setup(ExtractionMode::Plain);
    let records = reads(40);

    let single = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(records.clone());
    let report = build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Reads,
        single.path(),
        &config().with_buckets_per_cycle(8),
    )
    .unwrap();
    assert_eq!(report.cycles, 1);

    let multi = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(records.clone());
    let report_multi = build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Reads,
        multi.path(),
        &config().with_buckets_per_cycle(3),
    )
    .unwrap();
    assert_eq!(report_multi.cycles, 3);
    assert_eq!(report_multi.records_processed, 40);
    assert_eq!(report.entries_per_shard, report_multi.entries_per_shard);

    let a = shard_contents(single.path(), layout);
    let b = shard_contents(multi.path(), layout);
    assert_eq!(a, b);
    for shard in &a {
        assert!(shard.windows(2).all(|p| p[0] <= p[1]));
    }

    // read mode keeps every occurrence
    let mut expected: Vec<(u64, u32)> = records
        .iter()
        .flat_map(|r| extractor.extract(&r.symbols).into_iter().map(move |k| (k, r.id)))
        .collect();
    expected.sort_unstable();
    assert_eq!(report.total_entries(), expected.len() as u64);
    assert_eq!(dump(multi.path(), layout), expected);
}

#[test]
fn test_delta_varint_index_decodes() {
    let (mut extractor, layout) = setup(ExtractionMode::minimizer(8));
    let records = reads(25);
    let out = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(records.clone());
    build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Reads,
        out.path(),
        &config()
            .with_buckets_per_cycle(2)
            .with_compression(Compression::DeltaVarint),
    )
    .unwrap();

    let mut expected: Vec<(u64, u32)> = records
        .iter()
        .flat_map(|r| extractor.extract(&r.symbols).into_iter().map(move |k| (k, r.id)))
        .collect();
    expected.sort_unstable();
    assert_eq!(dump(out.path(), layout), expected);
    let index = ShardedIndex::open(out.path(), layout).unwrap();
    assert_eq!(index.compression(), Compression::DeltaVarint);
}

#[test]
fn test_database_collapses_to_lca() {
    let (mut extractor, layout) = setup(ExtractionMode::Plain);
    let tree = small_tree();
    let shared = random_seq(7, 80);
    let other = random_seq(8, 80);
    let records = vec![
        SequenceRecord::new(4, "4 strain a", shared.clone()),
        SequenceRecord::new(5, "5 strain b", shared.clone()),
        SequenceRecord::new(3, "3 strain c", other.clone()),
        SequenceRecord::new(99, "99 unknown", random_seq(9, 80)),
    ];

    let out = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(records.clone());
    let report = build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Database(&tree),
        out.path(),
        &config().with_buckets_per_cycle(4),
    )
    .unwrap();
    assert_eq!(report.records_processed, 3);
    assert_eq!(report.records_skipped, 1);

    let mut taxa: BTreeMap<u64, u32> = BTreeMap::new();
    for rec in records.iter().filter(|r| tree.contains(r.id)) {
        for kmer in extractor.extract(&rec.symbols) {
            taxa.entry(kmer)
                .and_modify(|t| *t = tree.lca(*t, rec.id))
                .or_insert(rec.id);
        }
    }
    let expected: Vec<(u64, u32)> = taxa.into_iter().collect();
    let got = dump(out.path(), layout);
    assert_eq!(got, expected);

    // 4 and 5 share their sequence, so nothing maps to either leaf
    assert!(got.iter().all(|&(_, t)| t == 1 || t == 2 || t == 3));
    assert!(got.iter().any(|&(_, t)| t == 2));
    let counted: u64 = report.kmers_per_taxon.values().sum();
    assert_eq!(counted, report.total_entries());
    assert_eq!(
        report.kmers_per_taxon.get(&2).copied().unwrap_or(0),
        got.iter().filter(|&&(_, t)| t == 2).count() as u64
    );
}

#[test]
fn test_read_headers_are_recorded() {
    let (extractor, layout) = setup(ExtractionMode::Plain);
    let out = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(reads(12));
    build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Reads,
        out.path(),
        &config().with_buckets_per_cycle(3),
    )
    .unwrap();

    let text = fs::read_to_string(out.path().join("header_index.txt")).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("12"));
    assert_eq!(lines.next(), Some("0\tread_0 sample=A"));

    let index = ShardedIndex::open(out.path(), layout).unwrap();
    let headers = index.read_headers().unwrap();
    assert_eq!(headers.len(), 12);
    for (i, (id, header)) in headers.iter().enumerate() {
        assert_eq!(*id, i as u32);
        assert_eq!(header, &format!("read_{i} sample=A"));
    }
    assert!(index.tree_path().is_none());
}

#[test]
fn test_caching_source_avoids_rereads() {
    let (extractor, layout) = setup(ExtractionMode::Plain);
    let records = reads(20);

    let resets = AtomicUsize::new(0);
    let mut plain = CountingSource {
        inner: InMemorySource::new(records.clone()),
        resets: &resets,
    };
    let plain_out = tempfile::tempdir().unwrap();
    let report = build_index(
        &mut plain,
        &extractor,
        &layout,
        IndexKind::Reads,
        plain_out.path(),
        &config().with_buckets_per_cycle(2),
    )
    .unwrap();
    // one rewind after sampling, one before every cycle but the first
    assert_eq!(resets.load(Ordering::Relaxed), 1 + report.cycles - 1);

    let cached_resets = AtomicUsize::new(0);
    let mut cached = CachingSource::new(CountingSource {
        inner: InMemorySource::new(records),
        resets: &cached_resets,
    });
    let cached_out = tempfile::tempdir().unwrap();
    build_index(
        &mut cached,
        &extractor,
        &layout,
        IndexKind::Reads,
        cached_out.path(),
        &config().with_buckets_per_cycle(2),
    )
    .unwrap();
    assert!(cached.is_cached());
    assert_eq!(cached_resets.load(Ordering::Relaxed), 0);
    assert_eq!(
        shard_contents(plain_out.path(), layout),
        shard_contents(cached_out.path(), layout)
    );
}

#[test]
fn test_shard_errors() {
    let (extractor, layout) = setup(ExtractionMode::Plain);
    let out = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(reads(30));
    let report = build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Reads,
        out.path(),
        &config(),
    )
    .unwrap();
    let index = ShardedIndex::open(out.path(), layout).unwrap();
    assert_eq!(index.total_entries().unwrap(), report.total_entries());

    let shard = report
        .entries_per_shard
        .iter()
        .position(|&n| n > 1)
        .unwrap();

    let mut reader = index.reader(shard).unwrap();
    reader.read_to_vec().unwrap();
    assert!(matches!(
        reader.next_entry(),
        Err(IndexError::ShardExhausted { shard: s, .. }) if s == shard
    ));

    // cut the last entry short
    let path = index.dir().bucket_path(shard);
    let len = fs::metadata(&path).unwrap().len();
    fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 3)
        .unwrap();
    assert!(matches!(
        index.reader(shard).and_then(|mut r| r.read_to_vec()),
        Err(IndexError::CorruptShard { shard: s, .. }) if s == shard
    ));

    fs::write(&path, [0u8, 0]).unwrap();
    assert!(matches!(
        index.reader(shard),
        Err(IndexError::CorruptShard { .. })
    ));

    fs::remove_file(&path).unwrap();
    assert!(matches!(
        ShardedIndex::open(out.path(), layout),
        Err(IndexError::MissingShard { shard: s, .. }) if s == shard
    ));
}

#[test]
fn test_unreachable_filter_is_degenerate() {
    // weight-4 mask over DNA4 has at most 4 distinct digits
    let (extractor, layout) = setup(ExtractionMode::Filtered(KmerFilter::Complexity {
        min_exclusive: 4,
    }));
    let out = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(reads(10));
    let err = build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Reads,
        out.path(),
        &config(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        IndexError::DegenerateFilter { max_estimate: 0, sampled: 10 }
    ));

    let mut empty = InMemorySource::default();
    assert!(matches!(
        build_index(
            &mut empty,
            &extractor,
            &layout,
            IndexKind::Reads,
            out.path(),
            &config()
        ),
        Err(IndexError::DegenerateFilter { .. })
    ));
}

#[test]
fn test_read_ids_must_fit_layout() {
    let cfg = EncoderConfig::new(4, MASK.parse().unwrap()).unwrap();
    let layout = BitLayout::new(&cfg, BUCKET_BITS, 2).unwrap();
    let extractor = KmerExtractor::new(&cfg, ExtractionMode::Plain).unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut src = InMemorySource::new(reads(10));
    assert!(matches!(
        build_index(
            &mut src,
            &extractor,
            &layout,
            IndexKind::Reads,
            out.path(),
            &config()
        ),
        Err(IndexError::IdOutOfRange { id: 4, id_bits: 2 })
    ));
}

#[test]
fn test_small_layout_entry() {
    let layout = BitLayout::from_parts(8, 2, 4, 0b10).unwrap();
    let (shard, entry) = layout.entry_for(5, 9).unwrap();
    assert_eq!(shard, (9 & 0b11) ^ 0b10);
    assert_eq!(layout.extract_id(entry), 5);
    assert_eq!(layout.reconstruct_kmer(shard, entry), 9);
    assert!(matches!(
        layout.entry_for(16, 9),
        Err(IndexError::IdOutOfRange { id: 16, id_bits: 4 })
    ));
}

fn shard_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".bin"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_database_ids_must_fit_before_any_shard_is_written() {
    let (extractor, layout) = setup(ExtractionMode::Plain);
    let tree = small_tree();
    let records = vec![
        SequenceRecord::new(4, "4 strain a", random_seq(1, 80)),
        SequenceRecord::new(300, "300 strain z", vec![0u8; 80]),
    ];

    // a sample of one record leaves the oversized taxon to the first cycle
    for sample_size in [1, 10_000] {
        let out = tempfile::tempdir().unwrap();
        let mut src = InMemorySource::new(records.clone());
        let result = build_index(
            &mut src,
            &extractor,
            &layout,
            IndexKind::Database(&tree),
            out.path(),
            &config().with_buckets_per_cycle(1).with_sample_size(sample_size),
        );
        assert!(
            matches!(result, Err(IndexError::IdOutOfRange { id: 300, id_bits: ID_BITS })),
            "sample size {sample_size}"
        );
        assert!(shard_files(out.path()).is_empty(), "sample size {sample_size}");
    }
}

#[test]
fn test_memory_budget_covers_contingent_slack() {
    let (extractor, layout) = setup(ExtractionMode::Plain);
    let budget = 64 << 10;
    let threads = 8;

    for contingent in [64, DEFAULT_CONTINGENT_SIZE] {
        let out = tempfile::tempdir().unwrap();
        let mut src = InMemorySource::new(reads(200));
        let report = build_index(
            &mut src,
            &extractor,
            &layout,
            IndexKind::Reads,
            out.path(),
            &BuildConfig::default()
                .with_threads(threads)
                .with_memory_budget(budget)
                .with_contingent_size(contingent),
        )
        .unwrap();
        let per_shard = (report.max_estimate + (contingent * threads) as u64) * 8;
        let bpc = report.buckets_per_cycle as u64;
        assert!(
            bpc == 1 || bpc * per_shard <= budget,
            "contingent {contingent}: {bpc} shards of {per_shard} bytes"
        );
        if contingent == DEFAULT_CONTINGENT_SIZE {
            assert_eq!(bpc, 1);
        } else {
            assert!(bpc > 1);
        }
        assert_eq!(report.records_processed, 200);
    }
}

/// Serves records normally, then fails partway through a chosen pass.
struct FailingSource {
    inner: InMemorySource,
    pass: usize,
    served: usize,
    fail_pass: usize,
    fail_at: usize,
}

impl SequenceSource for FailingSource {
    fn next_record(&mut self) -> Result<Option<SequenceRecord>, IndexError> {
        if self.pass == self.fail_pass && self.served == self.fail_at {
            return Err(IndexError::Source(format!("unreadable record {}", self.served)));
        }
        self.served += 1;
        self.inner.next_record()
    }

    fn reset(&mut self) -> Result<(), IndexError> {
        self.pass += 1;
        self.served = 0;
        self.inner.reset()
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }
}

#[test]
fn test_source_error_aborts_the_cycle() {
    let (extractor, layout) = setup(ExtractionMode::Plain);
    let out = tempfile::tempdir().unwrap();
    // pass 0 samples, pass 1 is the first cycle, pass 2 the second
    let mut src = FailingSource {
        inner: InMemorySource::new(reads(30)),
        pass: 0,
        served: 0,
        fail_pass: 2,
        fail_at: 7,
    };
    let err = build_index(
        &mut src,
        &extractor,
        &layout,
        IndexKind::Reads,
        out.path(),
        &config().with_buckets_per_cycle(2),
    )
    .unwrap_err();
    match err {
        IndexError::Source(msg) => assert_eq!(msg, "unreadable record 7"),
        other => panic!("unexpected error: {other}"),
    }
    // the first cycle completed, the second never flushed
    assert_eq!(shard_files(out.path()), vec!["0.bin", "1.bin"]);
}
