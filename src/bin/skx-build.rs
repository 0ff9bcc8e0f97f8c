//! Build a sharded spaced k-mer index from FASTA/FASTQ.
//!
//! Database mode reads the taxon id from the first token of every header and
//! needs a `child<TAB>parent` table for LCA computation. Read mode numbers the
//! records in input order and writes `header_index.txt`. Nucleotide reads
//! indexed with the base11 alphabet are translated in all six frames first.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::{LevelFilter, info};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};
use needletail::{FastxReader, parse_fastx_file};

use spaced_kmer_shard_indexer::{
    Alphabet, BitLayout, BuildConfig, CachingSource, Compression, EncoderConfig, ExtractionMode,
    IndexError, IndexKind, KmerExtractor, Mask, SequenceRecord, SequenceSource, Taxonomy,
    build_index, estimate_digit_frequencies, translate_six_frames,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Reference sequences labelled with taxon ids
    Db,
    /// Reads to be classified
    Reads,
}

/// Build a sharded spaced k-mer index.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(arg_required_else_help = true)]
struct Args {
    /// Input FASTA/FASTQ(.gz) path
    #[arg(short, long)]
    input: PathBuf,

    /// Output index directory
    #[arg(short, long)]
    output: PathBuf,

    /// Index kind
    #[arg(long, value_enum, default_value_t = Mode::Db)]
    mode: Mode,

    /// Taxonomy as `child<TAB>parent` lines (db mode)
    #[arg(long, required_if_eq("mode", "db"))]
    taxonomy: Option<PathBuf>,

    /// Alphabet: dna4|dna5|base11
    #[arg(long, default_value = "base11")]
    alphabet: String,

    /// Spaced seed as a 0/1 string
    #[arg(long, default_value = "111101101100111")]
    mask: String,

    /// Filter: none|complexity>T|probability<T|minimizer(W)|maximizer(W)|probability-minimizer(W)
    #[arg(long, default_value = "complexity>3")]
    filter: String,

    /// Bits for taxon/read ids
    #[arg(long, default_value_t = 22)]
    id_bits: u32,

    /// Shard address bits (2^B shard files)
    #[arg(short = 'B', long, default_value_t = 10)]
    bucket_bits: u32,

    /// Worker threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Shards per cycle (default: derived from --memory-mb)
    #[arg(long)]
    buckets_per_cycle: Option<usize>,

    /// Memory budget for shard buffers in MiB
    #[arg(long, default_value_t = 1024)]
    memory_mb: u64,

    /// Compression: none|dv (delta+varint)
    #[arg(long, default_value = "none")]
    compression: String,

    /// Cache the input in memory after the first pass instead of re-reading it each cycle
    #[arg(long, default_value_t = false)]
    keep_in_memory: bool,

    /// Read mode with base11: index the read residues as given instead of
    /// translating nucleotides in six frames
    #[arg(long, default_value_t = false)]
    no_translate: bool,
}

/// Configure logger to write to stderr and `skx-build.log` in `out_dir`.
fn setup_logger(out_dir: &Path) -> Result<()> {
    let level = LevelFilter::Info;
    let pattern = "[{d(%Y-%m-%d %H:%M:%S)}] {h({l})}: {m}{n}";

    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .target(Target::Stderr)
        .build();

    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(out_dir.join("skx-build.log"))?;

    let config = Config::builder()
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("stderr", Box::new(stderr)),
        )
        .appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level)))
                .build("logfile", Box::new(logfile)),
        )
        .build(
            Root::builder()
                .appender("stderr")
                .appender("logfile")
                .build(LevelFilter::Trace),
        )?;

    log4rs::init_config(config)?;
    Ok(())
}

/// FASTA/FASTQ records translated to alphabet digits. Reset reopens the file.
///
/// With `translate`, every record becomes one source record per stop-free
/// frame segment, all carrying the id and header of the read.
struct FastxSource {
    path: PathBuf,
    alphabet: Alphabet,
    mode: Mode,
    translate: bool,
    reader: Box<dyn FastxReader>,
    next_id: u32,
    pending: VecDeque<Vec<u8>>,
    current: (u32, Arc<str>),
    reads: usize,
    records: usize,
}

impl FastxSource {
    /// Opens `path` twice: once to count records, once to start reading.
    fn open(path: &Path, alphabet: Alphabet, mode: Mode, translate: bool) -> Result<Self> {
        let mut counter = open_fastx(path)?;
        let (mut reads, mut records) = (0usize, 0usize);
        while let Some(rec) = counter.next() {
            let rec = rec.with_context(|| format!("Failed to parse {}", path.display()))?;
            reads += 1;
            records += if translate {
                translate_six_frames(&rec.seq()).len()
            } else {
                1
            };
        }
        Ok(FastxSource {
            path: path.to_path_buf(),
            alphabet,
            mode,
            translate,
            reader: open_fastx(path)?,
            next_id: 0,
            pending: VecDeque::new(),
            current: (0, Arc::from("")),
            reads,
            records,
        })
    }
}

fn open_fastx(path: &Path) -> Result<Box<dyn FastxReader>> {
    parse_fastx_file(path).with_context(|| format!("Failed to open {}", path.display()))
}

impl SequenceSource for FastxSource {
    fn next_record(&mut self) -> Result<Option<SequenceRecord>, IndexError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                let (id, header) = &self.current;
                return Ok(Some(SequenceRecord::new(*id, Arc::clone(header), frame)));
            }
            let rec = match self.reader.next() {
                None => return Ok(None),
                Some(rec) => rec.map_err(|e| IndexError::Source(e.to_string()))?,
            };
            let header = String::from_utf8_lossy(rec.id()).into_owned();
            let id = match self.mode {
                Mode::Reads => self.next_id,
                Mode::Db => header
                    .split_whitespace()
                    .next()
                    .and_then(|tok| tok.parse().ok())
                    .ok_or_else(|| {
                        IndexError::Source(format!(
                            "header `{header}` does not start with a taxon id"
                        ))
                    })?,
            };
            self.next_id += 1;
            if !self.translate {
                let symbols = self.alphabet.encode(&rec.seq())?;
                return Ok(Some(SequenceRecord::new(id, header, symbols)));
            }
            self.pending.extend(translate_six_frames(&rec.seq()));
            self.current = (id, header.into());
        }
    }

    fn reset(&mut self) -> Result<(), IndexError> {
        self.reader = parse_fastx_file(&self.path).map_err(|e| IndexError::Source(e.to_string()))?;
        self.next_id = 0;
        self.pending.clear();
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.records)
    }
}

/// Taxonomy given as a parent table. Roots are their own parent.
struct ParentTaxonomy {
    parents: HashMap<u32, u32>,
}

impl ParentTaxonomy {
    fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut parents = HashMap::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(child), Some(parent)) = (fields.next(), fields.next()) else {
                bail!("{}:{}: expected `child<TAB>parent`", path.display(), n + 1);
            };
            let child: u32 = child.trim().parse().with_context(|| {
                format!("{}:{}: invalid taxon id `{child}`", path.display(), n + 1)
            })?;
            let parent: u32 = parent.trim().parse().with_context(|| {
                format!("{}:{}: invalid taxon id `{parent}`", path.display(), n + 1)
            })?;
            parents.insert(child, parent);
        }
        // parents that never appear as children are roots
        let roots: Vec<u32> = parents
            .values()
            .copied()
            .filter(|p| !parents.contains_key(p))
            .collect();
        for r in roots {
            parents.insert(r, r);
        }
        Ok(ParentTaxonomy { parents })
    }

    /// `tax` followed by its ancestors up to the root.
    fn lineage(&self, tax: u32) -> impl Iterator<Item = u32> + '_ {
        let mut next = Some(tax);
        let mut steps = 0usize;
        std::iter::from_fn(move || {
            let cur = next?;
            steps += 1;
            next = match self.parents.get(&cur) {
                Some(&p) if p != cur && steps <= self.parents.len() => Some(p),
                _ => None,
            };
            Some(cur)
        })
    }

    /// Write `tree.txt`: `child<TAB>parent<TAB>kmers` per taxon.
    fn write_tree(&self, path: &Path, kmers: &BTreeMap<u32, u64>) -> Result<()> {
        let mut w = BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        );
        let mut nodes: Vec<_> = self.parents.iter().collect();
        nodes.sort_unstable();
        for (child, parent) in nodes {
            writeln!(w, "{child}\t{parent}\t{}", kmers.get(child).copied().unwrap_or(0))?;
        }
        w.flush()?;
        Ok(())
    }
}

impl Taxonomy for ParentTaxonomy {
    fn contains(&self, tax_id: u32) -> bool {
        self.parents.contains_key(&tax_id)
    }

    fn lca(&self, a: u32, b: u32) -> u32 {
        let ancestors: HashSet<u32> = self.lineage(a).collect();
        let mut last = b;
        for t in self.lineage(b) {
            if ancestors.contains(&t) {
                return t;
            }
            last = t;
        }
        // disconnected trees: fall back to b's root
        last
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    setup_logger(&args.output)?;
    info!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("{}", env::args().collect::<Vec<String>>().join(" "));

    let alphabet: Alphabet = args.alphabet.parse()?;
    let mask: Mask = args.mask.parse()?;
    let mode: ExtractionMode = args.filter.parse()?;
    let compression: Compression = args.compression.parse()?;

    let translate = args.mode == Mode::Reads && alphabet == Alphabet::Base11 && !args.no_translate;
    let mut source: Box<dyn SequenceSource> = {
        let fastx = FastxSource::open(&args.input, alphabet, args.mode, translate)?;
        info!("Input {} holds {} records", args.input.display(), fastx.reads);
        if translate {
            info!("Six-frame translation yields {} frame segments", fastx.records);
        }
        if args.keep_in_memory {
            Box::new(CachingSource::new(fastx))
        } else {
            Box::new(fastx)
        }
    };

    let mut encoder = EncoderConfig::new(alphabet.base(), mask)?;
    if mode.needs_frequencies() {
        let freqs = estimate_digit_frequencies(&mut source, alphabet.base(), 10_000)?;
        info!("Digit frequencies: {freqs:.4?}");
        encoder = encoder.with_frequencies(freqs)?;
    }
    let layout = BitLayout::new(&encoder, args.bucket_bits, args.id_bits)?;
    let extractor = KmerExtractor::new(&encoder, mode)?;
    info!(
        "Alphabet {} (base {}), mask {} (k={}, w={}), filter {}",
        alphabet.name(),
        alphabet.base(),
        encoder.mask(),
        encoder.mask().k(),
        encoder.mask().weight(),
        mode
    );

    let mut cfg = BuildConfig::default()
        .with_memory_budget(args.memory_mb << 20)
        .with_compression(compression);
    if let Some(n) = args.threads {
        cfg = cfg.with_threads(n);
    }
    if let Some(n) = args.buckets_per_cycle {
        cfg = cfg.with_buckets_per_cycle(n);
    }

    let taxonomy = match (args.mode, &args.taxonomy) {
        (Mode::Db, Some(path)) => Some(ParentTaxonomy::load(path)?),
        (Mode::Db, None) => bail!("--taxonomy is required in db mode"),
        (Mode::Reads, _) => None,
    };
    let kind = match &taxonomy {
        Some(t) => IndexKind::Database(t),
        None => IndexKind::Reads,
    };

    let report = build_index(&mut source, &extractor, &layout, kind, &args.output, &cfg)?;

    if let Some(t) = &taxonomy {
        let tree = args.output.join("tree.txt");
        t.write_tree(&tree, &report.kmers_per_taxon)?;
        info!("Wrote {}", tree.display());
    }
    info!(
        "Built index: {} records ({} skipped), {} entries, {} cycles of {} shards, {:.1?}",
        report.records_processed,
        report.records_skipped,
        report.total_entries(),
        report.cycles,
        report.buckets_per_cycle,
        report.elapsed
    );

    Ok(())
}
