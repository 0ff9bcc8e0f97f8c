//! Memory-bounded, multi-cycle index construction.
//!
//! The shards are processed in cycles of `buckets_per_cycle` consecutive
//! shard ids. Each cycle scans the whole source with a rayon pool: workers
//! pull record batches from the shared source, extract k-mers with their own
//! extractor and append the entries whose shard belongs to the cycle. After
//! the barrier every shard of the cycle is sorted, (database mode) collapsed
//! to one entry per k-mer, and written to its file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::bucket::{CycleBuckets, DEFAULT_CHUNK_SIZE, DEFAULT_CONTINGENT_SIZE, FlexibleBucket};
use crate::estimate::{DEFAULT_SAMPLE_SIZE, estimate_bucket_sizes};
use crate::extract::KmerExtractor;
use crate::index::IndexError;
use crate::io::{Compression, IndexDir};
use crate::layout::BitLayout;
use crate::radix::radix_sort_u64;
use crate::source::{SequenceRecord, SequenceSource};

pub const DEFAULT_MEMORY_BUDGET: u64 = 1 << 30;
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Build-time configuration.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    threads: Option<usize>,
    buckets_per_cycle: Option<usize>,
    memory_budget: u64,
    contingent_size: usize,
    chunk_size: usize,
    batch_size: usize,
    sample_size: usize,
    compression: Compression,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            threads: None,
            buckets_per_cycle: None,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            contingent_size: DEFAULT_CONTINGENT_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            compression: Compression::None,
        }
    }
}

impl BuildConfig {
    /// Worker threads (default: rayon's default).
    pub fn with_threads(mut self, n: usize) -> Self {
        self.threads = Some(n.max(1));
        self
    }
    /// Fix the shards per cycle instead of deriving it from the memory budget.
    pub fn with_buckets_per_cycle(mut self, n: usize) -> Self {
        self.buckets_per_cycle = Some(n.max(1));
        self
    }
    /// Bytes available for in-flight shard buffers (default 1 GiB).
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }
    /// Slots reserved per contingent (default 4096).
    pub fn with_contingent_size(mut self, n: usize) -> Self {
        self.contingent_size = n.max(1);
        self
    }
    /// Slots per growth chunk (default 131072).
    pub fn with_chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n.max(1);
        self
    }
    /// Records a worker takes from the source at once (default 1000).
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }
    /// Records sampled for the shard size estimate (default 10000).
    pub fn with_sample_size(mut self, n: usize) -> Self {
        self.sample_size = n;
        self
    }
    pub fn with_compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    pub fn threads(&self) -> Option<usize> {
        self.threads
    }
    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }
    pub fn compression(&self) -> Compression {
        self.compression
    }
}

/// Taxonomy lookups needed by database indexing.
pub trait Taxonomy: Sync {
    fn contains(&self, tax_id: u32) -> bool;
    /// Lowest common ancestor of two known taxa.
    fn lca(&self, a: u32, b: u32) -> u32;
}

/// What record ids mean and how shared k-mers are stored.
#[derive(Copy, Clone)]
pub enum IndexKind<'t> {
    /// Ids are taxa; equal k-mers collapse to the LCA of their taxa.
    Database(&'t dyn Taxonomy),
    /// Ids are reads; every occurrence is kept and headers are recorded.
    Reads,
}

impl IndexKind<'_> {
    fn name(&self) -> &'static str {
        match self {
            IndexKind::Database(_) => "database",
            IndexKind::Reads => "reads",
        }
    }
}

/// Statistics of a finished run.
#[derive(Clone, Debug, Default)]
pub struct BuildReport {
    pub entries_per_shard: Vec<u64>,
    /// Records indexed in one pass over the source.
    pub records_processed: u64,
    /// Records dropped because their taxon is unknown.
    pub records_skipped: u64,
    pub cycles: usize,
    pub buckets_per_cycle: usize,
    /// Largest estimated shard size from sampling.
    pub max_estimate: u64,
    /// Entries per taxon after LCA collapse (database mode only).
    pub kmers_per_taxon: BTreeMap<u32, u64>,
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn total_entries(&self) -> u64 {
        self.entries_per_shard.iter().sum()
    }
}

/// State shared by the workers of one cycle.
struct CycleContext<'a, S: ?Sized> {
    source: Mutex<&'a mut S>,
    buckets: CycleBuckets,
    extractor: &'a KmerExtractor,
    layout: BitLayout,
    kind: IndexKind<'a>,
    batch_size: usize,
    headers: Option<Mutex<Vec<(u32, Arc<str>)>>>,
    processed: AtomicU64,
    skipped: AtomicU64,
    abort: AtomicBool,
    failure: Mutex<Option<IndexError>>,
}

impl<S: SequenceSource + ?Sized> CycleContext<'_, S> {
    fn fail(&self, err: IndexError) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    fn next_batch(&self, batch: &mut Vec<SequenceRecord>) -> Result<(), IndexError> {
        batch.clear();
        let mut source = self.source.lock();
        while batch.len() < self.batch_size {
            match source.next_record()? {
                Some(rec) => batch.push(rec),
                None => break,
            }
        }
        Ok(())
    }

    fn run_worker(&self) {
        if let Err(e) = self.work() {
            self.fail(e);
        }
    }

    fn work(&self) -> Result<(), IndexError> {
        let mut extractor = self.extractor.clone();
        let mut appender = self.buckets.appender();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut kmers = Vec::new();
        let mut headers = Vec::new();
        let (mut processed, mut skipped) = (0u64, 0u64);

        while !self.abort.load(Ordering::Relaxed) {
            self.next_batch(&mut batch)?;
            if batch.is_empty() {
                break;
            }
            for rec in &batch {
                if let IndexKind::Database(tax) = self.kind {
                    if !tax.contains(rec.id) {
                        debug!("skipping `{}`: taxon {} not in taxonomy", rec.header, rec.id);
                        skipped += 1;
                        continue;
                    }
                }
                self.layout.check_id(rec.id)?;
                if self.headers.is_some() {
                    headers.push((rec.id, Arc::clone(&rec.header)));
                }
                kmers.clear();
                extractor.extract_into(&rec.symbols, &mut kmers);
                for &kmer in &kmers {
                    let shard = self.layout.shard_of(kmer);
                    if self.buckets.contains(shard) {
                        let entry = self
                            .layout
                            .build_index_entry(rec.id, self.layout.strip_shard(kmer))?;
                        appender.push(shard, entry);
                    }
                }
                processed += 1;
            }
        }

        self.processed.fetch_add(processed, Ordering::Relaxed);
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
        if let Some(all) = &self.headers {
            all.lock().append(&mut headers);
        }
        Ok(())
    }
}

struct FlushedShard {
    shard: usize,
    entries: u64,
    taxa: BTreeMap<u32, u64>,
}

/// Sort, collapse (database mode) and write one shard.
fn flush_shard(
    dir: &IndexDir,
    layout: &BitLayout,
    kind: IndexKind<'_>,
    shard: usize,
    bucket: FlexibleBucket,
) -> Result<FlushedShard, IndexError> {
    let mut entries = bucket.into_entries();
    radix_sort_u64(&mut entries);
    let mut taxa = BTreeMap::new();

    if let IndexKind::Database(tax) = kind {
        let raw = entries.len();
        let mut out = 0;
        let mut i = 0;
        while i < entries.len() {
            let kmer = layout.kmer_part(entries[i]);
            let mut lca = layout.extract_id(entries[i]);
            let mut j = i + 1;
            while j < entries.len() && layout.kmer_part(entries[j]) == kmer {
                let id = layout.extract_id(entries[j]);
                if id != lca {
                    lca = tax.lca(lca, id);
                }
                j += 1;
            }
            entries[out] = layout.build_index_entry(lca, kmer)?;
            *taxa.entry(lca).or_insert(0) += 1;
            out += 1;
            i = j;
        }
        entries.truncate(out);
        debug!("shard {shard}: collapsed {raw} entries to {out} k-mers");
    }

    let mut writer = dir.writer(shard)?;
    writer.write_all(&entries)?;
    let written = writer.finish()?;
    debug!("shard {shard}: wrote {written} entries");
    Ok(FlushedShard {
        shard,
        entries: written,
        taxa,
    })
}

/// Build a sharded index from `source` into the directory `out`.
///
/// The source is sampled first to size the shard buffers, then scanned once
/// per cycle. Every record id is checked against the layout during the first
/// cycle, before any shard is written. Any worker error aborts the run; shard
/// files already written are left in place but the index is incomplete.
pub fn build_index<S>(
    source: &mut S,
    extractor: &KmerExtractor,
    layout: &BitLayout,
    kind: IndexKind<'_>,
    out: &Path,
    cfg: &BuildConfig,
) -> Result<BuildReport, IndexError>
where
    S: SequenceSource + ?Sized,
{
    let started = Instant::now();
    let num_buckets = layout.num_buckets();
    let dir = IndexDir::new(out, num_buckets, cfg.compression);
    dir.create()?;

    let mut sampler = extractor.clone();
    let estimate = estimate_bucket_sizes(source, &mut sampler, layout, cfg.sample_size)?;
    let max_estimate = estimate.max();
    if max_estimate < 1 {
        return Err(IndexError::DegenerateFilter {
            max_estimate,
            sampled: estimate.sampled_records,
        });
    }

    let pool = match cfg.threads {
        Some(n) => rayon::ThreadPoolBuilder::new().num_threads(n).build(),
        None => rayon::ThreadPoolBuilder::new().build(),
    }
    .map_err(|e| IndexError::Config(format!("cannot start worker pool: {e}")))?;
    let threads = pool.current_num_threads();
    // every worker may hold one open contingent per shard
    let slack = cfg.contingent_size * threads;
    let initial_capacity = max_estimate as usize + slack;
    let bpc = cfg
        .buckets_per_cycle
        .unwrap_or_else(|| estimate.suggested_buckets_per_cycle(cfg.memory_budget, slack as u64))
        .clamp(1, num_buckets);
    if cfg.buckets_per_cycle.is_none() && bpc == 1 {
        let needed = initial_capacity as u64 * 8;
        if needed > cfg.memory_budget {
            warn!(
                "one shard needs {needed} bytes, over the memory budget of {} bytes",
                cfg.memory_budget
            );
        }
    }
    let cycles = num_buckets.div_ceil(bpc);

    info!(
        "Indexing {} into {} ({} shards, {} per cycle, {} cycles, {} threads)",
        kind.name(),
        out.display(),
        num_buckets,
        bpc,
        cycles,
        threads
    );
    info!(
        "Layout: {} payload bits, {} bucket bits, {} id bits; largest shard estimate {}",
        layout.payload_bits(),
        layout.bucket_bits(),
        layout.id_bits(),
        max_estimate
    );

    let mut report = BuildReport {
        entries_per_shard: vec![0; num_buckets],
        cycles,
        buckets_per_cycle: bpc,
        max_estimate,
        ..Default::default()
    };

    for (cycle, first) in (0..num_buckets).step_by(bpc).enumerate() {
        let cycle_started = Instant::now();
        let shards = first..(first + bpc).min(num_buckets);
        if cycle > 0 {
            source.reset()?;
        }
        info!(
            "Cycle {}/{}: shards {}..{}",
            cycle + 1,
            cycles,
            shards.start,
            shards.end
        );

        let collect_headers = cycle == 0 && matches!(kind, IndexKind::Reads);
        let ctx = CycleContext {
            source: Mutex::new(&mut *source),
            buckets: CycleBuckets::new(
                shards.clone(),
                initial_capacity,
                cfg.chunk_size,
                cfg.contingent_size,
            ),
            extractor,
            layout: *layout,
            kind,
            batch_size: cfg.batch_size,
            headers: collect_headers.then(|| Mutex::new(Vec::new())),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            abort: AtomicBool::new(false),
            failure: Mutex::new(None),
        };

        pool.scope(|s| {
            let ctx = &ctx;
            for _ in 0..threads {
                s.spawn(move |_| ctx.run_worker());
            }
        });

        let CycleContext {
            buckets,
            headers,
            processed,
            skipped,
            abort,
            failure,
            ..
        } = ctx;
        if abort.into_inner() {
            return Err(failure.into_inner().unwrap_or(IndexError::Aborted));
        }
        let (processed, skipped) = (processed.into_inner(), skipped.into_inner());
        if cycle == 0 {
            report.records_processed = processed;
            report.records_skipped = skipped;
            if skipped > 0 {
                warn!("{skipped} records skipped: taxon not in taxonomy");
            }
        }
        if let Some(headers) = headers {
            let mut headers = headers.into_inner();
            headers.sort_unstable_by_key(|(id, _)| *id);
            // translated reads yield several records with one id
            headers.dedup_by_key(|(id, _)| *id);
            dir.write_read_headers(headers.len(), headers.iter().map(|(id, h)| (*id, &**h)))?;
            info!("Wrote {} read headers", headers.len());
        }

        let flushed = pool.install(|| {
            buckets
                .into_buckets()
                .into_par_iter()
                .map(|(shard, bucket)| flush_shard(&dir, layout, kind, shard, bucket))
                .collect::<Result<Vec<_>, IndexError>>()
        })?;
        let mut cycle_entries = 0u64;
        for f in flushed {
            report.entries_per_shard[f.shard] = f.entries;
            cycle_entries += f.entries;
            for (taxon, n) in f.taxa {
                *report.kmers_per_taxon.entry(taxon).or_insert(0) += n;
            }
        }
        info!(
            "Cycle {}/{} done: {} records, {} entries in {:.1?}",
            cycle + 1,
            cycles,
            processed,
            cycle_entries,
            cycle_started.elapsed()
        );
    }

    report.elapsed = started.elapsed();
    info!(
        "Indexed {} records into {} entries in {:.1?}",
        report.records_processed,
        report.total_entries(),
        report.elapsed
    );
    Ok(report)
}
