//! Concurrently appendable shard buffers.
//!
//! A [`FlexibleBucket`] is a chain of fixed-size chunks of atomic slots.
//! Writers never lock per entry: they [`reserve`](FlexibleBucket::reserve) a
//! whole contingent of slots with one compare-and-swap and fill it without
//! synchronisation. Only growing the chain takes a lock.
//! Both chunk sizes are multiples of the contingent size, so a contingent always
//! lies inside a single chunk.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

pub const DEFAULT_CONTINGENT_SIZE: usize = 4096;
pub const DEFAULT_CHUNK_SIZE: usize = 131_072;

/// One chunk of slots and the link to its successor, set once when the
/// bucket grows.
struct Chunk {
    slots: Box<[AtomicU64]>,
    next: OnceLock<Arc<Chunk>>,
}

impl Chunk {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Chunk {
            slots: (0..len).map(|_| AtomicU64::new(0)).collect(),
            next: OnceLock::new(),
        })
    }
}

#[inline]
fn round_up(n: usize, multiple: usize) -> usize {
    n.max(1).div_ceil(multiple) * multiple
}

/// Chunk index and offset of a global slot.
#[inline]
fn locate(slot: usize, initial_capacity: usize, chunk_size: usize) -> (usize, usize) {
    if slot < initial_capacity {
        (0, slot)
    } else {
        let rest = slot - initial_capacity;
        (1 + rest / chunk_size, rest % chunk_size)
    }
}

/// Growable, chunked buffer of `u64` entries shared by many writers.
pub struct FlexibleBucket {
    contingent_size: usize,
    initial_capacity: usize,
    chunk_size: usize,
    head: Arc<Chunk>,
    /// Every chunk in order; only touched while growing.
    chunks: Mutex<Vec<Arc<Chunk>>>,
    /// Slots backed by published chunks.
    capacity: AtomicUsize,
    /// High-water mark of reserved slots.
    reserved: AtomicUsize,
    /// Slots handed back unwritten by `release`.
    returned: AtomicUsize,
    holes: Mutex<Vec<Range<usize>>>,
}

impl FlexibleBucket {
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_sizes(initial_capacity, DEFAULT_CHUNK_SIZE, DEFAULT_CONTINGENT_SIZE)
    }

    /// `initial_capacity` and `chunk_size` are rounded up to whole contingents.
    pub fn with_sizes(initial_capacity: usize, chunk_size: usize, contingent_size: usize) -> Self {
        let contingent_size = contingent_size.max(1);
        let initial_capacity = round_up(initial_capacity, contingent_size);
        let chunk_size = round_up(chunk_size, contingent_size);
        let head = Chunk::new(initial_capacity);
        FlexibleBucket {
            contingent_size,
            initial_capacity,
            chunk_size,
            chunks: Mutex::new(vec![Arc::clone(&head)]),
            head,
            capacity: AtomicUsize::new(initial_capacity),
            reserved: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
            holes: Mutex::new(Vec::new()),
        }
    }

    pub fn contingent_size(&self) -> usize {
        self.contingent_size
    }

    /// Reserved slots, not counting unwritten tails given back by
    /// [`release`](Self::release). Equals the entry count once every
    /// contingent has been released.
    pub fn size(&self) -> usize {
        self.reserved() - self.returned.load(Ordering::Acquire)
    }

    /// All slots ever reserved, including released tails.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Allocated slots across all chunks.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Reserve the next `contingent_size` slots for exclusive use by the caller.
    pub fn reserve(&self) -> Contingent {
        let step = self.contingent_size;
        let mut start = self.reserved.load(Ordering::Acquire);
        loop {
            let end = start + step;
            if end > self.capacity.load(Ordering::Acquire) {
                self.grow(end);
                start = self.reserved.load(Ordering::Acquire);
                continue;
            }
            match self
                .reserved
                .compare_exchange_weak(start, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => start = current,
            }
        }
        let (idx, offset) = locate(start, self.initial_capacity, self.chunk_size);
        Contingent {
            chunk: self.chunk(idx),
            offset,
            start,
            end: start + step,
            cursor: 0,
        }
    }

    /// Append chunks until `needed` slots are backed.
    #[cold]
    fn grow(&self, needed: usize) {
        let mut chunks = self.chunks.lock();
        while self.capacity.load(Ordering::Acquire) < needed {
            let chunk = Chunk::new(self.chunk_size);
            if let Some(tail) = chunks.last() {
                // the tail's link is only ever set here, under the lock
                let _ = tail.next.set(Arc::clone(&chunk));
            }
            chunks.push(chunk);
            self.capacity.fetch_add(self.chunk_size, Ordering::Release);
        }
    }

    /// Chunk `idx`, following the published links from the head.
    fn chunk(&self, idx: usize) -> Arc<Chunk> {
        let mut node = &self.head;
        for _ in 0..idx {
            match node.next.get() {
                Some(next) => node = next,
                None => return Arc::clone(&self.chunks.lock()[idx]),
            }
        }
        Arc::clone(node)
    }

    /// Return a contingent. Slots past its highest written slot are skipped later.
    pub fn release(&self, contingent: Contingent) {
        let written = contingent.start + contingent.cursor;
        if written < contingent.end {
            self.holes.lock().push(written..contingent.end);
            self.returned
                .fetch_add(contingent.end - written, Ordering::AcqRel);
        }
    }

    /// Written entries in slot order, consuming the bucket.
    pub fn into_entries(self) -> Vec<u64> {
        let size = self.reserved.into_inner();
        let mut out = Vec::with_capacity(size - self.returned.into_inner());
        let mut holes = self.holes.into_inner();
        holes.sort_unstable_by_key(|h| h.start);
        let chunks = self.chunks.into_inner();
        let mut slot = 0;
        let mut next_hole = holes.into_iter().peekable();
        while slot < size {
            if let Some(h) = next_hole.peek() {
                if h.start == slot {
                    slot = h.end;
                    next_hole.next();
                    continue;
                }
            }
            let stop = next_hole.peek().map_or(size, |h| h.start);
            while slot < stop {
                let (idx, offset) = locate(slot, self.initial_capacity, self.chunk_size);
                out.push(chunks[idx].slots[offset].load(Ordering::Relaxed));
                slot += 1;
            }
        }
        out
    }
}

/// Exclusive range `[start, end)` of slots in one bucket.
pub struct Contingent {
    chunk: Arc<Chunk>,
    offset: usize,
    start: usize,
    end: usize,
    /// One past the highest written slot, relative to `start`.
    cursor: usize,
}

impl Contingent {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Write `value` to global slot `index`, which must lie in [`range`](Self::range).
    #[inline]
    pub fn set(&mut self, index: usize, value: u64) {
        assert!(
            (self.start..self.end).contains(&index),
            "slot {index} outside contingent {}..{}",
            self.start,
            self.end
        );
        let rel = index - self.start;
        self.chunk.slots[self.offset + rel].store(value, Ordering::Relaxed);
        self.cursor = self.cursor.max(rel + 1);
    }

    /// Write to the next free slot. Returns `false` when the contingent is full.
    #[inline]
    pub fn push(&mut self, value: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.chunk.slots[self.offset + self.cursor].store(value, Ordering::Relaxed);
        self.cursor += 1;
        true
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.start + self.cursor == self.end
    }
}

/// The buckets of one indexing cycle: shards `[first, first + len)`.
///
/// This is the only allocation service workers share; each worker appends
/// through its own [`ShardAppender`].
pub struct CycleBuckets {
    first: usize,
    buckets: Vec<FlexibleBucket>,
}

impl CycleBuckets {
    pub fn new(
        shards: Range<usize>,
        initial_capacity: usize,
        chunk_size: usize,
        contingent_size: usize,
    ) -> Self {
        let buckets = shards
            .clone()
            .map(|_| FlexibleBucket::with_sizes(initial_capacity, chunk_size, contingent_size))
            .collect();
        CycleBuckets {
            first: shards.start,
            buckets,
        }
    }

    pub fn shards(&self) -> Range<usize> {
        self.first..self.first + self.buckets.len()
    }

    #[inline]
    pub fn contains(&self, shard: usize) -> bool {
        shard >= self.first && shard - self.first < self.buckets.len()
    }

    pub fn bucket(&self, shard: usize) -> Option<&FlexibleBucket> {
        if self.contains(shard) {
            Some(&self.buckets[shard - self.first])
        } else {
            None
        }
    }

    pub fn appender(&self) -> ShardAppender<'_> {
        ShardAppender {
            cycle: self,
            open: (0..self.buckets.len()).map(|_| None).collect(),
        }
    }

    /// `(shard, bucket)` pairs, consuming the cycle.
    pub fn into_buckets(self) -> Vec<(usize, FlexibleBucket)> {
        let first = self.first;
        self.buckets
            .into_iter()
            .enumerate()
            .map(|(i, b)| (first + i, b))
            .collect()
    }
}

/// Per-worker view of a [`CycleBuckets`] holding one open contingent per shard.
///
/// Open contingents are released when the appender is dropped.
pub struct ShardAppender<'a> {
    cycle: &'a CycleBuckets,
    open: Vec<Option<Contingent>>,
}

impl ShardAppender<'_> {
    /// Append `entry` to `shard`. Returns `false` if the shard is not in this cycle.
    #[inline]
    pub fn push(&mut self, shard: usize, entry: u64) -> bool {
        let Some(bucket) = self.cycle.bucket(shard) else {
            return false;
        };
        let slot = &mut self.open[shard - self.cycle.first];
        if let Some(c) = slot {
            if c.push(entry) {
                return true;
            }
        }
        if let Some(full) = slot.take() {
            bucket.release(full);
        }
        let mut fresh = bucket.reserve();
        fresh.push(entry);
        *slot = Some(fresh);
        true
    }
}

impl Drop for ShardAppender<'_> {
    fn drop(&mut self) {
        for (i, slot) in self.open.iter_mut().enumerate() {
            if let Some(c) = slot.take() {
                self.cycle.buckets[i].release(c);
            }
        }
    }
}
