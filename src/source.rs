//! Resettable sequence sources feeding the pipeline.

use std::sync::Arc;

use crate::index::IndexError;

/// One input sequence, already translated to alphabet digits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceRecord {
    /// Taxon id (database index) or read id (read index).
    pub id: u32,
    pub header: Arc<str>,
    pub symbols: Arc<[u8]>,
}

impl SequenceRecord {
    pub fn new(id: u32, header: impl Into<Arc<str>>, symbols: impl Into<Arc<[u8]>>) -> Self {
        SequenceRecord {
            id,
            header: header.into(),
            symbols: symbols.into(),
        }
    }
}

/// A stream of records that can be replayed from the start.
pub trait SequenceSource: Send {
    /// Next record, or `None` at end of stream.
    fn next_record(&mut self) -> Result<Option<SequenceRecord>, IndexError>;

    /// Rewind to the first record.
    fn reset(&mut self) -> Result<(), IndexError>;

    /// Total number of records, if known without reading.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

impl<S: SequenceSource + ?Sized> SequenceSource for Box<S> {
    fn next_record(&mut self) -> Result<Option<SequenceRecord>, IndexError> {
        (**self).next_record()
    }

    fn reset(&mut self) -> Result<(), IndexError> {
        (**self).reset()
    }

    fn len_hint(&self) -> Option<usize> {
        (**self).len_hint()
    }
}

/// Records held in memory; replay is free.
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    records: Vec<SequenceRecord>,
    pos: usize,
}

impl InMemorySource {
    pub fn new(records: Vec<SequenceRecord>) -> Self {
        InMemorySource { records, pos: 0 }
    }

    pub fn records(&self) -> &[SequenceRecord] {
        &self.records
    }
}

impl FromIterator<SequenceRecord> for InMemorySource {
    fn from_iter<T: IntoIterator<Item = SequenceRecord>>(iter: T) -> Self {
        InMemorySource::new(iter.into_iter().collect())
    }
}

impl SequenceSource for InMemorySource {
    fn next_record(&mut self) -> Result<Option<SequenceRecord>, IndexError> {
        let rec = self.records.get(self.pos).cloned();
        if rec.is_some() {
            self.pos += 1;
        }
        Ok(rec)
    }

    fn reset(&mut self) -> Result<(), IndexError> {
        self.pos = 0;
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.records.len())
    }
}

/// Wraps a source and keeps every record of the first complete pass, so later
/// passes are served from memory instead of re-reading the inner source.
///
/// A reset before the first pass completes discards the partial cache and
/// resets the inner source.
pub struct CachingSource<S> {
    inner: S,
    cache: Vec<SequenceRecord>,
    complete: bool,
    pos: usize,
}

impl<S: SequenceSource> CachingSource<S> {
    pub fn new(inner: S) -> Self {
        CachingSource {
            inner,
            cache: Vec::new(),
            complete: false,
            pos: 0,
        }
    }

    /// True once a full pass has been cached.
    pub fn is_cached(&self) -> bool {
        self.complete
    }
}

impl<S: SequenceSource> SequenceSource for CachingSource<S> {
    fn next_record(&mut self) -> Result<Option<SequenceRecord>, IndexError> {
        if self.complete {
            let rec = self.cache.get(self.pos).cloned();
            if rec.is_some() {
                self.pos += 1;
            }
            return Ok(rec);
        }
        match self.inner.next_record()? {
            Some(rec) => {
                self.cache.push(rec.clone());
                Ok(Some(rec))
            }
            None => {
                self.complete = true;
                self.pos = self.cache.len();
                Ok(None)
            }
        }
    }

    fn reset(&mut self) -> Result<(), IndexError> {
        if self.complete {
            self.pos = 0;
            return Ok(());
        }
        self.cache.clear();
        self.inner.reset()
    }

    fn len_hint(&self) -> Option<usize> {
        if self.complete {
            Some(self.cache.len())
        } else {
            self.inner.len_hint()
        }
    }
}
