//! Errors and the read side of a built index.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::io::{BucketReader, Compression, IndexDir};
use crate::layout::BitLayout;

#[derive(Debug, Error)]
/// Errors returned by encoding, indexing and shard I/O.
pub enum IndexError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid mask, alphabet, layout or filter configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Shard file is not present.
    #[error("missing shard {shard} ({})", .path.display())]
    MissingShard { shard: usize, path: PathBuf },
    /// Shard file ends before its declared entry count.
    #[error("corrupt shard {shard}: {reason}")]
    CorruptShard { shard: usize, reason: String },
    /// Read past the declared entry count.
    #[error("shard {shard} exhausted after {count} entries")]
    ShardExhausted { shard: usize, count: u64 },
    /// Identifier does not fit in the id field.
    #[error("id {id} does not fit in {id_bits} id bits")]
    IdOutOfRange { id: u32, id_bits: u32 },
    /// Sampling predicts empty shards: the filter rejects (almost) everything.
    #[error(
        "estimated largest shard holds {max_estimate} entries after sampling {sampled} records; the filter is too aggressive for this input"
    )]
    DegenerateFilter { max_estimate: u64, sampled: usize },
    /// Byte with no digit in the alphabet.
    #[error("byte {byte:#04x} is not in alphabet {alphabet}")]
    InvalidSymbol { byte: u8, alphabet: &'static str },
    /// Failure reported by a sequence source.
    #[error("sequence source: {0}")]
    Source(String),
    /// The run was stopped after another worker failed.
    #[error("indexing aborted")]
    Aborted,
}

/// A complete index directory opened for reading.
///
/// All shard files must be present; entries are decoded with the layout the
/// index was built with.
#[derive(Clone, Debug)]
pub struct ShardedIndex {
    dir: IndexDir,
    layout: BitLayout,
}

impl ShardedIndex {
    /// Open a built index. The shard compression is read from the directory.
    pub fn open(root: impl Into<PathBuf>, layout: BitLayout) -> Result<Self, IndexError> {
        let dir = IndexDir::open(root, layout.num_buckets())?;
        if let Some(&shard) = dir.missing_buckets().first() {
            return Err(IndexError::MissingShard {
                shard,
                path: dir.bucket_path(shard),
            });
        }
        Ok(ShardedIndex { dir, layout })
    }

    pub fn layout(&self) -> &BitLayout {
        &self.layout
    }

    pub fn compression(&self) -> Compression {
        self.dir.compression()
    }

    pub fn dir(&self) -> &IndexDir {
        &self.dir
    }

    pub fn num_buckets(&self) -> usize {
        self.layout.num_buckets()
    }

    /// Raw entry reader for one shard.
    pub fn reader(&self, shard: usize) -> Result<BucketReader, IndexError> {
        self.dir.reader(shard)
    }

    /// Entries of one shard decoded to `(kmer, id)`.
    pub fn entries(
        &self,
        shard: usize,
    ) -> Result<impl Iterator<Item = Result<(u64, u32), IndexError>> + use<>, IndexError> {
        let layout = self.layout;
        let reader = self.reader(shard)?;
        Ok(reader.map(move |entry| {
            entry.map(|e| (layout.reconstruct_kmer(shard, e), layout.extract_id(e)))
        }))
    }

    /// Sum of shard entry counts (headers only).
    pub fn total_entries(&self) -> Result<u64, IndexError> {
        (0..self.num_buckets()).try_fold(0u64, |acc, shard| Ok(acc + self.reader(shard)?.len()))
    }

    /// `(id, header)` pairs of a read index.
    pub fn read_headers(&self) -> Result<Vec<(u32, String)>, IndexError> {
        self.dir.read_read_headers()
    }

    /// Taxonomy sidecar, if the index has one.
    pub fn tree_path(&self) -> Option<PathBuf> {
        let p = self.dir.tree_path();
        p.is_file().then_some(p)
    }

    pub fn root(&self) -> &Path {
        self.dir.root()
    }
}
