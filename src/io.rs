//! Shard files and the index directory.
//!
//! Shard `{i}.bin`: `i32` entry count followed by the entries. All integers
//! are big-endian. With [`Compression::None`] every entry is a `u64`; with
//! [`Compression::DeltaVarint`] entries must be written in ascending order and
//! each is stored as the LEB128 varint of its difference to the previous one.
//!
//! The writer puts a placeholder count up front and patches it in
//! [`BucketWriter::finish`]. The reader checks the count against the file
//! length before reading, and rejects bytes left over after the last entry.
//!
//! The compression of a directory is recorded in `format.txt` so an index is
//! always read back the way it was written.

use byteorder::{BigEndian as BE, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::index::IndexError;

pub const TREE_FILE: &str = "tree.txt";
pub const HEADER_INDEX_FILE: &str = "header_index.txt";
pub const FORMAT_FILE: &str = "format.txt";

const HEADER_BYTES: u64 = 4;
const MAX_VARINT_BYTES: u64 = 10;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// Raw `u64` entries (8 bytes each).
    #[default]
    None = 0,
    /// Ascending entries as delta + varint (LEB128).
    DeltaVarint = 1,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::DeltaVarint => "delta-varint",
        }
    }

    /// Smallest and largest file body, in bytes, that `count` entries can take.
    fn body_bounds(self, count: u64) -> (u64, u64) {
        match self {
            Compression::None => (count * 8, count * 8),
            Compression::DeltaVarint => (count, count * MAX_VARINT_BYTES),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Compression {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "dv" | "delta" | "varint" | "delta-varint" => Ok(Compression::DeltaVarint),
            other => Err(IndexError::Config(format!("unknown compression `{other}`"))),
        }
    }
}

// ---------------- Varint (LEB128) utils ----------------

#[inline]
pub(crate) fn write_varu64<W: Write>(mut x: u64, w: &mut W) -> io::Result<usize> {
    let mut n = 0usize;
    while x >= 0x80 {
        w.write_u8((x as u8) | 0x80)?;
        x >>= 7;
        n += 1;
    }
    w.write_u8(x as u8)?;
    Ok(n + 1)
}

#[inline]
pub(crate) fn read_varu64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut x: u64 = 0;
    let mut s = 0u32;
    loop {
        let b = r.read_u8()?;
        if s >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint longer than 64 bits",
            ));
        }
        x |= ((b & 0x7F) as u64) << s;
        if (b & 0x80) == 0 {
            break;
        }
        s += 7;
    }
    Ok(x)
}

/// Streaming writer for one shard file.
pub struct BucketWriter {
    out: BufWriter<File>,
    compression: Compression,
    count: u64,
    prev: u64,
}

impl BucketWriter {
    pub fn create(path: &Path, compression: Compression) -> Result<Self, IndexError> {
        let file = File::create(path)?;
        let mut out = BufWriter::with_capacity(1 << 16, file);
        out.write_i32::<BE>(0)?;
        Ok(BucketWriter {
            out,
            compression,
            count: 0,
            prev: 0,
        })
    }

    #[inline]
    pub fn write(&mut self, entry: u64) -> Result<(), IndexError> {
        match self.compression {
            Compression::None => self.out.write_u64::<BE>(entry)?,
            Compression::DeltaVarint => {
                if self.count > 0 && entry < self.prev {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("delta encoding needs ascending entries ({entry} after {})", self.prev),
                    )
                    .into());
                }
                write_varu64(entry - if self.count > 0 { self.prev } else { 0 }, &mut self.out)?;
                self.prev = entry;
            }
        }
        self.count += 1;
        Ok(())
    }

    pub fn write_all(&mut self, entries: &[u64]) -> Result<(), IndexError> {
        entries.iter().try_for_each(|&e| self.write(e))
    }

    /// Flush, patch the count field and close. Returns the entry count.
    pub fn finish(self) -> Result<u64, IndexError> {
        let count = i32::try_from(self.count).map_err(|_| {
            IndexError::Config(format!(
                "{} entries exceed the shard file limit; use more bucket bits",
                self.count
            ))
        })?;
        let mut file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_i32::<BE>(count)?;
        file.sync_all()?;
        Ok(self.count)
    }
}

/// Sequential reader for one shard file.
pub struct BucketReader {
    shard: usize,
    input: BufReader<File>,
    compression: Compression,
    count: u64,
    read: u64,
    prev: u64,
}

impl BucketReader {
    pub fn open(path: &Path, shard: usize, compression: Compression) -> Result<Self, IndexError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(IndexError::MissingShard {
                    shard,
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut input = BufReader::with_capacity(1 << 16, file);
        let count = input.read_i32::<BE>().map_err(|e| corrupt(shard, e))?;
        if count < 0 {
            return Err(IndexError::CorruptShard {
                shard,
                reason: format!("negative entry count {count}"),
            });
        }
        let body = file_len.saturating_sub(HEADER_BYTES);
        let (min, max) = compression.body_bounds(count as u64);
        if body < min || body > max {
            return Err(IndexError::CorruptShard {
                shard,
                reason: format!(
                    "header claims {count} {compression} entries but {body} bytes follow"
                ),
            });
        }
        Ok(BucketReader {
            shard,
            input,
            compression,
            count: count as u64,
            read: 0,
            prev: 0,
        })
    }

    /// Entry count from the header.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn has_next(&self) -> bool {
        self.read < self.count
    }

    /// Next entry; reading past the count is an error.
    pub fn next_entry(&mut self) -> Result<u64, IndexError> {
        if !self.has_next() {
            return Err(IndexError::ShardExhausted {
                shard: self.shard,
                count: self.count,
            });
        }
        let entry = match self.compression {
            Compression::None => self.input.read_u64::<BE>(),
            Compression::DeltaVarint => read_varu64(&mut self.input).map(|d| self.prev.wrapping_add(d)),
        }
        .map_err(|e| {
            corrupt(
                self.shard,
                io::Error::new(
                    e.kind(),
                    format!("entry {} of {}: {e}", self.read, self.count),
                ),
            )
        })?;
        self.prev = entry;
        self.read += 1;
        if !self.has_next() && !self.input.fill_buf()?.is_empty() {
            return Err(IndexError::CorruptShard {
                shard: self.shard,
                reason: format!("trailing bytes after {} entries", self.count),
            });
        }
        Ok(entry)
    }

    /// Read all remaining entries.
    pub fn read_to_vec(&mut self) -> Result<Vec<u64>, IndexError> {
        let mut out = Vec::with_capacity((self.count - self.read) as usize);
        while self.has_next() {
            out.push(self.next_entry()?);
        }
        Ok(out)
    }
}

fn corrupt(shard: usize, e: io::Error) -> IndexError {
    if e.kind() == io::ErrorKind::UnexpectedEof || e.kind() == io::ErrorKind::InvalidData {
        IndexError::CorruptShard {
            shard,
            reason: e.to_string(),
        }
    } else {
        IndexError::Io(e)
    }
}

impl Iterator for BucketReader {
    type Item = Result<u64, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.has_next() {
            Some(self.next_entry())
        } else {
            None
        }
    }
}

/// An index directory: `{0..num_buckets}.bin` plus optional sidecars.
#[derive(Clone, Debug)]
pub struct IndexDir {
    root: PathBuf,
    num_buckets: usize,
    compression: Compression,
}

impl IndexDir {
    pub fn new(root: impl Into<PathBuf>, num_buckets: usize, compression: Compression) -> Self {
        IndexDir {
            root: root.into(),
            num_buckets,
            compression,
        }
    }

    /// Open an existing directory with the compression recorded in `format.txt`.
    pub fn open(root: impl Into<PathBuf>, num_buckets: usize) -> Result<Self, IndexError> {
        let root = root.into();
        let path = root.join(FORMAT_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(IndexError::Config(format!(
                    "{} is not an index directory: {FORMAT_FILE} is missing",
                    root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let compression = text
            .lines()
            .find_map(|l| l.trim().strip_prefix("compression="))
            .ok_or_else(|| {
                IndexError::Config(format!("{}: no compression entry", path.display()))
            })?
            .parse()?;
        Ok(IndexDir::new(root, num_buckets, compression))
    }

    /// Create the directory (and parents) if missing and record its format.
    pub fn create(&self) -> Result<(), IndexError> {
        fs::create_dir_all(&self.root)?;
        fs::write(
            self.root.join(FORMAT_FILE),
            format!("compression={}\n", self.compression),
        )?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn bucket_path(&self, shard: usize) -> PathBuf {
        self.root.join(format!("{shard}.bin"))
    }

    pub fn exists(&self, shard: usize) -> bool {
        self.bucket_path(shard).is_file()
    }

    /// Shards without a file; empty for a complete index.
    pub fn missing_buckets(&self) -> Vec<usize> {
        (0..self.num_buckets).filter(|&i| !self.exists(i)).collect()
    }

    pub fn writer(&self, shard: usize) -> Result<BucketWriter, IndexError> {
        BucketWriter::create(&self.bucket_path(shard), self.compression)
    }

    pub fn reader(&self, shard: usize) -> Result<BucketReader, IndexError> {
        if shard >= self.num_buckets {
            return Err(IndexError::MissingShard {
                shard,
                path: self.bucket_path(shard),
            });
        }
        BucketReader::open(&self.bucket_path(shard), shard, self.compression)
    }

    /// Taxonomy sidecar of a database index.
    pub fn tree_path(&self) -> PathBuf {
        self.root.join(TREE_FILE)
    }

    pub fn header_index_path(&self) -> PathBuf {
        self.root.join(HEADER_INDEX_FILE)
    }

    /// Write `header_index.txt`: the record count, then `id<TAB>header` per line.
    pub fn write_read_headers<'a, I>(&self, count: usize, headers: I) -> Result<(), IndexError>
    where
        I: IntoIterator<Item = (u32, &'a str)>,
    {
        let mut w = BufWriter::new(File::create(self.header_index_path())?);
        writeln!(w, "{count}")?;
        for (id, header) in headers {
            writeln!(w, "{id}\t{header}")?;
        }
        w.flush()?;
        Ok(())
    }

    /// Parse `header_index.txt` into `(id, header)` pairs.
    pub fn read_read_headers(&self) -> Result<Vec<(u32, String)>, IndexError> {
        let path = self.header_index_path();
        let bad = |what: String| {
            IndexError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {what}", path.display()),
            ))
        };
        let mut lines = BufReader::new(File::open(&path)?).lines();
        let count: usize = match lines.next() {
            Some(line) => line?
                .trim()
                .parse()
                .map_err(|_| bad("first line must be the record count".into()))?,
            None => return Err(bad("empty file".into())),
        };
        let mut out = Vec::with_capacity(count);
        for line in lines {
            let line = line?;
            let (id, header) = line
                .split_once('\t')
                .ok_or_else(|| bad(format!("missing tab in `{line}`")))?;
            let id = id
                .parse()
                .map_err(|_| bad(format!("invalid id `{id}`")))?;
            out.push((id, header.to_string()));
        }
        if out.len() != count {
            return Err(bad(format!("expected {count} headers, found {}", out.len())));
        }
        Ok(out)
    }
}
