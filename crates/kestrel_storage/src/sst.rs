//! Sorted string table file format.
//!
//! Layout:
//! ```text
//!   [DataBlock 0] [DataBlock 1] ... [DataBlock N]
//!   [RangeBlock]       - bincode range tombstones + range keys
//!   [IndexBlock]       - last_key_per_block → (block_offset, block_len)
//!   [BloomFilter]      - filter over user keys
//!   [Footer]           - fixed 64-byte trailer with CRC
//! ```
//!
//! Data block entries carry the engine sequence number and mutation kind:
//! ```text
//!   [key_len: u32] [seq: u64] [kind: u8] [val_len: u32] [key] [value]
//! ```
//! Entries are sorted `(encoded key asc, seq desc)`; the same key may appear
//! at multiple sequences.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use kestrel_common::error::StorageError;

use crate::block_cache::{BlockCache, BlockKey};
use crate::bloom::BloomFilter;
use crate::keys::EngineKey;
use crate::memtable::{PointKind, RangeKeyRecord, RangeTombstone};

const SST_MAGIC: &[u8; 4] = b"KSST";
const SST_FORMAT_VERSION: u32 = 2;
const TARGET_BLOCK_SIZE: usize = 4096;

/// Footer: magic(4) + version(4) + range_off(8) + range_len(8) +
/// index_off(8) + index_len(8) + bloom_off(8) + bloom_len(8) +
/// entry_count(4) + crc(4) = 64 bytes.
const FOOTER_SIZE: usize = 64;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// Where the bytes of a file live. Remote and external files are never
/// treated as fatal on corruption and are reported separately by
/// `approximate_disk_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileLocality {
    Local,
    Remote,
    External,
}

/// A point entry read from an sstable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstPointEntry {
    pub key: Vec<u8>,
    pub seq: u64,
    pub kind: PointKind,
    pub value: Vec<u8>,
}

/// The non-point payload of an sstable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SstRangeBlock {
    pub range_dels: Vec<RangeTombstone>,
    pub range_keys: Vec<RangeKeyRecord>,
}

/// In-memory metadata for one sstable file.
#[derive(Debug, Clone)]
pub struct SstMeta {
    pub file_id: u64,
    pub path: PathBuf,
    pub level: u32,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub entry_count: u32,
    pub file_size: u64,
    /// Highest sequence number contained in the file.
    pub max_seq: u64,
    pub locality: FileLocality,
}

impl SstMeta {
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }

    pub fn overlaps(&self, lower: &[u8], upper: &[u8]) -> bool {
        self.min_key.as_slice() < upper && lower <= self.max_key.as_slice()
    }
}

// ── Writer ──────────────────────────────────────────────────────────────────

/// Writes a new sstable. Keys must be added in `(key asc, seq desc)` order.
pub struct SstWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    bloom: BloomFilter,
    index: Vec<(Vec<u8>, u64, u32)>,
    block_buf: Vec<u8>,
    block_entry_count: u32,
    offset: u64,
    entry_count: u32,
    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    max_seq: u64,
    range_block: SstRangeBlock,
}

impl SstWriter {
    pub fn new(path: &Path, expected_entries: usize) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            path: path.to_path_buf(),
            bloom: BloomFilter::new(expected_entries.max(1), 0.01),
            index: Vec::new(),
            block_buf: Vec::with_capacity(TARGET_BLOCK_SIZE),
            block_entry_count: 0,
            offset: 0,
            entry_count: 0,
            first_key: None,
            last_key: None,
            max_seq: 0,
            range_block: SstRangeBlock::default(),
        })
    }

    pub fn add(&mut self, key: &[u8], seq: u64, kind: PointKind, value: &[u8]) -> io::Result<()> {
        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());
        self.max_seq = self.max_seq.max(seq);

        // The filter indexes user keys so point lookups and prefix-hinted
        // iterators can skip the file for any version of an absent key.
        if let Some(user_key) = EngineKey::decode_user_key(key) {
            self.bloom.insert(&user_key);
        } else {
            self.bloom.insert(key);
        }

        self.block_buf
            .extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.block_buf.extend_from_slice(&seq.to_le_bytes());
        self.block_buf.push(kind as u8);
        self.block_buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.block_buf.extend_from_slice(key);
        self.block_buf.extend_from_slice(value);
        self.block_entry_count += 1;
        self.entry_count += 1;

        if self.block_buf.len() >= TARGET_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn add_range_del(&mut self, del: RangeTombstone) {
        self.max_seq = self.max_seq.max(del.seq);
        if self.first_key.is_none() || del.start < *self.first_key.as_ref().unwrap() {
            self.first_key = Some(del.start.clone());
        }
        if self.last_key.is_none() || del.end > *self.last_key.as_ref().unwrap() {
            self.last_key = Some(del.end.clone());
        }
        self.range_block.range_dels.push(del);
    }

    pub fn add_range_key(&mut self, rk: RangeKeyRecord) {
        self.max_seq = self.max_seq.max(rk.seq);
        self.range_block.range_keys.push(rk);
    }

    pub fn finish(mut self, level: u32, locality: FileLocality) -> io::Result<SstMeta> {
        if !self.block_buf.is_empty() {
            self.flush_block()?;
        }

        let range_offset = self.offset;
        let range_data = bincode::serialize(&self.range_block)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(&range_data)?;
        self.offset += range_data.len() as u64;
        let range_len = range_data.len() as u64;

        let index_offset = self.offset;
        let index_data = self.encode_index();
        self.writer.write_all(&index_data)?;
        self.offset += index_data.len() as u64;
        let index_len = index_data.len() as u64;

        let bloom_offset = self.offset;
        let bloom_data = self.bloom.to_bytes();
        self.writer.write_all(&bloom_data)?;
        self.offset += bloom_data.len() as u64;
        let bloom_len = bloom_data.len() as u64;

        let mut footer = [0u8; FOOTER_SIZE];
        footer[0..4].copy_from_slice(SST_MAGIC);
        footer[4..8].copy_from_slice(&SST_FORMAT_VERSION.to_le_bytes());
        footer[8..16].copy_from_slice(&range_offset.to_le_bytes());
        footer[16..24].copy_from_slice(&range_len.to_le_bytes());
        footer[24..32].copy_from_slice(&index_offset.to_le_bytes());
        footer[32..40].copy_from_slice(&index_len.to_le_bytes());
        footer[40..48].copy_from_slice(&bloom_offset.to_le_bytes());
        footer[48..56].copy_from_slice(&bloom_len.to_le_bytes());
        footer[56..60].copy_from_slice(&self.entry_count.to_le_bytes());
        let crc = crc32fast::hash(&footer[0..60]);
        footer[60..64].copy_from_slice(&crc.to_le_bytes());
        self.writer.write_all(&footer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        Ok(SstMeta {
            file_id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            path: self.path,
            level,
            min_key: self.first_key.unwrap_or_default(),
            max_key: self.last_key.unwrap_or_default(),
            entry_count: self.entry_count,
            file_size: self.offset + FOOTER_SIZE as u64,
            max_seq: self.max_seq,
            locality,
        })
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let block_offset = self.offset;
        let header = self.block_entry_count.to_le_bytes();
        self.writer.write_all(&header)?;
        self.writer.write_all(&self.block_buf)?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&self.block_buf);
        self.writer.write_all(&crc.finalize().to_le_bytes())?;

        let block_len = 4 + self.block_buf.len() as u32 + 4;
        self.offset += block_len as u64;
        let last_key = self.last_key.clone().unwrap_or_default();
        self.index.push((last_key, block_offset, block_len));
        self.block_buf.clear();
        self.block_entry_count = 0;
        Ok(())
    }

    fn encode_index(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for (key, offset, len) in &self.index {
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
        }
        buf
    }
}

// ── Reader ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct IndexEntry {
    last_key: Vec<u8>,
    block_offset: u64,
    block_len: u32,
}

/// Reads an sstable: index and bloom filter are held in memory, data blocks
/// go through the block cache.
pub struct SstReader {
    path: PathBuf,
    file_id: u64,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
    range_block: SstRangeBlock,
    entry_count: u32,
}

fn corruption(path: &Path, detail: impl Into<String>) -> StorageError {
    StorageError::Corruption {
        path: path.display().to_string(),
        detail: detail.into(),
    }
}

impl std::fmt::Debug for SstReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstReader")
            .field("path", &self.path)
            .field("file_id", &self.file_id)
            .finish_non_exhaustive()
    }
}

impl SstReader {
    pub fn open(path: &Path, file_id: u64) -> Result<Self, StorageError> {
        let file_len = fs::metadata(path)?.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(corruption(
                path,
                format!("file too small for footer: {file_len} bytes"),
            ));
        }
        let mut file = BufReader::new(File::open(path)?);
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        if &footer[0..4] != SST_MAGIC {
            return Err(corruption(path, format!("bad magic {:?}", &footer[0..4])));
        }
        let stored_crc = u32::from_le_bytes(footer[60..64].try_into().unwrap());
        let computed_crc = crc32fast::hash(&footer[0..60]);
        if stored_crc != computed_crc {
            return Err(corruption(
                path,
                format!("footer checksum mismatch: stored {stored_crc:#010x} computed {computed_crc:#010x}"),
            ));
        }
        let version = u32::from_le_bytes(footer[4..8].try_into().unwrap());
        if version > SST_FORMAT_VERSION {
            return Err(corruption(
                path,
                format!("unsupported sstable format version {version}"),
            ));
        }

        let range_offset = u64::from_le_bytes(footer[8..16].try_into().unwrap());
        let range_len = u64::from_le_bytes(footer[16..24].try_into().unwrap());
        let index_offset = u64::from_le_bytes(footer[24..32].try_into().unwrap());
        let index_len = u64::from_le_bytes(footer[32..40].try_into().unwrap());
        let bloom_offset = u64::from_le_bytes(footer[40..48].try_into().unwrap());
        let bloom_len = u64::from_le_bytes(footer[48..56].try_into().unwrap());
        let entry_count = u32::from_le_bytes(footer[56..60].try_into().unwrap());

        let data_end = file_len - FOOTER_SIZE as u64;
        for (name, off, len) in [
            ("range", range_offset, range_len),
            ("index", index_offset, index_len),
            ("bloom", bloom_offset, bloom_len),
        ] {
            if off + len > data_end {
                return Err(corruption(
                    path,
                    format!("{name} block extends beyond file: off={off} len={len}"),
                ));
            }
        }

        file.seek(SeekFrom::Start(range_offset))?;
        let mut range_buf = vec![0u8; range_len as usize];
        file.read_exact(&mut range_buf)?;
        let range_block: SstRangeBlock = bincode::deserialize(&range_buf)
            .map_err(|e| corruption(path, format!("range block decode: {e}")))?;

        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact(&mut index_buf)?;
        let index = Self::parse_index(path, &index_buf)?;

        file.seek(SeekFrom::Start(bloom_offset))?;
        let mut bloom_buf = vec![0u8; bloom_len as usize];
        file.read_exact(&mut bloom_buf)?;
        let bloom = BloomFilter::from_bytes(&bloom_buf)
            .ok_or_else(|| corruption(path, "bloom filter decode"))?;

        Ok(Self {
            path: path.to_path_buf(),
            file_id,
            index,
            bloom,
            range_block,
            entry_count,
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn range_block(&self) -> &SstRangeBlock {
        &self.range_block
    }

    /// Whether the file possibly contains any version of `user_key`.
    pub fn may_contain_user_key(&self, user_key: &[u8]) -> bool {
        self.bloom.may_contain(user_key)
    }

    /// First and last encoded point keys, derived from the index.
    pub fn key_bounds(&self, cache: Option<&BlockCache>) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        let Some(first_block) = self.index.first() else {
            return Ok(None);
        };
        let entries = self.read_block_entries(first_block, cache)?;
        let Some(first) = entries.first() else {
            return Ok(None);
        };
        let last = self
            .index
            .last()
            .map(|e| e.last_key.clone())
            .unwrap_or_default();
        Ok(Some((first.key.clone(), last)))
    }

    /// Latest version of `key` at or below `max_seq`.
    pub fn get(
        &self,
        key: &[u8],
        max_seq: u64,
        cache: Option<&BlockCache>,
    ) -> Result<Option<SstPointEntry>, StorageError> {
        if let Some(user_key) = EngineKey::decode_user_key(key) {
            if !self.bloom.may_contain(&user_key) {
                return Ok(None);
            }
        }
        let block_idx = self.index.partition_point(|e| e.last_key.as_slice() < key);
        if block_idx >= self.index.len() {
            return Ok(None);
        }
        let entries = self.read_block_entries(&self.index[block_idx], cache)?;
        Ok(entries
            .into_iter()
            .find(|e| e.key == key && e.seq <= max_seq))
    }

    /// All entries in `[lower, upper)` (upper unbounded when `None`) with
    /// `seq <= max_seq`, in `(key asc, seq desc)` order.
    pub fn scan(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        max_seq: u64,
        cache: Option<&BlockCache>,
    ) -> Result<Vec<SstPointEntry>, StorageError> {
        let mut out = Vec::new();
        let start_block = self.index.partition_point(|e| e.last_key.as_slice() < lower);
        for entry in self.index.iter().skip(start_block) {
            let entries = self.read_block_entries(entry, cache)?;
            let mut done = false;
            for e in entries {
                if e.key.as_slice() < lower {
                    continue;
                }
                if let Some(u) = upper {
                    if e.key.as_slice() >= u {
                        done = true;
                        break;
                    }
                }
                if e.seq <= max_seq {
                    out.push(e);
                }
            }
            if done {
                break;
            }
        }
        Ok(out)
    }

    fn read_block_entries(
        &self,
        entry: &IndexEntry,
        cache: Option<&BlockCache>,
    ) -> Result<Vec<SstPointEntry>, StorageError> {
        let cache_key = BlockKey {
            file_id: self.file_id,
            offset: entry.block_offset,
        };
        let raw = if let Some(c) = cache {
            if let Some(hit) = c.get(&cache_key) {
                hit
            } else {
                let data = self.read_block_from_disk(entry)?;
                c.insert(cache_key, data.clone());
                data
            }
        } else {
            self.read_block_from_disk(entry)?
        };
        Self::decode_block(&self.path, &raw)
    }

    fn read_block_from_disk(&self, entry: &IndexEntry) -> Result<Vec<u8>, StorageError> {
        let mut file = BufReader::new(File::open(&self.path)?);
        file.seek(SeekFrom::Start(entry.block_offset))?;
        let mut buf = vec![0u8; entry.block_len as usize];
        file.read_exact(&mut buf)?;

        if buf.len() < 8 {
            return Err(corruption(&self.path, "block shorter than header + crc"));
        }
        let data_len = buf.len() - 4;
        let stored_crc = u32::from_le_bytes(buf[data_len..].try_into().unwrap());
        let computed_crc = crc32fast::hash(&buf[..data_len]);
        if stored_crc != computed_crc {
            return Err(corruption(
                &self.path,
                format!(
                    "block checksum mismatch at offset {}: stored {stored_crc:#010x} computed {computed_crc:#010x}",
                    entry.block_offset
                ),
            ));
        }
        buf.truncate(data_len);
        Ok(buf)
    }

    fn decode_block(path: &Path, data: &[u8]) -> Result<Vec<SstPointEntry>, StorageError> {
        if data.len() < 4 {
            return Err(corruption(path, "block too short for header"));
        }
        let count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let mut pos = 4;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            if pos + 17 > data.len() {
                return Err(corruption(path, format!("block truncated at entry {i}")));
            }
            let key_len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let seq = u64::from_le_bytes(data[pos + 4..pos + 12].try_into().unwrap());
            let kind_byte = data[pos + 12];
            let val_len = u32::from_le_bytes(data[pos + 13..pos + 17].try_into().unwrap()) as usize;
            pos += 17;
            if pos + key_len + val_len > data.len() {
                return Err(corruption(path, format!("block entry {i} overflows block")));
            }
            let kind = match kind_byte {
                1 => PointKind::Set,
                2 => PointKind::Delete,
                3 => PointKind::SingleDelete,
                4 => PointKind::Merge,
                other => {
                    return Err(corruption(path, format!("unknown point kind {other}")));
                }
            };
            out.push(SstPointEntry {
                key: data[pos..pos + key_len].to_vec(),
                seq,
                kind,
                value: data[pos + key_len..pos + key_len + val_len].to_vec(),
            });
            pos += key_len + val_len;
        }
        Ok(out)
    }

    fn parse_index(path: &Path, data: &[u8]) -> Result<Vec<IndexEntry>, StorageError> {
        if data.len() < 4 {
            return Err(corruption(path, "index too short"));
        }
        let count = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let mut pos = 4;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            if pos + 16 > data.len() {
                return Err(corruption(path, format!("index truncated at entry {i}")));
            }
            let block_offset = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            let block_len = u32::from_le_bytes(data[pos + 8..pos + 12].try_into().unwrap());
            let key_len = u32::from_le_bytes(data[pos + 12..pos + 16].try_into().unwrap()) as usize;
            pos += 16;
            if pos + key_len > data.len() {
                return Err(corruption(path, format!("index entry {i} key overflows")));
            }
            out.push(IndexEntry {
                last_key: data[pos..pos + key_len].to_vec(),
                block_offset,
                block_len,
            });
            pos += key_len;
        }
        Ok(out)
    }
}

// ── Live file handles ───────────────────────────────────────────────────────

/// The underlying file of one or more sstable handles. When the last handle
/// referencing an obsolete file drops, the file is removed from disk. This
/// is what keeps snapshots valid across compactions: a snapshot clones the
/// handles it needs and the files survive until it closes.
pub struct SstFile {
    pub path: PathBuf,
    pub file_id: u64,
    pub locality: FileLocality,
    obsolete: AtomicBool,
    reader: OnceLock<SstReader>,
}

impl SstFile {
    pub fn new(path: PathBuf, file_id: u64, locality: FileLocality) -> Arc<Self> {
        Arc::new(Self {
            path,
            file_id,
            locality,
            obsolete: AtomicBool::new(false),
            reader: OnceLock::new(),
        })
    }

    /// Mark the file for deletion once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn reader(&self) -> Result<&SstReader, StorageError> {
        if let Some(r) = self.reader.get() {
            return Ok(r);
        }
        let reader = SstReader::open(&self.path, self.file_id)?;
        Ok(self.reader.get_or_init(|| reader))
    }
}

impl Drop for SstFile {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) && self.locality == FileLocality::Local {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!("failed to remove obsolete sstable {:?}: {}", self.path, e);
            }
        }
    }
}

/// A view over an `SstFile`, possibly restricted to a sub-span of keys.
/// Virtual splits produced at ingest time share one underlying file with
/// disjoint bounds.
#[derive(Clone)]
pub struct SstHandle {
    pub file: Arc<SstFile>,
    pub meta: SstMeta,
    /// Restriction to `[lower, upper)` of encoded keys, if virtually split.
    pub bounds: Option<(Vec<u8>, Vec<u8>)>,
    /// For ingested files: the engine sequence assigned at ingestion.
    /// Entry sequences from the external builder are rebased onto it so the
    /// ingest is invisible to snapshots created before it.
    pub assigned_seq: Option<u64>,
}

impl SstHandle {
    pub fn new(file: Arc<SstFile>, meta: SstMeta) -> Self {
        Self {
            file,
            meta,
            bounds: None,
            assigned_seq: None,
        }
    }

    /// Effective `[min, max]` key coverage of this handle.
    pub fn coverage(&self) -> (Vec<u8>, Vec<u8>) {
        match &self.bounds {
            Some((lo, hi)) => (
                self.meta.min_key.clone().max(lo.clone()),
                self.meta.max_key.clone().min(hi.clone()),
            ),
            None => (self.meta.min_key.clone(), self.meta.max_key.clone()),
        }
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        match &self.bounds {
            Some((lo, hi)) => key >= lo.as_slice() && key < hi.as_slice(),
            None => true,
        }
    }

    pub fn get(
        &self,
        key: &[u8],
        max_seq: u64,
        cache: Option<&BlockCache>,
    ) -> Result<Option<SstPointEntry>, StorageError> {
        if !self.in_bounds(key) {
            return Ok(None);
        }
        if let Some(s) = self.assigned_seq {
            if s > max_seq {
                return Ok(None);
            }
            return Ok(self.file.reader()?.get(key, u64::MAX, cache)?.map(|mut e| {
                e.seq = s;
                e
            }));
        }
        self.file.reader()?.get(key, max_seq, cache)
    }

    pub fn scan(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        max_seq: u64,
        cache: Option<&BlockCache>,
    ) -> Result<Vec<SstPointEntry>, StorageError> {
        let (eff_lower, eff_upper) = match &self.bounds {
            Some((lo, hi)) => {
                let l = if lower < lo.as_slice() {
                    lo.clone()
                } else {
                    lower.to_vec()
                };
                let u = match upper {
                    Some(u) if u < hi.as_slice() => Some(u.to_vec()),
                    _ => Some(hi.clone()),
                };
                (l, u)
            }
            None => (lower.to_vec(), upper.map(|u| u.to_vec())),
        };
        if let Some(s) = self.assigned_seq {
            if s > max_seq {
                return Ok(Vec::new());
            }
            let mut entries =
                self.file
                    .reader()?
                    .scan(&eff_lower, eff_upper.as_deref(), u64::MAX, cache)?;
            for e in entries.iter_mut() {
                e.seq = s;
            }
            return Ok(entries);
        }
        self.file
            .reader()?
            .scan(&eff_lower, eff_upper.as_deref(), max_seq, cache)
    }

    /// Range tombstones and range keys carried by the file, clipped to the
    /// handle bounds.
    pub fn range_block(&self) -> Result<SstRangeBlock, StorageError> {
        let rb = self.file.reader()?.range_block().clone();
        match &self.bounds {
            None => Ok(rb),
            Some((lo, hi)) => {
                let clip = |start: &[u8], end: &[u8]| -> Option<(Vec<u8>, Vec<u8>)> {
                    let s = start.max(lo.as_slice());
                    let e = end.min(hi.as_slice());
                    if s < e {
                        Some((s.to_vec(), e.to_vec()))
                    } else {
                        None
                    }
                };
                let mut out = SstRangeBlock::default();
                for d in rb.range_dels {
                    if let Some((s, e)) = clip(&d.start, &d.end) {
                        out.range_dels.push(RangeTombstone {
                            start: s,
                            end: e,
                            seq: d.seq,
                        });
                    }
                }
                for rk in rb.range_keys {
                    if let Some((s, e)) = clip(&rk.start, &rk.end) {
                        let mut rk = rk.clone();
                        rk.start = s;
                        rk.end = e;
                        out.range_keys.push(rk);
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Allocate a fresh file id.
pub fn next_file_id() -> u64 {
    NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed)
}
