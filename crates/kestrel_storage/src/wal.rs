//! Write-ahead log.
//!
//! Append-only segments with group commit and rotation. Each segment opens
//! with magic + format version; each record is `[len:4][crc32:4][payload]`.
//! Replay stops at the first torn or checksum-failing record, which is the
//! expected shape of a crash tail.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::error::StorageError;

use crate::batch::BatchOp;

pub const WAL_FORMAT_VERSION: u32 = 1;
pub const WAL_MAGIC: &[u8; 4] = b"KWAL";
pub const WAL_SEGMENT_HEADER_SIZE: usize = 8;

/// A single WAL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// An atomically committed batch. `first_seq` is the sequence number
    /// assigned to the first operation.
    Batch { first_seq: u64, ops: Vec<BatchOp> },
    /// Marks everything before it as flushed to sstables.
    FlushMarker { through_seq: u64 },
}

#[derive(Debug, Clone, Copy)]
pub enum SyncMode {
    None,
    FDataSync,
}

const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;
const DEFAULT_GROUP_COMMIT_SIZE: usize = 8;

fn segment_filename(segment_id: u64) -> String {
    format!("kestrel_{segment_id:06}.wal")
}

struct WalWriterInner {
    writer: BufWriter<File>,
    dir: PathBuf,
    current_segment: u64,
    current_segment_size: u64,
    pending_count: usize,
    pending_bytes: u64,
}

/// Append-only WAL writer with group commit and segment rotation.
pub struct WalWriter {
    inner: Mutex<WalWriterInner>,
    lsn: AtomicU64,
    sync_mode: SyncMode,
    max_segment_size: u64,
    group_commit_size: usize,
    /// Fsync latency above this is reported as a disk-slow event.
    disk_slow_threshold_ms: u64,
    disk_slow_events: AtomicU64,
    last_fsync_ms: AtomicU64,
}

impl WalWriter {
    pub fn open(dir: &Path, sync_mode: SyncMode) -> Result<Self, StorageError> {
        Self::open_with_options(
            dir,
            sync_mode,
            DEFAULT_SEGMENT_SIZE,
            DEFAULT_GROUP_COMMIT_SIZE,
            500,
        )
    }

    pub fn open_with_options(
        dir: &Path,
        sync_mode: SyncMode,
        max_segment_size: u64,
        group_commit_size: usize,
        disk_slow_threshold_ms: u64,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let segment_id = Self::find_latest_segment(dir).unwrap_or(0);
        let seg_path = dir.join(segment_filename(segment_id));

        let file = OpenOptions::new().create(true).append(true).open(&seg_path)?;
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let is_new = file_len == 0;
        let mut current_segment_size = file_len;

        let mut writer = BufWriter::new(file);
        if is_new {
            writer.write_all(WAL_MAGIC)?;
            writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            current_segment_size = WAL_SEGMENT_HEADER_SIZE as u64;
        }

        Ok(Self {
            inner: Mutex::new(WalWriterInner {
                writer,
                dir: dir.to_path_buf(),
                current_segment: segment_id,
                current_segment_size,
                pending_count: 0,
                pending_bytes: 0,
            }),
            lsn: AtomicU64::new(0),
            sync_mode,
            max_segment_size,
            group_commit_size,
            disk_slow_threshold_ms,
            disk_slow_events: AtomicU64::new(0),
            last_fsync_ms: AtomicU64::new(0),
        })
    }

    fn find_latest_segment(dir: &Path) -> Option<u64> {
        let mut max_id = None;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("kestrel_") && name.ends_with(".wal") {
                    if let Ok(id) = name[8..name.len() - 4].parse::<u64>() {
                        max_id = Some(max_id.map_or(id, |cur: u64| cur.max(id)));
                    }
                }
            }
        }
        max_id
    }

    /// Append a record. Returns its LSN. `force_sync` flushes and syncs
    /// regardless of group-commit batching.
    pub fn append(&self, record: &WalRecord, force_sync: bool) -> Result<u64, StorageError> {
        let data =
            bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let lsn = self.lsn.fetch_add(1, Ordering::SeqCst);
        let checksum = crc32fast::hash(&data);
        let record_size = 8 + data.len() as u64;

        let mut inner = self.inner.lock();
        if inner.current_segment_size + record_size > self.max_segment_size {
            self.rotate_segment(&mut inner)?;
        }

        inner
            .writer
            .write_all(&(data.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.current_segment_size += record_size;
        inner.pending_count += 1;
        inner.pending_bytes += record_size;

        if force_sync || inner.pending_count >= self.group_commit_size {
            self.flush_inner(&mut inner)?;
        }
        Ok(lsn)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.flush_inner(&mut inner)
    }

    fn flush_inner(&self, inner: &mut WalWriterInner) -> Result<(), StorageError> {
        inner.writer.flush()?;
        inner.pending_count = 0;
        inner.pending_bytes = 0;
        if matches!(self.sync_mode, SyncMode::FDataSync) {
            let start = Instant::now();
            inner.writer.get_ref().sync_data()?;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            self.last_fsync_ms.store(elapsed_ms, Ordering::Relaxed);
            if elapsed_ms >= self.disk_slow_threshold_ms {
                self.disk_slow_events.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(elapsed_ms, "slow WAL fsync");
            }
        }
        Ok(())
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<(), StorageError> {
        inner.writer.flush()?;
        if matches!(self.sync_mode, SyncMode::FDataSync) {
            inner.writer.get_ref().sync_data()?;
        }
        inner.current_segment += 1;
        let new_path = inner.dir.join(segment_filename(inner.current_segment));
        let file = OpenOptions::new().create(true).append(true).open(&new_path)?;
        inner.writer = BufWriter::new(file);
        inner.writer.write_all(WAL_MAGIC)?;
        inner.writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
        inner.current_segment_size = WAL_SEGMENT_HEADER_SIZE as u64;
        inner.pending_count = 0;
        inner.pending_bytes = 0;
        tracing::debug!("WAL rotated to segment {}", inner.current_segment);
        Ok(())
    }

    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn current_segment_id(&self) -> u64 {
        self.inner.lock().current_segment
    }

    /// Bytes buffered but not yet flushed.
    pub fn queued_bytes(&self) -> u64 {
        self.inner.lock().pending_bytes
    }

    pub fn disk_slow_events(&self) -> u64 {
        self.disk_slow_events.load(Ordering::Relaxed)
    }

    pub fn last_fsync_ms(&self) -> u64 {
        self.last_fsync_ms.load(Ordering::Relaxed)
    }

    /// Remove segments strictly older than `segment_id`.
    pub fn purge_segments_before(&self, segment_id: u64) -> Result<usize, StorageError> {
        let inner = self.inner.lock();
        let mut removed = 0;
        for id in 0..segment_id {
            let path = inner.dir.join(segment_filename(id));
            if path.exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Reads WAL segments in order for crash recovery.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn read_all(&self) -> Result<Vec<WalRecord>, StorageError> {
        let mut segment_ids = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy().to_string();
                if name.starts_with("kestrel_") && name.ends_with(".wal") {
                    if let Ok(id) = name[8..name.len() - 4].parse::<u64>() {
                        segment_ids.push(id);
                    }
                }
            }
        }
        segment_ids.sort_unstable();

        let mut records = Vec::new();
        for seg_id in segment_ids {
            let seg_path = self.dir.join(segment_filename(seg_id));
            if seg_path.exists() {
                let data = fs::read(&seg_path)?;
                Self::parse_records(&data, &mut records);
            }
        }
        Ok(records)
    }

    fn parse_records(data: &[u8], records: &mut Vec<WalRecord>) {
        let mut pos = 0;
        if data.len() >= WAL_SEGMENT_HEADER_SIZE && &data[0..4] == WAL_MAGIC.as_slice() {
            pos = WAL_SEGMENT_HEADER_SIZE;
        }
        while pos + 8 <= data.len() {
            let len =
                u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
                    as usize;
            let checksum =
                u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            pos += 8;
            if pos + len > data.len() {
                tracing::warn!("WAL truncated at offset {pos}, stopping replay");
                break;
            }
            let payload = &data[pos..pos + len];
            if crc32fast::hash(payload) != checksum {
                tracing::warn!("WAL checksum mismatch at offset {pos}, stopping replay");
                break;
            }
            match bincode::deserialize::<WalRecord>(payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("WAL decode error at offset {pos}: {e}");
                    break;
                }
            }
            pos += len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch_record(first_seq: u64, key: &[u8]) -> WalRecord {
        WalRecord::Batch {
            first_seq,
            ops: vec![BatchOp::Put {
                key: key.to_vec(),
                value: b"v".to_vec(),
            }],
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
        wal.append(&batch_record(1, b"a"), false).unwrap();
        wal.append(&batch_record(2, b"b"), false).unwrap();
        wal.flush().unwrap();

        let records = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            WalRecord::Batch { first_seq, ops } => {
                assert_eq!(*first_seq, 1);
                assert_eq!(ops.len(), 1);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_lsn_increments() {
        let dir = TempDir::new().unwrap();
        let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
        let a = wal.append(&batch_record(1, b"a"), false).unwrap();
        let b = wal.append(&batch_record(2, b"b"), false).unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_segment_rotation_and_purge() {
        let dir = TempDir::new().unwrap();
        let wal =
            WalWriter::open_with_options(dir.path(), SyncMode::None, 256, 1, 500).unwrap();
        for i in 0..50u64 {
            wal.append(&batch_record(i, format!("key{i:04}").as_bytes()), false)
                .unwrap();
        }
        wal.flush().unwrap();
        assert!(wal.current_segment_id() > 0, "should have rotated");

        // Everything replays across segments.
        let records = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(records.len(), 50);

        let current = wal.current_segment_id();
        let removed = wal.purge_segments_before(current).unwrap();
        assert!(removed > 0);
        let after = WalReader::new(dir.path()).read_all().unwrap();
        assert!(after.len() < 50);
    }

    #[test]
    fn test_torn_tail_stops_replay() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
            wal.append(&batch_record(1, b"good"), false).unwrap();
            wal.flush().unwrap();
        }
        // Append garbage simulating a torn write.
        let seg = dir.path().join(segment_filename(0));
        let mut data = fs::read(&seg).unwrap();
        data.extend_from_slice(&[0x10, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x01]);
        fs::write(&seg, &data).unwrap();

        let records = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(records.len(), 1, "replay must stop at the torn record");
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
            wal.append(&batch_record(1, b"first"), false).unwrap();
            wal.append(&batch_record(2, b"second"), false).unwrap();
            wal.flush().unwrap();
        }
        let seg = dir.path().join(segment_filename(0));
        let mut data = fs::read(&seg).unwrap();
        // Flip a byte inside the second record's payload.
        let n = data.len();
        data[n - 3] ^= 0xFF;
        fs::write(&seg, &data).unwrap();

        let records = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_reopen_appends_to_latest_segment() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
            wal.append(&batch_record(1, b"a"), false).unwrap();
            wal.flush().unwrap();
        }
        {
            let wal = WalWriter::open(dir.path(), SyncMode::None).unwrap();
            wal.append(&batch_record(2, b"b"), false).unwrap();
            wal.flush().unwrap();
        }
        let records = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_force_sync_flushes_immediately() {
        let dir = TempDir::new().unwrap();
        let wal =
            WalWriter::open_with_options(dir.path(), SyncMode::FDataSync, 1 << 20, 1000, 500)
                .unwrap();
        wal.append(&batch_record(1, b"a"), true).unwrap();
        assert_eq!(wal.queued_bytes(), 0);
        let records = WalReader::new(dir.path()).read_all().unwrap();
        assert_eq!(records.len(), 1);
    }
}
