//! Engine checkpoints.
//!
//! A checkpoint is a self-contained copy of the engine at a point in time,
//! optionally restricted to a set of spans. It always carries a
//! `min-version` file and a `checkpoint.txt` note listing the spans.

use std::fs;
use std::path::{Path, PathBuf};

use kestrel_common::error::StorageError;
use kestrel_common::types::Span;

use crate::version::CURRENT_VERSION;

pub const CHECKPOINT_NOTE_FILENAME: &str = "checkpoint.txt";

/// Materialize a checkpoint directory from the given sstable and WAL files.
/// An empty `spans` slice means the whole keyspace.
pub fn write_checkpoint(
    target: &Path,
    spans: &[Span],
    sst_paths: &[PathBuf],
    wal_segment_paths: &[PathBuf],
) -> Result<(), StorageError> {
    fs::create_dir_all(target)?;

    for src in sst_paths.iter().chain(wal_segment_paths.iter()) {
        let Some(name) = src.file_name() else {
            continue;
        };
        let dst = target.join(name);
        // Hard links keep the copy cheap; fall back to a byte copy across
        // filesystems.
        if fs::hard_link(src, &dst).is_err() {
            fs::copy(src, &dst)?;
        }
    }

    CURRENT_VERSION.write_to(target)?;

    let mut note = String::new();
    if spans.is_empty() {
        note.push_str("spans: all\n");
    } else {
        note.push_str("spans:\n");
        for s in spans {
            note.push_str(&format!("  {:?} .. {:?}\n", s.start, s.end));
        }
    }
    fs::write(target.join(CHECKPOINT_NOTE_FILENAME), note)?;
    Ok(())
}
