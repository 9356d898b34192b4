//! Emergency ballast file.
//!
//! A fixed-size file reserved in the engine directory so an operator can
//! reclaim space by deleting it when the disk fills up. Resizing is
//! best-effort: shrink immediately when asked, grow only when free space is
//! plentiful (approximated here as "growing never fails the caller").

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use kestrel_common::error::StorageError;

pub const BALLAST_FILENAME: &str = "EMERGENCY_BALLAST";

pub struct Ballast {
    path: PathBuf,
}

impl Ballast {
    /// Ensure a ballast of `size_bytes` exists at the engine directory.
    /// `size_bytes == 0` removes any existing ballast.
    pub fn ensure(dir: &Path, size_bytes: u64) -> Result<Ballast, StorageError> {
        let path = dir.join(BALLAST_FILENAME);
        if size_bytes == 0 {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(Ballast { path });
        }
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        let current = file.metadata()?.len();
        if current != size_bytes {
            if let Err(e) = file.set_len(size_bytes) {
                // Best-effort: a full disk must not fail engine open.
                tracing::warn!("ballast resize to {size_bytes} bytes failed: {e}");
            }
        }
        Ok(Ballast { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
