//! Store format versioning.
//!
//! A `min-version` file at the engine directory root records the format
//! version the store was last opened with. Open refuses a missing file on a
//! non-empty store (unless bootstrapping) and refuses versions older than
//! the minimum supported. Ratcheting is monotonic: the recorded version
//! never moves backwards.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use kestrel_common::error::StorageError;

pub const MIN_VERSION_FILENAME: &str = "min-version";

/// Format version recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Oldest store format this build can open.
pub const MIN_SUPPORTED_VERSION: FormatVersion = FormatVersion {
    major: 24,
    minor: 1,
    patch: 0,
};

/// Format written by this build.
pub const CURRENT_VERSION: FormatVersion = FormatVersion {
    major: 24,
    minor: 2,
    patch: 0,
};

impl FormatVersion {
    pub fn read_from(dir: &Path) -> Result<Option<FormatVersion>, StorageError> {
        let path = dir.join(MIN_VERSION_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let v: FormatVersion = serde_json::from_str(&raw)
            .map_err(|e| StorageError::Serialization(format!("min-version decode: {e}")))?;
        Ok(Some(v))
    }

    pub fn write_to(&self, dir: &Path) -> Result<(), StorageError> {
        let path = dir.join(MIN_VERSION_FILENAME);
        let tmp = dir.join("min-version.tmp");
        let raw = serde_json::to_string(self)
            .map_err(|e| StorageError::Serialization(format!("min-version encode: {e}")))?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Validate (and possibly initialize or ratchet) the version file at open.
///
/// `store_is_empty` is whether the directory held no engine data before
/// this open; `bootstrapping` permits a missing file on a non-empty
/// directory (first adoption of an existing directory).
pub fn check_and_ratchet(
    dir: &Path,
    store_is_empty: bool,
    bootstrapping: bool,
) -> Result<FormatVersion, StorageError> {
    match FormatVersion::read_from(dir)? {
        None => {
            if !store_is_empty && !bootstrapping {
                return Err(StorageError::MissingVersionFile {
                    dir: dir.display().to_string(),
                });
            }
            CURRENT_VERSION.write_to(dir)?;
            Ok(CURRENT_VERSION)
        }
        Some(found) => {
            if found < MIN_SUPPORTED_VERSION {
                return Err(StorageError::VersionTooOld {
                    found_major: found.major,
                    found_minor: found.minor,
                    found_patch: found.patch,
                    min_major: MIN_SUPPORTED_VERSION.major,
                    min_minor: MIN_SUPPORTED_VERSION.minor,
                    min_patch: MIN_SUPPORTED_VERSION.patch,
                });
            }
            // Ratchet forwards only.
            if found < CURRENT_VERSION {
                CURRENT_VERSION.write_to(dir)?;
                Ok(CURRENT_VERSION)
            } else {
                Ok(found)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_store_initializes_version() {
        let dir = TempDir::new().unwrap();
        let v = check_and_ratchet(dir.path(), true, false).unwrap();
        assert_eq!(v, CURRENT_VERSION);
        assert_eq!(
            FormatVersion::read_from(dir.path()).unwrap(),
            Some(CURRENT_VERSION)
        );
    }

    #[test]
    fn test_missing_file_on_nonempty_store_rejected() {
        let dir = TempDir::new().unwrap();
        let err = check_and_ratchet(dir.path(), false, false).unwrap_err();
        assert!(matches!(err, StorageError::MissingVersionFile { .. }));
    }

    #[test]
    fn test_bootstrapping_permits_missing_file() {
        let dir = TempDir::new().unwrap();
        let v = check_and_ratchet(dir.path(), false, true).unwrap();
        assert_eq!(v, CURRENT_VERSION);
    }

    #[test]
    fn test_too_old_version_rejected() {
        let dir = TempDir::new().unwrap();
        FormatVersion {
            major: 23,
            minor: 1,
            patch: 5,
        }
        .write_to(dir.path())
        .unwrap();
        let err = check_and_ratchet(dir.path(), false, false).unwrap_err();
        assert!(matches!(err, StorageError::VersionTooOld { .. }));
    }

    #[test]
    fn test_ratchet_is_monotonic() {
        let dir = TempDir::new().unwrap();
        MIN_SUPPORTED_VERSION.write_to(dir.path()).unwrap();
        let v = check_and_ratchet(dir.path(), false, false).unwrap();
        assert_eq!(v, CURRENT_VERSION);

        // A version newer than CURRENT stays put.
        let future = FormatVersion {
            major: 99,
            minor: 0,
            patch: 0,
        };
        future.write_to(dir.path()).unwrap();
        let v2 = check_and_ratchet(dir.path(), false, false).unwrap();
        assert_eq!(v2, future);
        assert_eq!(FormatVersion::read_from(dir.path()).unwrap(), Some(future));
    }

    #[test]
    fn test_version_ordering() {
        let a = FormatVersion {
            major: 24,
            minor: 1,
            patch: 0,
        };
        let b = FormatVersion {
            major: 24,
            minor: 2,
            patch: 0,
        };
        assert!(a < b);
    }
}
