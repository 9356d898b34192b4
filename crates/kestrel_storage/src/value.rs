//! MVCC value encoding.
//!
//! Each MVCC version stored in the engine carries a fixed-width header with
//! transaction-observability metadata ahead of the raw bytes:
//!
//! ```text
//!   [local_wall: u64]   - local timestamp wall component (0 = unset)
//!   [local_logical: u32] - local timestamp logical component
//!   [flags: u8]         - bit 0: tombstone, bit 1: value-header-present
//!   [data_len: u32]     - length of the raw value bytes
//!   [data: bytes]       - raw value (empty for tombstones)
//! ```
//!
//! Total header overhead: 8 + 4 + 1 + 4 = 17 bytes.

use kestrel_common::types::Timestamp;

/// Header size for MVCC-encoded values.
pub const MVCC_VALUE_HEADER_SIZE: usize = 17;

const FLAG_TOMBSTONE: u8 = 1 << 0;
const FLAG_HAS_HEADER: u8 = 1 << 1;

/// An MVCC value parsed from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccValue {
    /// Local timestamp: the node-local clock reading when the version was
    /// written, used by observed-timestamp reasoning. Zero when unset.
    pub local_ts: Timestamp,
    pub is_tombstone: bool,
    pub data: Vec<u8>,
}

impl MvccValue {
    pub fn value(data: Vec<u8>) -> Self {
        Self {
            local_ts: Timestamp::MIN,
            is_tombstone: false,
            data,
        }
    }

    pub fn tombstone() -> Self {
        Self {
            local_ts: Timestamp::MIN,
            is_tombstone: true,
            data: Vec::new(),
        }
    }

    pub fn with_local_ts(mut self, ts: Timestamp) -> Self {
        self.local_ts = ts;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MVCC_VALUE_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.local_ts.wall.to_le_bytes());
        buf.extend_from_slice(&self.local_ts.logical.to_le_bytes());
        let mut flags = 0u8;
        if self.is_tombstone {
            flags |= FLAG_TOMBSTONE;
        }
        if !self.local_ts.is_empty() {
            flags |= FLAG_HAS_HEADER;
        }
        buf.push(flags);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < MVCC_VALUE_HEADER_SIZE {
            return None;
        }
        let wall = u64::from_le_bytes(raw[0..8].try_into().ok()?);
        let logical = u32::from_le_bytes(raw[8..12].try_into().ok()?);
        let flags = raw[12];
        let data_len = u32::from_le_bytes(raw[13..17].try_into().ok()?) as usize;
        if raw.len() < MVCC_VALUE_HEADER_SIZE + data_len {
            return None;
        }
        Some(Self {
            local_ts: Timestamp::new(wall, logical),
            is_tombstone: flags & FLAG_TOMBSTONE != 0,
            data: raw[MVCC_VALUE_HEADER_SIZE..MVCC_VALUE_HEADER_SIZE + data_len].to_vec(),
        })
    }
}
