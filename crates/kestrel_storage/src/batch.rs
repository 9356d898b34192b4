//! Write batches.
//!
//! A batch accumulates mutations and applies them atomically on commit:
//! the engine assigns every operation a sequence number and publishes the
//! batch under a single visible-sequence bump, so iterators created before
//! or after the commit see either none or all of it.

use serde::{Deserialize, Serialize};

use kestrel_common::error::{KestrelResult, StorageError};

use crate::engine::Engine;

/// One mutation inside a batch. Keys are encoded engine keys; range key
/// bounds are user keys with an MVCC suffix timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    SingleDelete { key: Vec<u8> },
    Merge { key: Vec<u8>, operand: Vec<u8> },
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
    RangeKeySet {
        start: Vec<u8>,
        end: Vec<u8>,
        ts_wall: u64,
        ts_logical: u32,
        value: Vec<u8>,
    },
    RangeKeyUnset {
        start: Vec<u8>,
        end: Vec<u8>,
        ts_wall: u64,
        ts_logical: u32,
    },
}

impl BatchOp {
    fn validate(&self) -> Result<(), StorageError> {
        let empty = match self {
            BatchOp::Put { key, .. }
            | BatchOp::Delete { key }
            | BatchOp::SingleDelete { key }
            | BatchOp::Merge { key, .. } => key.is_empty(),
            BatchOp::DeleteRange { start, .. }
            | BatchOp::RangeKeySet { start, .. }
            | BatchOp::RangeKeyUnset { start, .. } => start.is_empty(),
        };
        if empty {
            Err(StorageError::EmptyKey)
        } else {
            Ok(())
        }
    }
}

/// A batch of writes against an [`Engine`]. Indexed batches additionally
/// answer reads from their own pending writes.
pub struct Batch<'a> {
    engine: &'a Engine,
    ops: Vec<BatchOp>,
    indexed: bool,
    committed: bool,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(engine: &'a Engine, indexed: bool) -> Self {
        Self {
            engine,
            ops: Vec::new(),
            indexed,
            committed: false,
        }
    }

    fn push(&mut self, op: BatchOp) -> KestrelResult<()> {
        if self.committed {
            return Err(StorageError::BatchCommitted.into());
        }
        op.validate()?;
        self.ops.push(op);
        Ok(())
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> KestrelResult<()> {
        self.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn delete(&mut self, key: &[u8]) -> KestrelResult<()> {
        self.push(BatchOp::Delete { key: key.to_vec() })
    }

    pub fn single_delete(&mut self, key: &[u8]) -> KestrelResult<()> {
        self.push(BatchOp::SingleDelete { key: key.to_vec() })
    }

    pub fn merge(&mut self, key: &[u8], operand: &[u8]) -> KestrelResult<()> {
        self.push(BatchOp::Merge {
            key: key.to_vec(),
            operand: operand.to_vec(),
        })
    }

    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> KestrelResult<()> {
        self.push(BatchOp::DeleteRange {
            start: start.to_vec(),
            end: end.to_vec(),
        })
    }

    pub fn range_key_set(
        &mut self,
        start: &[u8],
        end: &[u8],
        ts_wall: u64,
        ts_logical: u32,
        value: &[u8],
    ) -> KestrelResult<()> {
        self.push(BatchOp::RangeKeySet {
            start: start.to_vec(),
            end: end.to_vec(),
            ts_wall,
            ts_logical,
            value: value.to_vec(),
        })
    }

    pub fn range_key_unset(
        &mut self,
        start: &[u8],
        end: &[u8],
        ts_wall: u64,
        ts_logical: u32,
    ) -> KestrelResult<()> {
        self.push(BatchOp::RangeKeyUnset {
            start: start.to_vec(),
            end: end.to_vec(),
            ts_wall,
            ts_logical,
        })
    }

    /// Read through the batch: pending writes shadow the engine. Only
    /// supported on indexed batches.
    pub fn get(&self, key: &[u8]) -> KestrelResult<Option<Vec<u8>>> {
        if self.indexed {
            // Scan pending ops newest-first; the last write wins.
            for op in self.ops.iter().rev() {
                match op {
                    BatchOp::Put { key: k, value } if k.as_slice() == key => {
                        return Ok(Some(value.clone()))
                    }
                    BatchOp::Delete { key: k } | BatchOp::SingleDelete { key: k }
                        if k.as_slice() == key =>
                    {
                        return Ok(None)
                    }
                    BatchOp::DeleteRange { start, end }
                        if key >= start.as_slice() && key < end.as_slice() =>
                    {
                        return Ok(None)
                    }
                    _ => {}
                }
            }
        }
        self.engine.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Apply all accumulated operations atomically. `sync` forces the WAL
    /// record to disk before returning.
    pub fn commit(mut self, sync: bool) -> KestrelResult<()> {
        if self.committed {
            return Err(StorageError::BatchCommitted.into());
        }
        self.committed = true;
        let ops = std::mem::take(&mut self.ops);
        self.engine.apply_batch(ops, sync)
    }
}
