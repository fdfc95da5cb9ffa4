//! The range-disjoint block registry.
//!
//! A sorted set of `BlockRange → Storage` entries. Invariants: ranges are
//! pairwise disjoint, each range's block count times the block size equals
//! its storage's byte length, the block size is fixed at construction, and
//! enumeration is in block-id order.

use std::collections::BTreeMap;
use std::sync::Mutex;

use strata_core::impl_archive_struct;
use strata_core::memory::Offset;
use strata_core::storage::Storage;
use strata_rpc::server::{Handle, HandlerFailure};

use super::command::{
    Add, QueryBlockSize, QueryBlocks, QueryLocation, QueryNumberOfBlocks, Remove,
};
use super::{BlockCount, BlockId, BlockRange, BlockSize};

// ── Results ───────────────────────────────────────────────────────────────────

/// Where an added storage landed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AddResult {
    pub range: BlockRange,
}

impl_archive_struct!(AddResult { range });

/// Which storage backs a block, and at which byte offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub storage: Storage,
    pub offset: Offset,
}

impl_archive_struct!(Location { storage, offset });

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BlockIndexError {
    #[error("storage range of {length} bytes is not a multiple of block size {block_size}")]
    NotAligned { length: u64, block_size: BlockSize },

    #[error("storage range is empty, nothing to add")]
    Empty,

    #[error("unknown range {0}")]
    UnknownRange(BlockRange),

    #[error("block {0} is unmapped")]
    Unmapped(BlockId),

    #[error("byte offset of block {0} overflows in an intermediate")]
    OverflowInIntermediate(BlockId),
}

// ── Index ─────────────────────────────────────────────────────────────────────

/// Block-addressed registry of storages. One mutex over the sorted set.
pub struct BlockIndex {
    block_size: BlockSize,
    entries: Mutex<BTreeMap<BlockId, Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
    range: BlockRange,
    storage: Storage,
}

impl BlockIndex {
    pub fn new(block_size: BlockSize) -> BlockIndex {
        BlockIndex {
            block_size,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Sum of block counts of all live ranges.
    pub fn number_of_blocks(&self) -> BlockCount {
        let entries = self.entries.lock().unwrap();
        BlockCount(entries.values().map(|e| e.range.count().0).sum())
    }

    /// Live ranges in block-id order.
    pub fn blocks(&self) -> Vec<BlockRange> {
        let entries = self.entries.lock().unwrap();
        entries.values().map(|e| e.range).collect()
    }

    /// First-fit insertion: the storage's byte length must divide evenly
    /// into blocks; the range lands in the lowest gap that fits.
    pub fn add(&self, storage: Storage) -> Result<AddResult, BlockIndexError> {
        let length = storage.range.len().value();
        if length % self.block_size.value() != 0 {
            return Err(BlockIndexError::NotAligned {
                length,
                block_size: self.block_size,
            });
        }
        let blocks = length / self.block_size.value();
        if blocks == 0 {
            return Err(BlockIndexError::Empty);
        }

        let mut entries = self.entries.lock().unwrap();

        // Walk the live ranges in order, placing at the first gap that fits.
        let mut candidate = BlockId(0);
        for entry in entries.values() {
            if entry.range.begin().value() - candidate.value() >= blocks {
                break;
            }
            candidate = entry.range.end();
        }

        let range = BlockRange::new(candidate, BlockId(candidate.value() + blocks))
            .expect("blocks is positive");
        entries.insert(candidate, Entry { range, storage });
        Ok(AddResult { range })
    }

    /// Exact-match removal, returning the storage that backed the range.
    pub fn remove(&self, range: BlockRange) -> Result<Storage, BlockIndexError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&range.begin()) {
            Some(entry) if entry.range == range => {}
            _ => return Err(BlockIndexError::UnknownRange(range)),
        }
        let entry = entries.remove(&range.begin()).expect("presence checked above");
        Ok(entry.storage)
    }

    /// Resolve a block id to `{storage, offset}` with
    /// `offset = (id - range.begin) * block_size`.
    pub fn location(&self, id: BlockId) -> Result<Location, BlockIndexError> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .range(..=id)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.range.contains(id))
            .ok_or(BlockIndexError::Unmapped(id))?;
        let offset = (id.value() - entry.range.begin().value())
            .checked_mul(self.block_size.value())
            .ok_or(BlockIndexError::OverflowInIntermediate(id))?;
        Ok(Location {
            storage: entry.storage.clone(),
            offset: Offset(offset),
        })
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

impl Handle<QueryBlockSize> for BlockIndex {
    async fn handle(&self, _: QueryBlockSize) -> Result<BlockSize, HandlerFailure> {
        Ok(self.block_size())
    }
}

impl Handle<QueryNumberOfBlocks> for BlockIndex {
    async fn handle(&self, _: QueryNumberOfBlocks) -> Result<BlockCount, HandlerFailure> {
        Ok(self.number_of_blocks())
    }
}

impl Handle<QueryBlocks> for BlockIndex {
    async fn handle(&self, _: QueryBlocks) -> Result<Vec<BlockRange>, HandlerFailure> {
        Ok(self.blocks())
    }
}

impl Handle<Add> for BlockIndex {
    async fn handle(&self, add: Add) -> Result<AddResult, HandlerFailure> {
        self.add(add.storage).map_err(HandlerFailure::of)
    }
}

impl Handle<Remove> for BlockIndex {
    async fn handle(&self, remove: Remove) -> Result<Storage, HandlerFailure> {
        self.remove(remove.range).map_err(HandlerFailure::of)
    }
}

impl Handle<QueryLocation> for BlockIndex {
    async fn handle(&self, location: QueryLocation) -> Result<Location, HandlerFailure> {
        self.location(location.id).map_err(HandlerFailure::of)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
