//! Block-device meta-data: value types and the range-disjoint index.

mod index;

pub use index::{AddResult, BlockIndex, Location};

use std::fmt;
use std::str::FromStr;

use strata_core::archive::{InputArchive, Load, LoadError, OutputArchive, Save};

// ── Value types ───────────────────────────────────────────────────────────────

/// A 64-bit block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockId(pub u64);

impl BlockId {
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(BlockId(s.parse()?))
    }
}

impl Save for BlockId {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.save(oa);
    }
}

impl Load for BlockId {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(BlockId(u64::load(ia)?))
    }
}

/// A count of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BlockCount(pub u64);

impl fmt::Display for BlockCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Save for BlockCount {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.save(oa);
    }
}

impl Load for BlockCount {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(BlockCount(u64::load(ia)?))
    }
}

/// Bytes per block; never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockSize(u64);

impl BlockSize {
    pub fn new(bytes: u64) -> Result<BlockSize, BlockSizeError> {
        if bytes == 0 {
            return Err(BlockSizeError::MustNotBeZero);
        }
        Ok(BlockSize(bytes))
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockSizeError {
    #[error("block size must not be zero")]
    MustNotBeZero,
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlockSize {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: u64 = s.parse().map_err(|e| format!("bad block size: {e}"))?;
        BlockSize::new(bytes).map_err(|e| e.to_string())
    }
}

impl Save for BlockSize {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.save(oa);
    }
}

impl Load for BlockSize {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        BlockSize::new(u64::load(ia)?).map_err(|e| LoadError::Invalid(e.to_string()))
    }
}

/// A half-open, non-empty range of block ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRange {
    begin: BlockId,
    end: BlockId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockRangeError {
    #[error("block range begin {begin} must be smaller than end {end}")]
    BeginMustBeSmallerThanEnd { begin: BlockId, end: BlockId },
}

impl BlockRange {
    pub fn new(begin: BlockId, end: BlockId) -> Result<BlockRange, BlockRangeError> {
        if begin >= end {
            return Err(BlockRangeError::BeginMustBeSmallerThanEnd { begin, end });
        }
        Ok(BlockRange { begin, end })
    }

    pub fn begin(&self) -> BlockId {
        self.begin
    }

    pub fn end(&self) -> BlockId {
        self.end
    }

    pub fn count(&self) -> BlockCount {
        BlockCount(self.end.0 - self.begin.0)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        id >= self.begin && id < self.end
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl FromStr for BlockRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| format!("expected [begin, end), got {s:?}"))?;
        let (begin, end) = inner
            .split_once(',')
            .ok_or_else(|| format!("expected two comma-separated block ids in {s:?}"))?;
        let begin: BlockId = begin.trim().parse().map_err(|e| format!("bad begin: {e}"))?;
        let end: BlockId = end.trim().parse().map_err(|e| format!("bad end: {e}"))?;
        BlockRange::new(begin, end).map_err(|e| e.to_string())
    }
}

impl Save for BlockRange {
    fn save(&self, oa: &mut OutputArchive) {
        self.begin.save(oa);
        self.end.save(oa);
    }
}

impl Load for BlockRange {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        let begin = BlockId::load(ia)?;
        let end = BlockId::load(ia)?;
        BlockRange::new(begin, end).map_err(|e| LoadError::Invalid(e.to_string()))
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub mod command {
    use strata_core::storage::Storage;
    use strata_rpc::command::Command;
    use strata_rpc::command_set;

    use super::index::{AddResult, Location};
    use super::{BlockCount, BlockId, BlockRange, BlockSize};
    use strata_core::impl_archive_struct;

    /// Query commands carry no payload.
    macro_rules! query_command {
        ($(#[$meta:meta])* $name:ident, $response:ty, $wire_name:literal) => {
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
            pub struct $name;

            impl strata_core::archive::Save for $name {
                fn save(&self, _oa: &mut strata_core::archive::OutputArchive) {}
            }

            impl strata_core::archive::Load for $name {
                fn load(
                    _ia: &mut strata_core::archive::InputArchive<'_>,
                ) -> Result<Self, strata_core::archive::LoadError> {
                    Ok($name)
                }
            }

            impl Command for $name {
                type Response = $response;
                const NAME: &'static str = $wire_name;
            }
        };
    }

    query_command!(QueryBlockSize, BlockSize, "block.size");
    query_command!(QueryNumberOfBlocks, BlockCount, "block.number_of_blocks");
    query_command!(QueryBlocks, Vec<BlockRange>, "block.blocks");

    /// Register a storage's range as blocks; first-fit placement.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Add {
        pub storage: Storage,
    }

    impl_archive_struct!(Add { storage });

    impl Command for Add {
        type Response = AddResult;
        const NAME: &'static str = "block.add";
    }

    /// Remove a previously added range; must match exactly.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Remove {
        pub range: BlockRange,
    }

    impl_archive_struct!(Remove { range });

    impl Command for Remove {
        type Response = Storage;
        const NAME: &'static str = "block.remove";
    }

    /// Resolve one block id to its storage and byte offset.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct QueryLocation {
        pub id: BlockId,
    }

    impl_archive_struct!(QueryLocation { id });

    impl Command for QueryLocation {
        type Response = Location;
        const NAME: &'static str = "block.location";
    }

    command_set! {
        /// The block-device meta-data command set.
        pub enum BlockCommands {
            QueryBlockSize(QueryBlockSize),
            QueryNumberOfBlocks(QueryNumberOfBlocks),
            QueryBlocks(QueryBlocks),
            Add(Add),
            Remove(Remove),
            QueryLocation(QueryLocation),
        }
    }
}
