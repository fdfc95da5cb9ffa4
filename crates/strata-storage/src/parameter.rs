//! Per-kind parameter bundles.
//!
//! Every storage kind publishes one plain value type per operation. The
//! bundles travel as opaque [`StorageParameter`] blobs and are only packed
//! and unpacked inside the owning kind; providers and clients move the
//! bytes along untouched.

use std::path::PathBuf;

use strata_core::archive::{InputArchive, Load, LoadError, OutputArchive, Save};
use strata_core::impl_archive_struct;
use strata_core::memory::MaxSize;

// ── Files ─────────────────────────────────────────────────────────────────────

/// What happens to a segment file when its segment is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnRemove {
    #[default]
    Remove,
    Keep,
}

impl Save for OnRemove {
    fn save(&self, oa: &mut OutputArchive) {
        match self {
            OnRemove::Remove => oa.variant_tag(0),
            OnRemove::Keep => oa.variant_tag(1),
        }
    }
}

impl Load for OnRemove {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        match ia.variant_tag()? {
            0 => Ok(OnRemove::Remove),
            1 => Ok(OnRemove::Keep),
            index => Err(LoadError::UnknownVariant {
                type_name: "OnRemove",
                index,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesCreate {
    /// Directory the storage's segment files live under.
    pub prefix: PathBuf,
    pub max_size: MaxSize,
}

impl_archive_struct!(FilesCreate { prefix, max_size });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilesSegmentCreate {
    pub on_remove: OnRemove,
}

impl_archive_struct!(FilesSegmentCreate { on_remove });

// ── Heap ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapCreate {
    pub max_size: MaxSize,
}

impl_archive_struct!(HeapCreate { max_size });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapSegmentCreate {
    /// Pin the segment's pages with mlock.
    pub mlock: bool,
}

impl_archive_struct!(HeapSegmentCreate { mlock });

// ── Shmem ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmemCreate {
    /// Shared-memory name prefix; must start with '/'.
    pub prefix: String,
    pub max_size: MaxSize,
}

impl_archive_struct!(ShmemCreate { prefix, max_size });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShmemSegmentCreate {
    pub mlock: bool,
    /// Map the segment read-only after sizing it.
    pub read_only: bool,
}

impl_archive_struct!(ShmemSegmentCreate { mlock, read_only });

// ── Foreign ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignCreate {
    /// Shared object implementing the storage C ABI.
    pub library: PathBuf,
    /// Opaque configuration passed to the library's create entry point.
    pub config: Vec<u8>,
    pub max_size: MaxSize,
}

impl_archive_struct!(ForeignCreate {
    library,
    config,
    max_size
});

// ── Empty bundles ─────────────────────────────────────────────────────────────

/// Operations whose bundle carries nothing still have a bundle type, so the
/// seven-bundle surface is uniform across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Empty;

impl Save for Empty {
    fn save(&self, _oa: &mut OutputArchive) {}
}

impl Load for Empty {
    fn load(_ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(Empty)
    }
}
