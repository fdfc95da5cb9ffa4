//! Storage descriptors, chunk descriptions and the bulk-transport address.
//!
//! A [`Storage`] value is everything a consumer needs to reach a byte range
//! on some provider: the endpoint, the storage id, the opaque parameter blob
//! the storage kind understands, the segment and the range. It crosses
//! process boundaries unchanged.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::archive::{InputArchive, Load, LoadError, OutputArchive, Save};
use crate::endpoint::Endpoint;
use crate::id::{SegmentId, StorageId};
use crate::impl_archive_struct;
use crate::memory::{Offset, Range, Size};

// ── Implementation tag ────────────────────────────────────────────────────────

/// Which of the four storage kinds backs a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Implementation {
    Files,
    Heap,
    Shmem,
    Foreign,
}

impl Implementation {
    pub fn name(self) -> &'static str {
        match self {
            Implementation::Files => "files",
            Implementation::Heap => "heap",
            Implementation::Shmem => "shmem",
            Implementation::Foreign => "foreign",
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Implementation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "files" => Ok(Implementation::Files),
            "heap" => Ok(Implementation::Heap),
            "shmem" => Ok(Implementation::Shmem),
            "foreign" => Ok(Implementation::Foreign),
            other => Err(format!("unknown storage implementation {other:?}")),
        }
    }
}

impl Save for Implementation {
    fn save(&self, oa: &mut OutputArchive) {
        let index = match self {
            Implementation::Files => 0u64,
            Implementation::Heap => 1,
            Implementation::Shmem => 2,
            Implementation::Foreign => 3,
        };
        oa.variant_tag(index);
    }
}

impl Load for Implementation {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        match ia.variant_tag()? {
            0 => Ok(Implementation::Files),
            1 => Ok(Implementation::Heap),
            2 => Ok(Implementation::Shmem),
            3 => Ok(Implementation::Foreign),
            index => Err(LoadError::UnknownVariant {
                type_name: "Implementation",
                index,
            }),
        }
    }
}

// ── Parameter blob ────────────────────────────────────────────────────────────

/// An implementation-private parameter bundle.
///
/// Only the owning storage kind parses the bytes; providers and clients move
/// the blob along untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StorageParameter(pub Vec<u8>);

impl StorageParameter {
    /// Pack a kind-typed bundle into an opaque blob.
    pub fn pack<T: Save>(bundle: &T) -> StorageParameter {
        StorageParameter(crate::archive::save_to_bytes(bundle))
    }

    /// Unpack inside the owning storage kind.
    pub fn unpack<T: Load>(&self) -> Result<T, LoadError> {
        crate::archive::load_from_bytes(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Save for StorageParameter {
    fn save(&self, oa: &mut OutputArchive) {
        self.0.save(oa);
    }
}

impl Load for StorageParameter {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(StorageParameter(Vec::<u8>::load(ia)?))
    }
}

// ── Storage descriptor ────────────────────────────────────────────────────────

/// Transferable description of a byte range on a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Storage {
    pub endpoint: Endpoint,
    pub storage_id: StorageId,
    pub parameter: StorageParameter,
    pub segment_id: SegmentId,
    pub range: Range,
}

impl_archive_struct!(Storage {
    endpoint,
    storage_id,
    parameter,
    segment_id,
    range,
});

impl Storage {
    /// The same descriptor narrowed to `range`.
    pub fn with_range(mut self, range: Range) -> Storage {
        self.range = range;
        self
    }
}

// ── Bulk-transport address ────────────────────────────────────────────────────

/// Addresses a byte position for the bulk transport: which storage, the
/// chunk-description parameter bundle for it, which segment, and where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub storage_id: StorageId,
    pub parameter_chunk_description: StorageParameter,
    pub segment_id: SegmentId,
    pub offset: Offset,
}

impl_archive_struct!(Address {
    storage_id,
    parameter_chunk_description,
    segment_id,
    offset,
});

// ── Chunk access modes ────────────────────────────────────────────────────────

/// Marker for read-only chunk access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Const;

/// Marker for writable chunk access. A mutable chunk may not coexist with
/// any other live handle to the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mutable;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Const {}
    impl Sealed for super::Mutable {}
}

/// Type-level chunk access mode. Carried on describe/attach commands so a
/// mutable description is a different wire command than a const one.
pub trait Access: sealed::Sealed + Send + Sync + fmt::Debug + Default + 'static {
    const MODE: AccessMode;
    /// Wire name of the chunk-description command at this access mode.
    const DESCRIBE_NAME: &'static str;
    /// Wire name of the share-service attach command at this access mode.
    const ATTACH_NAME: &'static str;
}

impl Access for Const {
    const MODE: AccessMode = AccessMode::Const;
    const DESCRIBE_NAME: &'static str = "chunk.description.const";
    const ATTACH_NAME: &'static str = "share.attach.const";
}

impl Access for Mutable {
    const MODE: AccessMode = AccessMode::Mutable;
    const DESCRIBE_NAME: &'static str = "chunk.description.mutable";
    const ATTACH_NAME: &'static str = "share.attach.mutable";
}

/// Runtime view of an access mode, for bookkeeping and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Const,
    Mutable,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Const => f.write_str("const"),
            AccessMode::Mutable => f.write_str("mutable"),
        }
    }
}

impl Save for AccessMode {
    fn save(&self, oa: &mut OutputArchive) {
        match self {
            AccessMode::Const => oa.variant_tag(0),
            AccessMode::Mutable => oa.variant_tag(1),
        }
    }
}

impl Load for AccessMode {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        match ia.variant_tag()? {
            0 => Ok(AccessMode::Const),
            1 => Ok(AccessMode::Mutable),
            index => Err(LoadError::UnknownVariant {
                type_name: "AccessMode",
                index,
            }),
        }
    }
}

// ── Chunk descriptions ────────────────────────────────────────────────────────

/// Files-kind chunk: a byte range of a segment file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesChunk {
    pub path: PathBuf,
    pub file_size: Size,
    pub range: Range,
}

impl_archive_struct!(FilesChunk {
    path,
    file_size,
    range,
});

/// Heap-kind chunk: an address inside the provider process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapChunk {
    /// Begin address in the provider's address space. Meaningful only to
    /// consumers sharing that address space.
    pub address: u64,
    pub size: Size,
    pub range: Range,
}

impl_archive_struct!(HeapChunk {
    address,
    size,
    range,
});

/// Shmem-kind chunk: a named POSIX shared-memory object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmemChunk {
    pub prefix: String,
    pub segment_id: SegmentId,
    pub size: Size,
    pub range: Range,
}

impl_archive_struct!(ShmemChunk {
    prefix,
    segment_id,
    size,
    range,
});

/// Foreign-kind chunk: a token minted by the loaded implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignChunk {
    pub token: u64,
    pub size: Size,
    pub range: Range,
}

impl_archive_struct!(ForeignChunk {
    token,
    size,
    range,
});

/// A chunk description, tagged by the storage kind that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkDescription {
    Files(FilesChunk),
    Heap(HeapChunk),
    Shmem(ShmemChunk),
    Foreign(ForeignChunk),
}

impl ChunkDescription {
    pub fn implementation(&self) -> Implementation {
        match self {
            ChunkDescription::Files(_) => Implementation::Files,
            ChunkDescription::Heap(_) => Implementation::Heap,
            ChunkDescription::Shmem(_) => Implementation::Shmem,
            ChunkDescription::Foreign(_) => Implementation::Foreign,
        }
    }

    pub fn range(&self) -> Range {
        match self {
            ChunkDescription::Files(c) => c.range,
            ChunkDescription::Heap(c) => c.range,
            ChunkDescription::Shmem(c) => c.range,
            ChunkDescription::Foreign(c) => c.range,
        }
    }
}

impl Save for ChunkDescription {
    fn save(&self, oa: &mut OutputArchive) {
        match self {
            ChunkDescription::Files(c) => {
                oa.variant_tag(0);
                c.save(oa);
            }
            ChunkDescription::Heap(c) => {
                oa.variant_tag(1);
                c.save(oa);
            }
            ChunkDescription::Shmem(c) => {
                oa.variant_tag(2);
                c.save(oa);
            }
            ChunkDescription::Foreign(c) => {
                oa.variant_tag(3);
                c.save(oa);
            }
        }
    }
}

impl Load for ChunkDescription {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        match ia.variant_tag()? {
            0 => Ok(ChunkDescription::Files(FilesChunk::load(ia)?)),
            1 => Ok(ChunkDescription::Heap(HeapChunk::load(ia)?)),
            2 => Ok(ChunkDescription::Shmem(ShmemChunk::load(ia)?)),
            3 => Ok(ChunkDescription::Foreign(ForeignChunk::load(ia)?)),
            index => Err(LoadError::UnknownVariant {
                type_name: "ChunkDescription",
                index,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{load_from_bytes, save_to_bytes};
    use crate::memory::Offset;

    fn descriptor() -> Storage {
        Storage {
            endpoint: "127.0.0.1:9400".parse().unwrap(),
            storage_id: StorageId(3),
            parameter: StorageParameter(vec![1, 2, 3]),
            segment_id: SegmentId(9),
            range: Range::new(Offset(0), Offset(4096)).unwrap(),
        }
    }

    #[test]
    fn storage_descriptor_round_trip() {
        let storage = descriptor();
        assert_eq!(load_from_bytes::<Storage>(&save_to_bytes(&storage)).unwrap(), storage);
    }

    #[test]
    fn with_range_narrows_only_the_range() {
        let narrowed = descriptor().with_range(Range::new(Offset(128), Offset(256)).unwrap());
        assert_eq!(narrowed.storage_id, StorageId(3));
        assert_eq!(narrowed.range, Range::new(Offset(128), Offset(256)).unwrap());
    }

    #[test]
    fn parameter_pack_unpack() {
        let blob = StorageParameter::pack(&String::from("prefix"));
        assert_eq!(blob.unpack::<String>().unwrap(), "prefix");
    }

    #[test]
    fn chunk_description_round_trip_per_kind() {
        let range = Range::new(Offset(0), Offset(100)).unwrap();
        let descriptions = [
            ChunkDescription::Files(FilesChunk {
                path: PathBuf::from("/tmp/segments/7"),
                file_size: Size(100),
                range,
            }),
            ChunkDescription::Heap(HeapChunk {
                address: 0xdead_beef,
                size: Size(100),
                range,
            }),
            ChunkDescription::Shmem(ShmemChunk {
                prefix: "/strata".into(),
                segment_id: SegmentId(7),
                size: Size(100),
                range,
            }),
            ChunkDescription::Foreign(ForeignChunk {
                token: 55,
                size: Size(100),
                range,
            }),
        ];
        for description in descriptions {
            let bytes = save_to_bytes(&description);
            assert_eq!(load_from_bytes::<ChunkDescription>(&bytes).unwrap(), description);
        }
    }

    #[test]
    fn implementation_display_parse_round_trip() {
        for implementation in [
            Implementation::Files,
            Implementation::Heap,
            Implementation::Shmem,
            Implementation::Foreign,
        ] {
            assert_eq!(
                implementation.to_string().parse::<Implementation>().unwrap(),
                implementation
            );
        }
    }
}
