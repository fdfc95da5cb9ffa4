//! Core control commands — the storage provider's command set.

use std::marker::PhantomData;
use std::path::PathBuf;

use strata_core::archive::{InputArchive, Load, LoadError, OutputArchive, Save};
use strata_core::id::{SegmentId, StorageId};
use strata_core::impl_archive_struct;
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{
    Access, ChunkDescription, Const, Implementation, Mutable, StorageParameter,
};

use strata_rpc::command::Command;
use strata_rpc::command_set;

// ── chunk.Description ─────────────────────────────────────────────────────────

/// Describe a chunk of a segment at the access mode `A`. The mode is a type
/// tag, so a mutable description is a different wire command than a const
/// one and the consumer can tell them apart.
#[derive(Debug, Clone, PartialEq)]
pub struct Describe<A: Access> {
    pub storage_id: StorageId,
    pub parameter: StorageParameter,
    pub segment_id: SegmentId,
    pub range: Range,
    pub access: PhantomData<A>,
}

impl<A: Access> Describe<A> {
    pub fn new(
        storage_id: StorageId,
        parameter: StorageParameter,
        segment_id: SegmentId,
        range: Range,
    ) -> Describe<A> {
        Describe {
            storage_id,
            parameter,
            segment_id,
            range,
            access: PhantomData,
        }
    }
}

impl<A: Access> Save for Describe<A> {
    fn save(&self, oa: &mut OutputArchive) {
        self.storage_id.save(oa);
        self.parameter.save(oa);
        self.segment_id.save(oa);
        self.range.save(oa);
    }
}

impl<A: Access> Load for Describe<A> {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(Describe {
            storage_id: StorageId::load(ia)?,
            parameter: StorageParameter::load(ia)?,
            segment_id: SegmentId::load(ia)?,
            range: Range::load(ia)?,
            access: PhantomData,
        })
    }
}

impl<A: Access> Command for Describe<A> {
    type Response = ChunkDescription;
    const NAME: &'static str = A::DESCRIBE_NAME;
}

// ── file I/O ──────────────────────────────────────────────────────────────────

/// Copy `range.len()` bytes from the external `file` at `range.begin()`
/// into the segment at `offset`. Responds with the actual count.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRead {
    pub storage_id: StorageId,
    pub parameter: StorageParameter,
    pub segment_id: SegmentId,
    pub offset: Offset,
    pub file: PathBuf,
    pub range: Range,
}

impl_archive_struct!(FileRead {
    storage_id,
    parameter,
    segment_id,
    offset,
    file,
    range,
});

impl Command for FileRead {
    type Response = Size;
    const NAME: &'static str = "file.read";
}

/// The reverse direction: segment bytes out to the external `file`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileWrite {
    pub storage_id: StorageId,
    pub parameter: StorageParameter,
    pub segment_id: SegmentId,
    pub offset: Offset,
    pub file: PathBuf,
    pub range: Range,
}

impl_archive_struct!(FileWrite {
    storage_id,
    parameter,
    segment_id,
    offset,
    file,
    range,
});

impl Command for FileWrite {
    type Response = Size;
    const NAME: &'static str = "file.write";
}

// ── segments ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCreate {
    pub storage_id: StorageId,
    pub parameter: StorageParameter,
    pub size: Size,
}

impl_archive_struct!(SegmentCreate {
    storage_id,
    parameter,
    size,
});

impl Command for SegmentCreate {
    type Response = SegmentId;
    const NAME: &'static str = "segment.create";
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRemove {
    pub storage_id: StorageId,
    pub parameter: StorageParameter,
    pub segment_id: SegmentId,
}

impl_archive_struct!(SegmentRemove {
    storage_id,
    parameter,
    segment_id,
});

impl Command for SegmentRemove {
    type Response = ();
    const NAME: &'static str = "segment.remove";
}

// ── storages ──────────────────────────────────────────────────────────────────

/// Create a storage of `implementation` from its `parameter.create` bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageCreate {
    pub implementation: Implementation,
    pub parameter: StorageParameter,
}

impl_archive_struct!(StorageCreate {
    implementation,
    parameter,
});

impl Command for StorageCreate {
    type Response = StorageId;
    const NAME: &'static str = "storage.create";
}

/// Destroy a storage; all of its segments go with it.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRemove {
    pub storage_id: StorageId,
}

impl_archive_struct!(StorageRemove { storage_id });

impl Command for StorageRemove {
    type Response = ();
    const NAME: &'static str = "storage.remove";
}

/// Both size figures of a storage in one response.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeInfo {
    pub max: MaxSize,
    pub used: Size,
}

impl_archive_struct!(SizeInfo { max, used });

#[derive(Debug, Clone, PartialEq)]
pub struct StorageSize {
    pub storage_id: StorageId,
}

impl_archive_struct!(StorageSize { storage_id });

impl Command for StorageSize {
    type Response = SizeInfo;
    const NAME: &'static str = "storage.size";
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeMax {
    pub storage_id: StorageId,
}

impl_archive_struct!(SizeMax { storage_id });

impl Command for SizeMax {
    type Response = MaxSize;
    const NAME: &'static str = "storage.size.max";
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeUsed {
    pub storage_id: StorageId,
}

impl_archive_struct!(SizeUsed { storage_id });

impl Command for SizeUsed {
    type Response = Size;
    const NAME: &'static str = "storage.size.used";
}

command_set! {
    /// The core control command set of a storage provider.
    pub enum ControlCommands {
        DescribeConst(Describe<Const>),
        DescribeMutable(Describe<Mutable>),
        FileRead(FileRead),
        FileWrite(FileWrite),
        SegmentCreate(SegmentCreate),
        SegmentRemove(SegmentRemove),
        StorageCreate(StorageCreate),
        StorageRemove(StorageRemove),
        StorageSize(StorageSize),
        SizeMax(SizeMax),
        SizeUsed(SizeUsed),
    }
}
