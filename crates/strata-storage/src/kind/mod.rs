//! The four storage kinds behind one uniform surface.
//!
//! The provider dispatches on [`StorageKind`]; the per-kind modules own
//! their resources through scoped owners so every exit path releases files,
//! mappings, shared-memory objects, page pins and library handles.

use std::path::Path;

use strata_core::id::SegmentId;
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{AccessMode, ChunkDescription, Implementation, StorageParameter};

use crate::error::StorageError;

pub mod files;
pub mod foreign;
pub mod heap;
pub mod shmem;

pub use files::FilesStorage;
pub use foreign::{clear_library_cache, ForeignStorage};
pub use heap::HeapStorage;
pub use shmem::ShmemStorage;

// ── Quota ─────────────────────────────────────────────────────────────────────

/// Byte accounting against a storage's MaxSize. Reservation happens under
/// the storage's mutex, so used never overshoots the limit.
#[derive(Debug)]
pub struct Quota {
    max: MaxSize,
    used: Size,
}

impl Quota {
    pub fn new(max: MaxSize) -> Quota {
        Quota {
            max,
            used: Size::ZERO,
        }
    }

    pub fn max(&self) -> MaxSize {
        self.max
    }

    pub fn used(&self) -> Size {
        self.used
    }

    pub fn reserve(&mut self, size: Size) -> Result<(), StorageError> {
        if !self.max.allows(self.used, size) {
            let MaxSize::Limit(limit) = self.max else {
                unreachable!("unlimited quota never rejects");
            };
            return Err(StorageError::OutOfQuota {
                used: self.used,
                requested: size,
                limit,
            });
        }
        self.used += size;
        Ok(())
    }

    pub fn release(&mut self, size: Size) {
        self.used -= size;
    }
}

/// Fail unless `[offset, offset + range.len())` lies inside a segment of
/// `segment_size` bytes.
pub(crate) fn check_coverage(
    segment_size: Size,
    offset: Offset,
    length: Size,
    requested: Range,
) -> Result<(), StorageError> {
    if offset.value() + length.value() > segment_size.value() {
        return Err(StorageError::OutOfRange {
            requested,
            segment_size,
            offset,
        });
    }
    Ok(())
}

// ── Page pinning ──────────────────────────────────────────────────────────────

/// Scoped mlock: pins on construction, munlocks on drop. Unpin failures are
/// logged, never raised.
#[derive(Debug)]
pub struct MlockGuard {
    ptr: *const libc::c_void,
    len: usize,
}

// The guard only carries an address for munlock; the mapping it pins is
// owned by the same segment struct.
unsafe impl Send for MlockGuard {}
unsafe impl Sync for MlockGuard {}

impl MlockGuard {
    pub fn pin(ptr: *const u8, len: usize) -> std::io::Result<MlockGuard> {
        let ptr = ptr as *const libc::c_void;
        if unsafe { libc::mlock(ptr, len) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(MlockGuard { ptr, len })
    }
}

impl Drop for MlockGuard {
    fn drop(&mut self) {
        if unsafe { libc::munlock(self.ptr, self.len) } != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "munlock failed"
            );
        }
    }
}

// ── Uniform dispatch ──────────────────────────────────────────────────────────

/// A storage of any kind. The provider holds one per storage id and calls
/// through this enum; the methods of all kinds share one shape.
#[derive(Debug)]
pub enum StorageKind {
    Files(FilesStorage),
    Heap(HeapStorage),
    Shmem(ShmemStorage),
    Foreign(ForeignStorage),
}

macro_rules! for_each_kind {
    ($self:ident, $storage:ident => $body:expr) => {
        match $self {
            StorageKind::Files($storage) => $body,
            StorageKind::Heap($storage) => $body,
            StorageKind::Shmem($storage) => $body,
            StorageKind::Foreign($storage) => $body,
        }
    };
}

impl StorageKind {
    pub fn implementation(&self) -> Implementation {
        match self {
            StorageKind::Files(_) => Implementation::Files,
            StorageKind::Heap(_) => Implementation::Heap,
            StorageKind::Shmem(_) => Implementation::Shmem,
            StorageKind::Foreign(_) => Implementation::Foreign,
        }
    }

    pub fn max_size(&self) -> MaxSize {
        for_each_kind!(self, storage => storage.max_size())
    }

    pub fn used_size(&self) -> Size {
        for_each_kind!(self, storage => storage.used_size())
    }

    pub fn segment_create(
        &mut self,
        size: Size,
        parameter: &StorageParameter,
    ) -> Result<SegmentId, StorageError> {
        for_each_kind!(self, storage => storage.segment_create(size, parameter))
    }

    pub fn segment_remove(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        for_each_kind!(self, storage => storage.segment_remove(segment_id))
    }

    pub fn segment_size(&self, segment_id: SegmentId) -> Result<Size, StorageError> {
        for_each_kind!(self, storage => storage.segment_size(segment_id))
    }

    pub fn chunk_description(
        &mut self,
        segment_id: SegmentId,
        access: AccessMode,
        range: Range,
    ) -> Result<ChunkDescription, StorageError> {
        for_each_kind!(self, storage => storage.chunk_description(segment_id, access, range))
    }

    /// Release one outstanding chunk reference. A no-op for kinds that do
    /// not track references.
    pub fn chunk_release(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        for_each_kind!(self, storage => storage.chunk_release(segment_id))
    }

    pub fn file_read(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        for_each_kind!(self, storage => storage.file_read(segment_id, offset, file, range))
    }

    pub fn file_write(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        for_each_kind!(self, storage => storage.file_write(segment_id, offset, file, range))
    }

    pub fn read_bytes(
        &self,
        segment_id: SegmentId,
        offset: Offset,
        size: Size,
    ) -> Result<Vec<u8>, StorageError> {
        for_each_kind!(self, storage => storage.read_bytes(segment_id, offset, size))
    }

    pub fn write_bytes(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        bytes: &[u8],
    ) -> Result<Size, StorageError> {
        for_each_kind!(self, storage => storage.write_bytes(segment_id, offset, bytes))
    }

    /// Remove every remaining segment. Storage destruction ignores busy
    /// references; file segments still honor their on-remove policy.
    pub fn destroy(&mut self) {
        for_each_kind!(self, storage => storage.destroy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_reserve_and_release() {
        let mut quota = Quota::new(MaxSize::Limit(Size(100)));
        quota.reserve(Size(60)).unwrap();
        quota.reserve(Size(40)).unwrap();
        assert_eq!(quota.used(), Size(100));

        let err = quota.reserve(Size(1)).unwrap_err();
        assert!(matches!(err, StorageError::OutOfQuota { .. }));

        quota.release(Size(50));
        assert_eq!(quota.used(), Size(50));
        quota.reserve(Size(50)).unwrap();
    }

    #[test]
    fn unlimited_quota_never_rejects() {
        let mut quota = Quota::new(MaxSize::Unlimited);
        quota.reserve(Size(u64::MAX / 2)).unwrap();
        quota.reserve(Size(u64::MAX / 2)).unwrap();
    }

    #[test]
    fn coverage_check() {
        let range = Range::new(Offset(0), Offset(10)).unwrap();
        assert!(check_coverage(Size(100), Offset(90), Size(10), range).is_ok());
        assert!(check_coverage(Size(100), Offset(91), Size(10), range).is_err());
    }
}
