//! Shmem storage kind — POSIX shared memory under a name prefix.
//!
//! Segments are `shm_open`ed as `<prefix>-<segment-id>`, sized with
//! ftruncate and mapped. Peer processes reach the same bytes by name; the
//! chunk description carries prefix and segment id, nothing process-local.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use strata_core::id::SegmentId;
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{AccessMode, ChunkDescription, ShmemChunk, StorageParameter};

use crate::error::StorageError;
use crate::kind::{check_coverage, MlockGuard, Quota};
use crate::parameter::{ShmemCreate, ShmemSegmentCreate};

// ── Scoped shared-memory object ───────────────────────────────────────────────

/// Owner of one shm object: unlinked on drop, fd closed by `File`.
#[derive(Debug)]
struct ShmObject {
    name: CString,
    file: File,
}

impl ShmObject {
    fn create(name: &str, size: u64) -> io::Result<ShmObject> {
        let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size)?;
        Ok(ShmObject { name: cname, file })
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        if unsafe { libc::shm_unlink(self.name.as_ptr()) } != 0 {
            tracing::warn!(
                name = ?self.name,
                error = %io::Error::last_os_error(),
                "shm_unlink failed"
            );
        }
    }
}

// ── Mapping modes ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum ShmemMap {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

impl ShmemMap {
    fn as_slice(&self) -> &[u8] {
        match self {
            ShmemMap::ReadWrite(map) => map,
            ShmemMap::ReadOnly(map) => map,
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            ShmemMap::ReadWrite(map) => Some(map),
            ShmemMap::ReadOnly(_) => None,
        }
    }
}

#[derive(Debug)]
struct ShmemSegment {
    // Drop order: unpin pages, unmap, then unlink the object.
    mlock: Option<MlockGuard>,
    map: ShmemMap,
    shm: ShmObject,
    size: Size,
    references: usize,
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// POSIX shared-memory storage. Like Heap, outstanding chunk descriptions
/// make a segment busy.
#[derive(Debug)]
pub struct ShmemStorage {
    prefix: String,
    quota: Quota,
    next_segment: SegmentId,
    segments: HashMap<SegmentId, ShmemSegment>,
}

impl ShmemStorage {
    pub fn create(bundle: ShmemCreate) -> Result<ShmemStorage, StorageError> {
        Ok(ShmemStorage {
            prefix: bundle.prefix,
            quota: Quota::new(bundle.max_size),
            next_segment: SegmentId::default(),
            segments: HashMap::new(),
        })
    }

    pub fn max_size(&self) -> MaxSize {
        self.quota.max()
    }

    pub fn used_size(&self) -> Size {
        self.quota.used()
    }

    fn object_name(&self, segment_id: SegmentId) -> String {
        format!("{}-{segment_id}", self.prefix)
    }

    fn segment(&self, segment_id: SegmentId) -> Result<&ShmemSegment, StorageError> {
        self.segments
            .get(&segment_id)
            .ok_or(StorageError::SegmentGone { segment_id })
    }

    fn segment_mut(&mut self, segment_id: SegmentId) -> Result<&mut ShmemSegment, StorageError> {
        self.segments
            .get_mut(&segment_id)
            .ok_or(StorageError::SegmentGone { segment_id })
    }

    pub fn segment_create(
        &mut self,
        size: Size,
        parameter: &StorageParameter,
    ) -> Result<SegmentId, StorageError> {
        let bundle: ShmemSegmentCreate = parameter.unpack()?;
        self.quota.reserve(size)?;

        let segment_id = self.next_segment;
        let name = self.object_name(segment_id);
        let built = (|| -> Result<ShmemSegment, StorageError> {
            let shm = ShmObject::create(&name, size.value())
                .map_err(|e| StorageError::io(&name, e))?;
            let map = if bundle.read_only {
                // Safety: the object was just created and sized; nothing else
                // maps it writable through this storage.
                let map = unsafe { Mmap::map(&shm.file) }
                    .map_err(|e| StorageError::io(&name, e))?;
                ShmemMap::ReadOnly(map)
            } else {
                let map = unsafe { MmapMut::map_mut(&shm.file) }
                    .map_err(|e| StorageError::io(&name, e))?;
                ShmemMap::ReadWrite(map)
            };
            let mlock = if bundle.mlock {
                let slice = map.as_slice();
                Some(
                    MlockGuard::pin(slice.as_ptr(), slice.len())
                        .map_err(|e| StorageError::io(&name, e))?,
                )
            } else {
                None
            };
            Ok(ShmemSegment {
                mlock,
                map,
                shm,
                size,
                references: 0,
            })
        })();

        match built {
            Ok(segment) => {
                self.next_segment = self.next_segment.next();
                self.segments.insert(segment_id, segment);
                Ok(segment_id)
            }
            Err(e) => {
                self.quota.release(size);
                Err(e)
            }
        }
    }

    pub fn segment_remove(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        let references = self.segment(segment_id)?.references;
        if references > 0 {
            return Err(StorageError::SegmentBusy {
                segment_id,
                references,
            });
        }
        let segment = self
            .segments
            .remove(&segment_id)
            .expect("presence checked above");
        self.quota.release(segment.size);
        Ok(())
    }

    pub fn segment_size(&self, segment_id: SegmentId) -> Result<Size, StorageError> {
        Ok(self.segment(segment_id)?.size)
    }

    pub fn chunk_description(
        &mut self,
        segment_id: SegmentId,
        _access: AccessMode,
        range: Range,
    ) -> Result<ChunkDescription, StorageError> {
        let prefix = self.prefix.clone();
        let segment = self.segment_mut(segment_id)?;
        check_coverage(segment.size, range.begin(), range.len(), range)?;
        segment.references += 1;
        Ok(ChunkDescription::Shmem(ShmemChunk {
            prefix,
            segment_id,
            size: segment.size,
            range,
        }))
    }

    pub fn chunk_release(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        let segment = self.segment_mut(segment_id)?;
        segment.references = segment.references.saturating_sub(1);
        Ok(())
    }

    pub fn file_read(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        let segment = self.segment_mut(segment_id)?;
        check_coverage(segment.size, offset, range.len(), range)?;
        if !file.exists() {
            return Err(StorageError::PathDoesNotExist(file.to_owned()));
        }
        let Some(slice) = segment.map.as_mut_slice() else {
            return Err(StorageError::ReadOnlySegment { segment_id });
        };

        use std::os::unix::fs::FileExt;
        let external = File::open(file).map_err(|e| StorageError::io(file, e))?;
        let begin = offset.value() as usize;
        let end = begin + range.len().value() as usize;
        let read = external
            .read_at(&mut slice[begin..end], range.begin().value())
            .map_err(|e| StorageError::io(file, e))?;
        Ok(Size(read as u64))
    }

    pub fn file_write(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        let segment = self.segment(segment_id)?;
        check_coverage(segment.size, offset, range.len(), range)?;

        use std::os::unix::fs::FileExt;
        let external = File::options()
            .create(true)
            .write(true)
            .open(file)
            .map_err(|e| StorageError::io(file, e))?;
        let begin = offset.value() as usize;
        let end = begin + range.len().value() as usize;
        external
            .write_all_at(&segment.map.as_slice()[begin..end], range.begin().value())
            .map_err(|e| StorageError::io(file, e))?;
        Ok(range.len())
    }

    pub fn read_bytes(
        &self,
        segment_id: SegmentId,
        offset: Offset,
        size: Size,
    ) -> Result<Vec<u8>, StorageError> {
        let segment = self.segment(segment_id)?;
        let slice = segment.map.as_slice();
        let begin = offset.value().min(segment.size.value()) as usize;
        let end = (offset.value() + size.value()).min(segment.size.value()) as usize;
        Ok(slice[begin..end].to_vec())
    }

    pub fn write_bytes(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        bytes: &[u8],
    ) -> Result<Size, StorageError> {
        let segment = self.segment_mut(segment_id)?;
        let length = Size(bytes.len() as u64);
        check_coverage(segment.size, offset, length, Range::with_size(length))?;
        let Some(slice) = segment.map.as_mut_slice() else {
            return Err(StorageError::ReadOnlySegment { segment_id });
        };
        let begin = offset.value() as usize;
        slice[begin..begin + bytes.len()].copy_from_slice(bytes);
        Ok(length)
    }

    pub fn destroy(&mut self) {
        for (_, segment) in self.segments.drain() {
            self.quota.release(segment.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn storage(max_size: MaxSize) -> ShmemStorage {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        ShmemStorage::create(ShmemCreate {
            prefix: format!("/strata-shmem-test-{}-{}", std::process::id(), id),
            max_size,
        })
        .unwrap()
    }

    fn plain_segment_param() -> StorageParameter {
        StorageParameter::pack(&ShmemSegmentCreate::default())
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut shmem = storage(MaxSize::Unlimited);
        let segment_id = shmem
            .segment_create(Size(128), &plain_segment_param())
            .unwrap();
        shmem
            .write_bytes(segment_id, Offset(32), b"shared bytes")
            .unwrap();
        let bytes = shmem.read_bytes(segment_id, Offset(32), Size(12)).unwrap();
        assert_eq!(&bytes, b"shared bytes");
    }

    #[test]
    fn read_only_segment_rejects_writes() {
        let mut shmem = storage(MaxSize::Unlimited);
        let parameter = StorageParameter::pack(&ShmemSegmentCreate {
            mlock: false,
            read_only: true,
        });
        let segment_id = shmem.segment_create(Size(16), &parameter).unwrap();
        let err = shmem
            .write_bytes(segment_id, Offset(0), b"nope")
            .unwrap_err();
        assert!(matches!(err, StorageError::ReadOnlySegment { .. }));
    }

    #[test]
    fn description_names_the_object() {
        let mut shmem = storage(MaxSize::Unlimited);
        let segment_id = shmem
            .segment_create(Size(64), &plain_segment_param())
            .unwrap();
        let description = shmem
            .chunk_description(segment_id, AccessMode::Const, Range::with_size(Size(64)))
            .unwrap();
        let ChunkDescription::Shmem(chunk) = description else {
            panic!("shmem storage must yield shmem chunks");
        };
        assert_eq!(chunk.segment_id, segment_id);
        assert!(chunk.prefix.starts_with("/strata-shmem-test-"));
        shmem.chunk_release(segment_id).unwrap();
    }

    #[test]
    fn busy_segment_refuses_removal() {
        let mut shmem = storage(MaxSize::Unlimited);
        let segment_id = shmem
            .segment_create(Size(16), &plain_segment_param())
            .unwrap();
        shmem
            .chunk_description(segment_id, AccessMode::Mutable, Range::with_size(Size(16)))
            .unwrap();
        assert!(matches!(
            shmem.segment_remove(segment_id).unwrap_err(),
            StorageError::SegmentBusy { .. }
        ));
        shmem.chunk_release(segment_id).unwrap();
        shmem.segment_remove(segment_id).unwrap();
    }

    #[test]
    fn quota_is_enforced() {
        let mut shmem = storage(MaxSize::Limit(Size(64)));
        shmem
            .segment_create(Size(64), &plain_segment_param())
            .unwrap();
        assert!(matches!(
            shmem
                .segment_create(Size(1), &plain_segment_param())
                .unwrap_err(),
            StorageError::OutOfQuota { .. }
        ));
    }
}
