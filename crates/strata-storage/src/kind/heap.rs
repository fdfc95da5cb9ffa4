//! Heap storage kind — anonymous in-process memory, optionally page-pinned.

use std::collections::HashMap;
use std::path::Path;

use memmap2::MmapMut;

use strata_core::id::SegmentId;
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{AccessMode, ChunkDescription, HeapChunk, StorageParameter};

use crate::error::StorageError;
use crate::kind::{check_coverage, MlockGuard, Quota};
use crate::parameter::{HeapCreate, HeapSegmentCreate};

#[derive(Debug)]
struct HeapSegment {
    // Field order matters: the pin must be released before its mapping.
    mlock: Option<MlockGuard>,
    map: MmapMut,
    size: Size,
    references: usize,
}

/// In-process anonymous memory. Chunk descriptions carry the mapping's
/// begin address; they are only meaningful to consumers in the same address
/// space. Outstanding descriptions make a segment busy.
#[derive(Debug)]
pub struct HeapStorage {
    quota: Quota,
    next_segment: SegmentId,
    segments: HashMap<SegmentId, HeapSegment>,
}

impl HeapStorage {
    pub fn create(bundle: HeapCreate) -> Result<HeapStorage, StorageError> {
        Ok(HeapStorage {
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

    fn segment(&self, segment_id: SegmentId) -> Result<&HeapSegment, StorageError> {
        self.segments
            .get(&segment_id)
            .ok_or(StorageError::SegmentGone { segment_id })
    }

    fn segment_mut(&mut self, segment_id: SegmentId) -> Result<&mut HeapSegment, StorageError> {
        self.segments
            .get_mut(&segment_id)
            .ok_or(StorageError::SegmentGone { segment_id })
    }

    pub fn segment_create(
        &mut self,
        size: Size,
        parameter: &StorageParameter,
    ) -> Result<SegmentId, StorageError> {
        let bundle: HeapSegmentCreate = parameter.unpack()?;
        self.quota.reserve(size)?;

        let map = match MmapMut::map_anon(size.value() as usize) {
            Ok(map) => map,
            Err(e) => {
                self.quota.release(size);
                return Err(StorageError::io("<anonymous mapping>", e));
            }
        };
        let mlock = if bundle.mlock {
            match MlockGuard::pin(map.as_ptr(), map.len()) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    self.quota.release(size);
                    return Err(StorageError::io("<mlock>", e));
                }
            }
        } else {
            None
        };

        let segment_id = self.next_segment;
        self.next_segment = self.next_segment.next();
        self.segments.insert(
            segment_id,
            HeapSegment {
                mlock,
                map,
                size,
                references: 0,
            },
        );
        Ok(segment_id)
    }

    /// Removal is refused while chunk descriptions are outstanding.
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
        let segment = self.segment_mut(segment_id)?;
        check_coverage(segment.size, range.begin(), range.len(), range)?;
        segment.references += 1;
        Ok(ChunkDescription::Heap(HeapChunk {
            address: segment.map.as_ptr() as u64,
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

        use std::os::unix::fs::FileExt;
        let external = std::fs::File::open(file).map_err(|e| StorageError::io(file, e))?;
        let begin = offset.value() as usize;
        let end = begin + range.len().value() as usize;
        let read = external
            .read_at(&mut segment.map[begin..end], range.begin().value())
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
        let external = std::fs::File::options()
            .create(true)
            .write(true)
            .open(file)
            .map_err(|e| StorageError::io(file, e))?;
        let begin = offset.value() as usize;
        let end = begin + range.len().value() as usize;
        external
            .write_all_at(&segment.map[begin..end], range.begin().value())
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
        let begin = offset.value().min(segment.size.value()) as usize;
        let end = (offset.value() + size.value()).min(segment.size.value()) as usize;
        Ok(segment.map[begin..end].to_vec())
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
        let begin = offset.value() as usize;
        segment.map[begin..begin + bytes.len()].copy_from_slice(bytes);
        Ok(length)
    }

    /// Storage destruction drops every segment, busy or not.
    pub fn destroy(&mut self) {
        for (_, segment) in self.segments.drain() {
            self.quota.release(segment.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(max_size: MaxSize) -> HeapStorage {
        HeapStorage::create(HeapCreate { max_size }).unwrap()
    }

    fn plain_segment_param() -> StorageParameter {
        StorageParameter::pack(&HeapSegmentCreate::default())
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut heap = storage(MaxSize::Unlimited);
        let segment_id = heap.segment_create(Size(64), &plain_segment_param()).unwrap();
        heap.write_bytes(segment_id, Offset(10), b"heap bytes").unwrap();
        let bytes = heap.read_bytes(segment_id, Offset(10), Size(10)).unwrap();
        assert_eq!(&bytes, b"heap bytes");
    }

    #[test]
    fn quota_is_enforced() {
        let mut heap = storage(MaxSize::Limit(Size(128)));
        heap.segment_create(Size(100), &plain_segment_param()).unwrap();
        let err = heap
            .segment_create(Size(29), &plain_segment_param())
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfQuota { .. }));
    }

    #[test]
    fn outstanding_description_makes_segment_busy() {
        let mut heap = storage(MaxSize::Unlimited);
        let segment_id = heap.segment_create(Size(32), &plain_segment_param()).unwrap();
        heap.chunk_description(segment_id, AccessMode::Const, Range::with_size(Size(32)))
            .unwrap();

        let err = heap.segment_remove(segment_id).unwrap_err();
        assert!(matches!(
            err,
            StorageError::SegmentBusy { references: 1, .. }
        ));

        heap.chunk_release(segment_id).unwrap();
        heap.segment_remove(segment_id).unwrap();
    }

    #[test]
    fn description_address_points_into_the_segment() {
        let mut heap = storage(MaxSize::Unlimited);
        let segment_id = heap.segment_create(Size(16), &plain_segment_param()).unwrap();
        heap.write_bytes(segment_id, Offset(0), b"x").unwrap();
        let description = heap
            .chunk_description(segment_id, AccessMode::Const, Range::with_size(Size(16)))
            .unwrap();
        let ChunkDescription::Heap(chunk) = description else {
            panic!("heap storage must yield heap chunks");
        };
        assert_ne!(chunk.address, 0);
        assert_eq!(chunk.size, Size(16));
        heap.chunk_release(segment_id).unwrap();
    }

    #[test]
    fn stale_segment_fails_with_gone() {
        let mut heap = storage(MaxSize::Unlimited);
        let segment_id = heap.segment_create(Size(16), &plain_segment_param()).unwrap();
        heap.segment_remove(segment_id).unwrap();
        let err = heap.read_bytes(segment_id, Offset(0), Size(1)).unwrap_err();
        assert!(matches!(err, StorageError::SegmentGone { .. }));
    }
}
