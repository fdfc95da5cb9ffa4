//! Files storage kind — persistent segments as plain files under a prefix
//! directory.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use strata_core::id::SegmentId;
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{AccessMode, ChunkDescription, FilesChunk, StorageParameter};

use crate::error::StorageError;
use crate::fileio::copy_range;
use crate::kind::{check_coverage, Quota};
use crate::parameter::{FilesCreate, FilesSegmentCreate, OnRemove};

#[derive(Debug)]
struct FileSegment {
    path: PathBuf,
    size: Size,
    on_remove: OnRemove,
}

/// On-disk storage. Segment files live at `<prefix>/segment-<id>`;
/// `OnRemove::Keep` leaves the file behind when its segment goes away.
#[derive(Debug)]
pub struct FilesStorage {
    prefix: PathBuf,
    quota: Quota,
    next_segment: SegmentId,
    segments: HashMap<SegmentId, FileSegment>,
}

impl FilesStorage {
    pub fn create(bundle: FilesCreate) -> Result<FilesStorage, StorageError> {
        std::fs::create_dir_all(&bundle.prefix)
            .map_err(|e| StorageError::io(&bundle.prefix, e))?;
        Ok(FilesStorage {
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

    fn segment_path(&self, segment_id: SegmentId) -> PathBuf {
        self.prefix.join(format!("segment-{segment_id}"))
    }

    fn segment(&self, segment_id: SegmentId) -> Result<&FileSegment, StorageError> {
        self.segments
            .get(&segment_id)
            .ok_or(StorageError::SegmentGone { segment_id })
    }

    pub fn segment_create(
        &mut self,
        size: Size,
        parameter: &StorageParameter,
    ) -> Result<SegmentId, StorageError> {
        let bundle: FilesSegmentCreate = parameter.unpack()?;
        self.quota.reserve(size)?;

        let segment_id = self.next_segment;
        let path = self.segment_path(segment_id);
        let result = (|| {
            if path.exists() {
                return Err(StorageError::PathAlreadyExists(path.clone()));
            }
            let file = File::create(&path).map_err(|e| StorageError::io(&path, e))?;
            file.set_len(size.value())
                .map_err(|e| StorageError::io(&path, e))?;
            Ok(())
        })();
        if let Err(e) = result {
            self.quota.release(size);
            return Err(e);
        }

        self.next_segment = self.next_segment.next();
        self.segments.insert(
            segment_id,
            FileSegment {
                path,
                size,
                on_remove: bundle.on_remove,
            },
        );
        Ok(segment_id)
    }

    pub fn segment_remove(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        let segment = self
            .segments
            .remove(&segment_id)
            .ok_or(StorageError::SegmentGone { segment_id })?;
        self.quota.release(segment.size);
        if segment.on_remove == OnRemove::Remove {
            if let Err(e) = std::fs::remove_file(&segment.path) {
                tracing::warn!(path = %segment.path.display(), error = %e, "segment file removal failed");
            }
        }
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
        let segment = self.segment(segment_id)?;
        check_coverage(segment.size, range.begin(), range.len(), range)?;
        Ok(ChunkDescription::Files(FilesChunk {
            path: segment.path.clone(),
            file_size: segment.size,
            range,
        }))
    }

    // Files does not track chunk references; removal is always immediate.
    pub fn chunk_release(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        self.segment(segment_id).map(|_| ())
    }

    /// Copy `range.len()` bytes from the external `file` at `range.begin()`
    /// into the segment at `offset`. Returns the actual count, which may be
    /// short when the external file ends early.
    pub fn file_read(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        let segment = self.segment(segment_id)?;
        check_coverage(segment.size, offset, range.len(), range)?;
        if !file.exists() {
            return Err(StorageError::PathDoesNotExist(file.to_owned()));
        }

        let external = File::open(file).map_err(|e| StorageError::io(file, e))?;
        let segment_file = File::options()
            .write(true)
            .open(&segment.path)
            .map_err(|e| StorageError::io(&segment.path, e))?;
        let copied = copy_range(
            &external,
            range.begin().value() as i64,
            &segment_file,
            offset.value() as i64,
            range.len().value(),
        )
        .map_err(|e| StorageError::io(&segment.path, e))?;
        Ok(Size(copied))
    }

    /// The reverse of [`Self::file_read`]: segment bytes out to `file`.
    pub fn file_write(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        let segment = self.segment(segment_id)?;
        check_coverage(segment.size, offset, range.len(), range)?;

        let segment_file =
            File::open(&segment.path).map_err(|e| StorageError::io(&segment.path, e))?;
        let external = File::options()
            .create(true)
            .write(true)
            .open(file)
            .map_err(|e| StorageError::io(file, e))?;
        let copied = copy_range(
            &segment_file,
            offset.value() as i64,
            &external,
            range.begin().value() as i64,
            range.len().value(),
        )
        .map_err(|e| StorageError::io(file, e))?;
        Ok(Size(copied))
    }

    pub fn read_bytes(
        &self,
        segment_id: SegmentId,
        offset: Offset,
        size: Size,
    ) -> Result<Vec<u8>, StorageError> {
        let segment = self.segment(segment_id)?;
        let available = segment
            .size
            .value()
            .saturating_sub(offset.value())
            .min(size.value());
        let file = File::open(&segment.path).map_err(|e| StorageError::io(&segment.path, e))?;
        let mut bytes = vec![0u8; available as usize];
        file.read_exact_at(&mut bytes, offset.value())
            .map_err(|e| StorageError::io(&segment.path, e))?;
        Ok(bytes)
    }

    pub fn write_bytes(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        bytes: &[u8],
    ) -> Result<Size, StorageError> {
        let segment = self.segment(segment_id)?;
        let range = Range::with_size(Size(bytes.len() as u64));
        check_coverage(segment.size, offset, Size(bytes.len() as u64), range)?;
        let file = File::options()
            .write(true)
            .open(&segment.path)
            .map_err(|e| StorageError::io(&segment.path, e))?;
        file.write_all_at(bytes, offset.value())
            .map_err(|e| StorageError::io(&segment.path, e))?;
        Ok(Size(bytes.len() as u64))
    }

    pub fn destroy(&mut self) {
        let segment_ids: Vec<SegmentId> = self.segments.keys().copied().collect();
        for segment_id in segment_ids {
            let _ = self.segment_remove(segment_id);
        }
    }
}
