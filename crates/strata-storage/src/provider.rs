//! The storage provider — a table of storages, the control-command
//! handlers, quota under the per-storage mutex, and the trace pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use strata_core::id::{SegmentId, StorageId};
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{
    Access, AccessMode, Address, ChunkDescription, Implementation, StorageParameter,
};
use strata_rpc::bulk::BulkStore;
use strata_rpc::server::{Handle, HandlerFailure};

use crate::commands::{
    Describe, FileRead, FileWrite, SegmentCreate, SegmentRemove, SizeInfo, SizeMax, SizeUsed,
    StorageCreate, StorageRemove, StorageSize,
};
use crate::error::StorageError;
use crate::kind::{FilesStorage, ForeignStorage, HeapStorage, ShmemStorage, StorageKind};
use crate::trace::{Event, Tracer};

/// Owns `StorageID → storage` and dispatches every control command to the
/// matching storage's method. Each storage sits behind its own mutex, so
/// `size.used` and the quota check cannot race and over-commit.
pub struct StorageProvider {
    storages: DashMap<StorageId, Mutex<StorageKind>>,
    next_storage_id: AtomicU64,
    tracer: Arc<dyn Tracer>,
}

impl StorageProvider {
    pub fn new(tracer: Arc<dyn Tracer>) -> StorageProvider {
        StorageProvider {
            storages: DashMap::new(),
            next_storage_id: AtomicU64::new(0),
            tracer,
        }
    }

    fn trace(&self, event: Event) {
        self.tracer.record(&event);
    }

    /// Run `operation` on the storage behind its mutex.
    fn with_storage<R>(
        &self,
        storage_id: StorageId,
        operation: impl FnOnce(&mut StorageKind) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let entry = self
            .storages
            .get(&storage_id)
            .ok_or(StorageError::UnknownStorage(storage_id))?;
        let mut storage = entry.lock().unwrap();
        operation(&mut storage)
    }

    pub fn storage_create(
        &self,
        implementation: Implementation,
        parameter: &StorageParameter,
    ) -> Result<StorageId, StorageError> {
        let kind = match implementation {
            Implementation::Files => StorageKind::Files(FilesStorage::create(parameter.unpack()?)?),
            Implementation::Heap => StorageKind::Heap(HeapStorage::create(parameter.unpack()?)?),
            Implementation::Shmem => StorageKind::Shmem(ShmemStorage::create(parameter.unpack()?)?),
            Implementation::Foreign => {
                StorageKind::Foreign(ForeignStorage::create(parameter.unpack()?)?)
            }
        };

        let storage_id = StorageId(self.next_storage_id.fetch_add(1, Ordering::Relaxed));
        self.storages.insert(storage_id, Mutex::new(kind));
        self.trace(Event::Create {
            storage_id,
            implementation,
        });
        tracing::info!(%storage_id, %implementation, "storage created");
        Ok(storage_id)
    }

    /// Destroying a storage removes all of its segments.
    pub fn storage_remove(&self, storage_id: StorageId) -> Result<(), StorageError> {
        let (_, storage) = self
            .storages
            .remove(&storage_id)
            .ok_or(StorageError::UnknownStorage(storage_id))?;
        storage.lock().unwrap().destroy();
        self.trace(Event::Destruct { storage_id });
        tracing::info!(%storage_id, "storage removed");
        Ok(())
    }

    pub fn segment_create(
        &self,
        storage_id: StorageId,
        parameter: &StorageParameter,
        size: Size,
    ) -> Result<SegmentId, StorageError> {
        self.trace(Event::SegmentCreate { storage_id, size });
        let segment_id =
            self.with_storage(storage_id, |storage| storage.segment_create(size, parameter))?;
        self.trace(Event::SegmentCreateResult {
            storage_id,
            segment_id,
        });
        Ok(segment_id)
    }

    pub fn segment_remove(
        &self,
        storage_id: StorageId,
        segment_id: SegmentId,
    ) -> Result<(), StorageError> {
        self.trace(Event::SegmentRemove {
            storage_id,
            segment_id,
        });
        self.with_storage(storage_id, |storage| storage.segment_remove(segment_id))?;
        self.trace(Event::SegmentRemoveResult {
            storage_id,
            segment_id,
        });
        Ok(())
    }

    pub fn chunk_description(
        &self,
        storage_id: StorageId,
        segment_id: SegmentId,
        access: AccessMode,
        range: Range,
    ) -> Result<ChunkDescription, StorageError> {
        self.trace(Event::ChunkDescription {
            storage_id,
            segment_id,
            access,
            range,
        });
        let description = self.with_storage(storage_id, |storage| {
            storage.chunk_description(segment_id, access, range)
        })?;
        self.trace(Event::ChunkDescriptionResult {
            storage_id,
            segment_id,
        });
        Ok(description)
    }

    /// Release one chunk reference, for in-process consumers that attached
    /// through the share service. Not a wire command.
    pub fn chunk_release(
        &self,
        storage_id: StorageId,
        segment_id: SegmentId,
    ) -> Result<(), StorageError> {
        self.with_storage(storage_id, |storage| storage.chunk_release(segment_id))
    }

    pub fn file_read(
        &self,
        storage_id: StorageId,
        segment_id: SegmentId,
        offset: Offset,
        file: &std::path::Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        self.trace(Event::FileRead {
            storage_id,
            segment_id,
            offset,
            file: file.to_owned(),
            range,
        });
        let transferred = self.with_storage(storage_id, |storage| {
            storage.file_read(segment_id, offset, file, range)
        })?;
        self.trace(Event::FileReadResult {
            storage_id,
            segment_id,
            transferred,
        });
        Ok(transferred)
    }

    pub fn file_write(
        &self,
        storage_id: StorageId,
        segment_id: SegmentId,
        offset: Offset,
        file: &std::path::Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        self.trace(Event::FileWrite {
            storage_id,
            segment_id,
            offset,
            file: file.to_owned(),
            range,
        });
        let transferred = self.with_storage(storage_id, |storage| {
            storage.file_write(segment_id, offset, file, range)
        })?;
        self.trace(Event::FileWriteResult {
            storage_id,
            segment_id,
            transferred,
        });
        Ok(transferred)
    }

    pub fn size_max(&self, storage_id: StorageId) -> Result<MaxSize, StorageError> {
        self.trace(Event::SizeMax { storage_id });
        let max = self.with_storage(storage_id, |storage| Ok(storage.max_size()))?;
        self.trace(Event::SizeMaxResult { storage_id, max });
        Ok(max)
    }

    pub fn size_used(&self, storage_id: StorageId) -> Result<Size, StorageError> {
        self.trace(Event::SizeUsed { storage_id });
        let used = self.with_storage(storage_id, |storage| Ok(storage.used_size()))?;
        self.trace(Event::SizeUsedResult { storage_id, used });
        Ok(used)
    }

    pub fn segment_size(
        &self,
        storage_id: StorageId,
        segment_id: SegmentId,
    ) -> Result<Size, StorageError> {
        self.with_storage(storage_id, |storage| storage.segment_size(segment_id))
    }
}

impl Drop for StorageProvider {
    fn drop(&mut self) {
        // Resource-release path: destroy everything, swallow nothing fatal.
        for entry in self.storages.iter() {
            entry.value().lock().unwrap().destroy();
        }
    }
}

// ── Control command handlers ──────────────────────────────────────────────────

impl<A: Access> Handle<Describe<A>> for StorageProvider {
    async fn handle(&self, command: Describe<A>) -> Result<ChunkDescription, HandlerFailure> {
        self.chunk_description(
            command.storage_id,
            command.segment_id,
            A::MODE,
            command.range,
        )
        .map_err(HandlerFailure::of)
    }
}

impl Handle<FileRead> for StorageProvider {
    async fn handle(&self, command: FileRead) -> Result<Size, HandlerFailure> {
        // File copies may block; run them off the I/O loop.
        tokio::task::block_in_place(|| {
            self.file_read(
                command.storage_id,
                command.segment_id,
                command.offset,
                &command.file,
                command.range,
            )
        })
        .map_err(HandlerFailure::of)
    }
}

impl Handle<FileWrite> for StorageProvider {
    async fn handle(&self, command: FileWrite) -> Result<Size, HandlerFailure> {
        tokio::task::block_in_place(|| {
            self.file_write(
                command.storage_id,
                command.segment_id,
                command.offset,
                &command.file,
                command.range,
            )
        })
        .map_err(HandlerFailure::of)
    }
}

impl Handle<SegmentCreate> for StorageProvider {
    async fn handle(&self, command: SegmentCreate) -> Result<SegmentId, HandlerFailure> {
        self.segment_create(command.storage_id, &command.parameter, command.size)
            .map_err(HandlerFailure::of)
    }
}

impl Handle<SegmentRemove> for StorageProvider {
    async fn handle(&self, command: SegmentRemove) -> Result<(), HandlerFailure> {
        self.segment_remove(command.storage_id, command.segment_id)
            .map_err(HandlerFailure::of)
    }
}

impl Handle<StorageCreate> for StorageProvider {
    async fn handle(&self, command: StorageCreate) -> Result<StorageId, HandlerFailure> {
        self.storage_create(command.implementation, &command.parameter)
            .map_err(HandlerFailure::of)
    }
}

impl Handle<StorageRemove> for StorageProvider {
    async fn handle(&self, command: StorageRemove) -> Result<(), HandlerFailure> {
        self.storage_remove(command.storage_id)
            .map_err(HandlerFailure::of)
    }
}

impl Handle<StorageSize> for StorageProvider {
    async fn handle(&self, command: StorageSize) -> Result<SizeInfo, HandlerFailure> {
        let max = self
            .size_max(command.storage_id)
            .map_err(HandlerFailure::of)?;
        let used = self
            .size_used(command.storage_id)
            .map_err(HandlerFailure::of)?;
        Ok(SizeInfo { max, used })
    }
}

impl Handle<SizeMax> for StorageProvider {
    async fn handle(&self, command: SizeMax) -> Result<MaxSize, HandlerFailure> {
        self.size_max(command.storage_id).map_err(HandlerFailure::of)
    }
}

impl Handle<SizeUsed> for StorageProvider {
    async fn handle(&self, command: SizeUsed) -> Result<Size, HandlerFailure> {
        self.size_used(command.storage_id).map_err(HandlerFailure::of)
    }
}

// ── Bulk transport backing ────────────────────────────────────────────────────

impl BulkStore for StorageProvider {
    fn read(&self, address: &Address, size: Size) -> Result<Vec<u8>, HandlerFailure> {
        self.with_storage(address.storage_id, |storage| {
            storage.read_bytes(address.segment_id, address.offset, size)
        })
        .map_err(HandlerFailure::of)
    }

    fn write(&self, address: &Address, bytes: &[u8]) -> Result<Size, HandlerFailure> {
        self.with_storage(address.storage_id, |storage| {
            storage.write_bytes(address.segment_id, address.offset, bytes)
        })
        .map_err(HandlerFailure::of)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
