//! Share service — a process advertises chunks so peers can attach.
//!
//! `Create` makes a fresh chunk on the service's local storage provider and
//! hands back a self-contained descriptor. Peers `Attach` at const or
//! mutable access; the service refcounts attachments and refuses `Remove`
//! while any are live. `Detach` sits past the distilled command set, so
//! clients that only know the four classic commands still handshake (the
//! provider may expose a superset).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use strata_core::archive::{InputArchive, Load, LoadError, OutputArchive, Save};
use strata_core::endpoint::Endpoint;
use strata_core::id::{SegmentId, StorageId};
use strata_core::impl_archive_struct;
use strata_core::memory::{Range, Size};
use strata_core::storage::{
    Access, AccessMode, ChunkDescription, Implementation, StorageParameter,
};
use strata_rpc::command::Command;
use strata_rpc::command_set;
use strata_rpc::server::{Handle, HandlerFailure};
use strata_storage::StorageProvider;

// ── Descriptor ────────────────────────────────────────────────────────────────

/// Self-contained description of a piece of memory: everything a peer needs
/// to attach.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareChunk {
    pub provider: Endpoint,
    pub storage_id: StorageId,
    pub implementation: Implementation,
    pub segment_id: SegmentId,
    pub size: Size,
}

impl_archive_struct!(ShareChunk {
    provider,
    storage_id,
    implementation,
    segment_id,
    size,
});

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("no shared chunk for storage {0}")]
    UnknownChunk(StorageId),

    #[error("chunk is still attached ({attachments} live attachments)")]
    StillAttached { attachments: usize },

    #[error("chunk has a mutable attachment; no other handle may coexist")]
    MutableAttached,

    #[error(transparent)]
    Storage(#[from] strata_storage::StorageError),
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Create a chunk of `size` bytes on the service's provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Create {
    pub size: Size,
    pub implementation: Implementation,
    pub parameter_create: StorageParameter,
    pub parameter_segment_create: StorageParameter,
}

impl_archive_struct!(Create {
    size,
    implementation,
    parameter_create,
    parameter_segment_create,
});

impl Command for Create {
    type Response = ShareChunk;
    const NAME: &'static str = "share.create";
}

/// Attach to a shared chunk at access mode `A`.
#[derive(Debug, Clone, PartialEq)]
pub struct Attach<A: Access> {
    pub chunk: ShareChunk,
    pub access: PhantomData<A>,
}

impl<A: Access> Attach<A> {
    pub fn new(chunk: ShareChunk) -> Attach<A> {
        Attach {
            chunk,
            access: PhantomData,
        }
    }
}

impl<A: Access> Save for Attach<A> {
    fn save(&self, oa: &mut OutputArchive) {
        self.chunk.save(oa);
    }
}

impl<A: Access> Load for Attach<A> {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        Ok(Attach {
            chunk: ShareChunk::load(ia)?,
            access: PhantomData,
        })
    }
}

impl<A: Access> Command for Attach<A> {
    type Response = ChunkDescription;
    const NAME: &'static str = A::ATTACH_NAME;
}

/// Destroy a shared chunk. Fails while attachments are live.
#[derive(Debug, Clone, PartialEq)]
pub struct Remove {
    pub storage_id: StorageId,
}

impl_archive_struct!(Remove { storage_id });

impl Command for Remove {
    type Response = ();
    const NAME: &'static str = "share.remove";
}

/// Drop one attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Detach {
    pub storage_id: StorageId,
}

impl_archive_struct!(Detach { storage_id });

impl Command for Detach {
    type Response = ();
    const NAME: &'static str = "share.detach";
}

command_set! {
    /// The share-service command set. Detach extends the classic four; the
    /// prefix handshake keeps old clients compatible.
    pub enum ShareCommands {
        AttachConst(Attach<strata_core::storage::Const>),
        AttachMutable(Attach<strata_core::storage::Mutable>),
        Create(Create),
        Remove(Remove),
        Detach(Detach),
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SharedChunk {
    segment_id: SegmentId,
    implementation: Implementation,
    size: Size,
    attachments: usize,
    mutable_attached: bool,
}

/// Vends chunks of the local storage provider to external consumers.
pub struct ShareService {
    provider: Arc<StorageProvider>,
    endpoint: Endpoint,
    chunks: Mutex<HashMap<StorageId, SharedChunk>>,
}

impl ShareService {
    pub fn new(provider: Arc<StorageProvider>, endpoint: Endpoint) -> ShareService {
        ShareService {
            provider,
            endpoint,
            chunks: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(
        &self,
        size: Size,
        implementation: Implementation,
        parameter_create: &StorageParameter,
        parameter_segment_create: &StorageParameter,
    ) -> Result<ShareChunk, ShareError> {
        let storage_id = self.provider.storage_create(implementation, parameter_create)?;
        let segment_id = match self
            .provider
            .segment_create(storage_id, parameter_segment_create, size)
        {
            Ok(segment_id) => segment_id,
            Err(e) => {
                // Creation is all or nothing.
                if let Err(cleanup) = self.provider.storage_remove(storage_id) {
                    tracing::warn!(%storage_id, error = %cleanup, "cleanup after failed share create");
                }
                return Err(e.into());
            }
        };

        self.chunks.lock().unwrap().insert(
            storage_id,
            SharedChunk {
                segment_id,
                implementation,
                size,
                attachments: 0,
                mutable_attached: false,
            },
        );
        tracing::info!(%storage_id, %segment_id, %size, "shared chunk created");
        Ok(ShareChunk {
            provider: self.endpoint,
            storage_id,
            implementation,
            segment_id,
            size,
        })
    }

    /// Attach at the given mode. A mutable attachment may not coexist with
    /// any other handle to the same bytes.
    pub fn attach(
        &self,
        storage_id: StorageId,
        mode: AccessMode,
    ) -> Result<ChunkDescription, ShareError> {
        let mut chunks = self.chunks.lock().unwrap();
        let chunk = chunks
            .get_mut(&storage_id)
            .ok_or(ShareError::UnknownChunk(storage_id))?;
        if chunk.mutable_attached || (mode == AccessMode::Mutable && chunk.attachments > 0) {
            return Err(ShareError::MutableAttached);
        }

        let description = self.provider.chunk_description(
            storage_id,
            chunk.segment_id,
            mode,
            Range::with_size(chunk.size),
        )?;
        chunk.attachments += 1;
        chunk.mutable_attached = mode == AccessMode::Mutable;
        Ok(description)
    }

    pub fn detach(&self, storage_id: StorageId) -> Result<(), ShareError> {
        let mut chunks = self.chunks.lock().unwrap();
        let chunk = chunks
            .get_mut(&storage_id)
            .ok_or(ShareError::UnknownChunk(storage_id))?;
        chunk.attachments = chunk.attachments.saturating_sub(1);
        if chunk.attachments == 0 {
            chunk.mutable_attached = false;
        }
        if let Err(e) = self.provider.chunk_release(storage_id, chunk.segment_id) {
            tracing::warn!(%storage_id, error = %e, "chunk release failed");
        }
        Ok(())
    }

    pub fn remove(&self, storage_id: StorageId) -> Result<(), ShareError> {
        let mut chunks = self.chunks.lock().unwrap();
        let chunk = chunks
            .get(&storage_id)
            .ok_or(ShareError::UnknownChunk(storage_id))?;
        if chunk.attachments > 0 {
            return Err(ShareError::StillAttached {
                attachments: chunk.attachments,
            });
        }
        self.provider.storage_remove(storage_id)?;
        chunks.remove(&storage_id);
        tracing::info!(%storage_id, "shared chunk removed");
        Ok(())
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

impl Handle<Create> for ShareService {
    async fn handle(&self, create: Create) -> Result<ShareChunk, HandlerFailure> {
        self.create(
            create.size,
            create.implementation,
            &create.parameter_create,
            &create.parameter_segment_create,
        )
        .map_err(HandlerFailure::of)
    }
}

impl<A: Access> Handle<Attach<A>> for ShareService {
    async fn handle(&self, attach: Attach<A>) -> Result<ChunkDescription, HandlerFailure> {
        self.attach(attach.chunk.storage_id, A::MODE)
            .map_err(HandlerFailure::of)
    }
}

impl Handle<Remove> for ShareService {
    async fn handle(&self, remove: Remove) -> Result<(), HandlerFailure> {
        self.remove(remove.storage_id).map_err(HandlerFailure::of)
    }
}

impl Handle<Detach> for ShareService {
    async fn handle(&self, detach: Detach) -> Result<(), HandlerFailure> {
        self.detach(detach.storage_id).map_err(HandlerFailure::of)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::memory::MaxSize;
    use strata_storage::parameter::{HeapCreate, HeapSegmentCreate};
    use strata_storage::trace::NoopTracer;

    fn service() -> ShareService {
        let provider = Arc::new(StorageProvider::new(Arc::new(NoopTracer)));
        ShareService::new(provider, "127.0.0.1:9440".parse().unwrap())
    }

    fn heap_chunk(service: &ShareService, size: u64) -> ShareChunk {
        service
            .create(
                Size(size),
                Implementation::Heap,
                &StorageParameter::pack(&HeapCreate {
                    max_size: MaxSize::Unlimited,
                }),
                &StorageParameter::pack(&HeapSegmentCreate::default()),
            )
            .unwrap()
    }

    #[test]
    fn create_returns_a_self_contained_descriptor() {
        let service = service();
        let chunk = heap_chunk(&service, 256);
        assert_eq!(chunk.size, Size(256));
        assert_eq!(chunk.implementation, Implementation::Heap);
        assert_eq!(chunk.provider, "127.0.0.1:9440".parse().unwrap());
    }

    #[test]
    fn remove_fails_while_attached() {
        let service = service();
        let chunk = heap_chunk(&service, 64);

        service.attach(chunk.storage_id, AccessMode::Const).unwrap();
        let err = service.remove(chunk.storage_id).unwrap_err();
        assert!(matches!(err, ShareError::StillAttached { attachments: 1 }));

        service.detach(chunk.storage_id).unwrap();
        service.remove(chunk.storage_id).unwrap();
    }

    #[test]
    fn mutable_attachment_excludes_all_others() {
        let service = service();
        let chunk = heap_chunk(&service, 64);

        service
            .attach(chunk.storage_id, AccessMode::Mutable)
            .unwrap();
        assert!(matches!(
            service.attach(chunk.storage_id, AccessMode::Const),
            Err(ShareError::MutableAttached)
        ));
        assert!(matches!(
            service.attach(chunk.storage_id, AccessMode::Mutable),
            Err(ShareError::MutableAttached)
        ));

        service.detach(chunk.storage_id).unwrap();
        service.attach(chunk.storage_id, AccessMode::Const).unwrap();
        service.attach(chunk.storage_id, AccessMode::Const).unwrap();
    }

    #[test]
    fn mutable_attach_after_const_is_refused() {
        let service = service();
        let chunk = heap_chunk(&service, 64);
        service.attach(chunk.storage_id, AccessMode::Const).unwrap();
        assert!(matches!(
            service.attach(chunk.storage_id, AccessMode::Mutable),
            Err(ShareError::MutableAttached)
        ));
    }

    #[test]
    fn unknown_chunk_is_rejected() {
        let service = service();
        assert!(matches!(
            service.attach(StorageId(9), AccessMode::Const),
            Err(ShareError::UnknownChunk(StorageId(9)))
        ));
        assert!(matches!(
            service.remove(StorageId(9)),
            Err(ShareError::UnknownChunk(_))
        ));
    }

    #[test]
    fn command_set_keeps_the_classic_prefix() {
        use strata_rpc::command::CommandSet;
        assert_eq!(
            &ShareCommands::NAMES[..4],
            &[
                "share.attach.const",
                "share.attach.mutable",
                "share.create",
                "share.remove",
            ]
        );
    }
}
