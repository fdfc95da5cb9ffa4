//! The IOV backend proper: storage registry, collection allocation, and
//! location resolution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use strata_core::endpoint::Endpoint;
use strata_core::id::{CollectionId, SegmentId, StorageId};
use strata_core::memory::{Offset, Range, Size};
use strata_core::storage::{Address, Implementation, Storage, StorageParameter};
use strata_rpc::client::Client;
use strata_rpc::policy::Concurrent;
use strata_rpc::server::{Handle, HandlerFailure};
use strata_storage::commands::{ControlCommands, SegmentCreate, SegmentRemove};

use super::command::{
    CollectionAppend, CollectionCreate, CollectionDelete, QueryLocations, QueryRange, QueryState,
    StorageAdd,
};
use super::db::MetaDb;
use super::{CollectionEntry, Location, State, StorageEntry, UsedStorage};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum IovError {
    #[error("out of capacity: requested {requested}, only {available} available")]
    OutOfCapacity { requested: Size, available: Size },

    #[error("unknown collection {0}")]
    UnknownCollection(CollectionId),

    #[error("collection {0} already exists")]
    CollectionExists(CollectionId),

    #[error("unknown storage {0}")]
    UnknownStorage(StorageId),

    #[error("segment operation at provider failed: {0}")]
    Provider(String),
}

// ── Segment seam ──────────────────────────────────────────────────────────────

/// How the backend creates and removes segments at the storages it
/// allocates from. The production implementation speaks RPC to the owning
/// providers; tests substitute a local stub.
pub trait SegmentOps: Send + Sync + 'static {
    fn segment_create(
        &self,
        storage: &Storage,
        size: Size,
    ) -> impl Future<Output = Result<SegmentId, IovError>> + Send;

    fn segment_remove(
        &self,
        storage: &Storage,
        segment_id: SegmentId,
    ) -> impl Future<Output = Result<(), IovError>> + Send;
}

/// RPC-backed segment operations: one concurrent control client per
/// provider endpoint, connected lazily and reused.
pub struct RemoteSegmentOps {
    clients: tokio::sync::Mutex<HashMap<Endpoint, Arc<Client<ControlCommands, Concurrent>>>>,
}

impl RemoteSegmentOps {
    pub fn new() -> RemoteSegmentOps {
        RemoteSegmentOps {
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client(
        &self,
        endpoint: Endpoint,
    ) -> Result<Arc<Client<ControlCommands, Concurrent>>, IovError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&endpoint) {
            return Ok(client.clone());
        }
        let client = Arc::new(
            Client::connect(endpoint)
                .await
                .map_err(|e| IovError::Provider(e.to_string()))?,
        );
        clients.insert(endpoint, client.clone());
        Ok(client)
    }
}

impl Default for RemoteSegmentOps {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentOps for RemoteSegmentOps {
    async fn segment_create(&self, storage: &Storage, size: Size) -> Result<SegmentId, IovError> {
        let client = self.client(storage.endpoint).await?;
        client
            .call(SegmentCreate {
                storage_id: storage.storage_id,
                parameter: storage.parameter.clone(),
                size,
            })
            .await
            .map_err(|e| IovError::Provider(e.to_string()))
    }

    async fn segment_remove(
        &self,
        storage: &Storage,
        segment_id: SegmentId,
    ) -> Result<(), IovError> {
        let client = self.client(storage.endpoint).await?;
        client
            .call(SegmentRemove {
                storage_id: storage.storage_id,
                parameter: storage.parameter.clone(),
                segment_id,
            })
            .await
            .map_err(|e| IovError::Provider(e.to_string()))
    }
}

// ── Backend state ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Registered {
    storage: Storage,
    implementation: Implementation,
    transport: Endpoint,
    used: Size,
}

impl Registered {
    fn capacity(&self) -> Size {
        self.storage.range.len()
    }

    fn available(&self) -> Size {
        self.capacity() - self.used
    }
}

#[derive(Debug, Default)]
struct BackendState {
    next_storage_id: u64,
    /// Insertion order is allocation order.
    storages: Vec<(StorageId, Registered)>,
    collections: HashMap<CollectionId, Vec<UsedStorage>>,
}

struct PlanItem {
    storage_id: StorageId,
    storage: Storage,
    take: Size,
}

impl BackendState {
    fn registered(&self, storage_id: StorageId) -> Option<&Registered> {
        self.storages
            .iter()
            .find(|(id, _)| *id == storage_id)
            .map(|(_, registered)| registered)
    }

    fn registered_mut(&mut self, storage_id: StorageId) -> Option<&mut Registered> {
        self.storages
            .iter_mut()
            .find(|(id, _)| *id == storage_id)
            .map(|(_, registered)| registered)
    }

    /// First-fit greedy reservation across storages in insertion order.
    /// Reserves capacity immediately; the caller must roll back on failure.
    fn reserve(&mut self, size: Size) -> Result<Vec<PlanItem>, IovError> {
        let available = Size(self.storages.iter().map(|(_, r)| r.available().value()).sum());
        if available < size {
            return Err(IovError::OutOfCapacity {
                requested: size,
                available,
            });
        }

        let mut plan = Vec::new();
        let mut remaining = size;
        for (storage_id, registered) in &mut self.storages {
            if remaining == Size::ZERO {
                break;
            }
            let take = Size(registered.available().value().min(remaining.value()));
            if take == Size::ZERO {
                continue;
            }
            registered.used += take;
            remaining -= take;
            plan.push(PlanItem {
                storage_id: *storage_id,
                storage: registered.storage.clone(),
                take,
            });
        }
        Ok(plan)
    }

    fn unreserve(&mut self, plan: &[PlanItem]) {
        for item in plan {
            if let Some(registered) = self.registered_mut(item.storage_id) {
                registered.used -= item.take;
            }
        }
    }

    fn total_size(collection: &[UsedStorage]) -> Size {
        collection.last().map_or(Size::ZERO, |used| {
            used.range.end() - Offset(0)
        })
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

/// Owns `(storages, collections)` behind one mutex; segment operations at
/// the providers run outside the lock with reserve/rollback bookkeeping.
pub struct IovBackend<Ops: SegmentOps> {
    ops: Ops,
    state: Mutex<BackendState>,
    db: Option<MetaDb>,
}

impl<Ops: SegmentOps> IovBackend<Ops> {
    pub fn new(ops: Ops, db: Option<MetaDb>) -> IovBackend<Ops> {
        IovBackend {
            ops,
            state: Mutex::new(BackendState::default()),
            db,
        }
    }

    /// Register a storage's capacity for future allocation.
    pub fn storage_add(
        &self,
        storage: Storage,
        implementation: Implementation,
        transport: Endpoint,
    ) -> StorageId {
        let mut state = self.state.lock().unwrap();
        let storage_id = StorageId(state.next_storage_id);
        state.next_storage_id += 1;
        tracing::info!(%storage_id, endpoint = %storage.endpoint, capacity = %storage.range.len(), "storage registered");
        state.storages.push((
            storage_id,
            Registered {
                storage,
                implementation,
                transport,
                used: Size::ZERO,
            },
        ));
        storage_id
    }

    /// Allocate `size` bytes for a new collection.
    pub async fn collection_create(
        &self,
        collection_id: CollectionId,
        size: Size,
    ) -> Result<Vec<UsedStorage>, IovError> {
        let plan = {
            let mut state = self.state.lock().unwrap();
            if state.collections.contains_key(&collection_id) {
                return Err(IovError::CollectionExists(collection_id));
            }
            state.reserve(size)?
        };

        let used_storages = self
            .allocate_segments(&plan, Offset(0))
            .await
            .inspect_err(|_| {
                self.state.lock().unwrap().unreserve(&plan);
            })?;

        {
            let mut state = self.state.lock().unwrap();
            state
                .collections
                .insert(collection_id.clone(), used_storages.clone());
        }
        self.record(&collection_id, &used_storages);
        tracing::info!(%collection_id, %size, slices = used_storages.len(), "collection created");
        Ok(used_storages)
    }

    /// Extend an existing collection by `additional` bytes. Returns the
    /// collection's total size after the append.
    pub async fn collection_append(
        &self,
        collection_id: CollectionId,
        additional: Size,
    ) -> Result<Size, IovError> {
        let (plan, base) = {
            let mut state = self.state.lock().unwrap();
            let Some(collection) = state.collections.get(&collection_id) else {
                return Err(IovError::UnknownCollection(collection_id));
            };
            let base = Offset(BackendState::total_size(collection).value());
            let plan = state.reserve(additional)?;
            (plan, base)
        };

        let appended = self.allocate_segments(&plan, base).await.inspect_err(|_| {
            self.state.lock().unwrap().unreserve(&plan);
        })?;

        let (total, used_storages) = {
            let mut state = self.state.lock().unwrap();
            let collection = state
                .collections
                .get_mut(&collection_id)
                .expect("existence checked above");
            collection.extend(appended);
            (BackendState::total_size(collection), collection.clone())
        };
        self.record(&collection_id, &used_storages);
        Ok(total)
    }

    /// Release the collection and ask each touched storage to remove its
    /// segment. A second delete of the same id fails `UnknownCollection`.
    pub async fn collection_delete(&self, collection_id: CollectionId) -> Result<(), IovError> {
        let removals = {
            let mut state = self.state.lock().unwrap();
            let collection = state
                .collections
                .remove(&collection_id)
                .ok_or_else(|| IovError::UnknownCollection(collection_id.clone()))?;

            let mut removals = Vec::new();
            for used in collection {
                let length = used.range.len();
                let Some(registered) = state.registered_mut(used.storage_id) else {
                    continue;
                };
                registered.used -= length;
                removals.push((registered.storage.clone(), used.segment_id));
            }
            removals
        };

        for (storage, segment_id) in removals {
            if let Err(e) = self.ops.segment_remove(&storage, segment_id).await {
                tracing::warn!(%segment_id, error = %e, "segment removal at provider failed");
            }
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.remove(collection_id.as_str()) {
                tracing::warn!(%collection_id, error = %e, "meta-database removal failed");
            }
        }
        tracing::info!(%collection_id, "collection deleted");
        Ok(())
    }

    /// Total byte range currently mapped by the collection.
    pub fn range(&self, collection_id: &CollectionId) -> Result<Range, IovError> {
        let state = self.state.lock().unwrap();
        let collection = state
            .collections
            .get(collection_id)
            .ok_or_else(|| IovError::UnknownCollection(collection_id.clone()))?;
        Ok(Range::with_size(BackendState::total_size(collection)))
    }

    /// Resolve `requested` into ordered locations. Empty when the range
    /// lies outside the collection.
    pub fn locations(
        &self,
        collection_id: &CollectionId,
        requested: Range,
    ) -> Result<Vec<Location>, IovError> {
        let state = self.state.lock().unwrap();
        let collection = state
            .collections
            .get(collection_id)
            .ok_or_else(|| IovError::UnknownCollection(collection_id.clone()))?;

        let mut locations = Vec::new();
        for used in collection {
            let Some(overlap) = used.range.intersection(&requested) else {
                continue;
            };
            let Some(registered) = state.registered(used.storage_id) else {
                continue;
            };
            let empty = StorageParameter::default();
            locations.push(Location {
                range: overlap,
                storages_provider: registered.storage.endpoint,
                implementation: registered.implementation,
                parameter_file_read: empty.clone(),
                parameter_file_write: empty.clone(),
                transport_provider: registered.transport,
                address: Address {
                    storage_id: registered.storage.storage_id,
                    parameter_chunk_description: empty,
                    segment_id: used.segment_id,
                    // Segment-relative byte position of the overlap.
                    offset: Offset((overlap.begin() - used.range.begin()).value()),
                },
            });
        }
        Ok(locations)
    }

    /// Diagnostic snapshot.
    pub fn state(&self) -> State {
        let state = self.state.lock().unwrap();
        let mut collections: Vec<CollectionEntry> = state
            .collections
            .iter()
            .map(|(collection_id, used_storages)| CollectionEntry {
                collection_id: collection_id.clone(),
                used_storages: used_storages.clone(),
            })
            .collect();
        collections.sort_by(|a, b| a.collection_id.cmp(&b.collection_id));
        State {
            storages: state
                .storages
                .iter()
                .map(|(storage_id, registered)| StorageEntry {
                    storage_id: *storage_id,
                    storage: registered.storage.clone(),
                    used: registered.used,
                })
                .collect(),
            collections,
        }
    }

    async fn allocate_segments(
        &self,
        plan: &[PlanItem],
        base: Offset,
    ) -> Result<Vec<UsedStorage>, IovError> {
        let mut used_storages = Vec::with_capacity(plan.len());
        let mut created: Vec<(Storage, SegmentId)> = Vec::new();
        let mut cursor = base;

        for item in plan {
            match self.ops.segment_create(&item.storage, item.take).await {
                Ok(segment_id) => {
                    created.push((item.storage.clone(), segment_id));
                    let range = Range::new(cursor, cursor + item.take)
                        .expect("cursor grows monotonically");
                    cursor = range.end();
                    used_storages.push(UsedStorage {
                        range,
                        segment_id,
                        storage_id: item.storage_id,
                    });
                }
                Err(e) => {
                    for (storage, segment_id) in created {
                        if let Err(rollback) = self.ops.segment_remove(&storage, segment_id).await {
                            tracing::warn!(%segment_id, error = %rollback, "rollback removal failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(used_storages)
    }

    fn record(&self, collection_id: &CollectionId, used_storages: &[UsedStorage]) {
        let Some(db) = &self.db else {
            return;
        };
        let value = used_storages
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        if let Err(e) = db.set(collection_id.as_str(), &value) {
            tracing::warn!(%collection_id, error = %e, "meta-database write failed");
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

impl<Ops: SegmentOps> Handle<QueryRange> for IovBackend<Ops> {
    async fn handle(&self, query: QueryRange) -> Result<Range, HandlerFailure> {
        self.range(&query.collection_id).map_err(HandlerFailure::of)
    }
}

impl<Ops: SegmentOps> Handle<QueryLocations> for IovBackend<Ops> {
    async fn handle(&self, query: QueryLocations) -> Result<Vec<Location>, HandlerFailure> {
        self.locations(&query.collection_id, query.range)
            .map_err(HandlerFailure::of)
    }
}

impl<Ops: SegmentOps> Handle<QueryState> for IovBackend<Ops> {
    async fn handle(&self, _: QueryState) -> Result<State, HandlerFailure> {
        Ok(self.state())
    }
}

impl<Ops: SegmentOps> Handle<CollectionAppend> for IovBackend<Ops> {
    async fn handle(&self, append: CollectionAppend) -> Result<Size, HandlerFailure> {
        self.collection_append(append.collection_id, append.range.len())
            .await
            .map_err(HandlerFailure::of)
    }
}

impl<Ops: SegmentOps> Handle<CollectionCreate> for IovBackend<Ops> {
    async fn handle(&self, create: CollectionCreate) -> Result<Vec<UsedStorage>, HandlerFailure> {
        self.collection_create(create.collection_id, create.size)
            .await
            .map_err(HandlerFailure::of)
    }
}

impl<Ops: SegmentOps> Handle<CollectionDelete> for IovBackend<Ops> {
    async fn handle(&self, delete: CollectionDelete) -> Result<(), HandlerFailure> {
        self.collection_delete(delete.collection_id)
            .await
            .map_err(HandlerFailure::of)
    }
}

impl<Ops: SegmentOps> Handle<StorageAdd> for IovBackend<Ops> {
    async fn handle(&self, add: StorageAdd) -> Result<StorageId, HandlerFailure> {
        Ok(self.storage_add(add.storage, add.implementation, add.transport))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Allocates segment ids locally; remembers removals.
    #[derive(Default)]
    struct StubOps {
        next_segment: AtomicU64,
        removed: Mutex<Vec<SegmentId>>,
        fail_after: Option<u64>,
    }

    impl SegmentOps for StubOps {
        async fn segment_create(&self, _: &Storage, _: Size) -> Result<SegmentId, IovError> {
            let n = self.next_segment.fetch_add(1, Ordering::Relaxed);
            if let Some(limit) = self.fail_after {
                if n >= limit {
                    return Err(IovError::Provider("stub refuses".into()));
                }
            }
            Ok(SegmentId(n))
        }

        async fn segment_remove(&self, _: &Storage, id: SegmentId) -> Result<(), IovError> {
            self.removed.lock().unwrap().push(id);
            Ok(())
        }
    }

    fn storage(capacity: u64, marker: u64) -> Storage {
        Storage {
            endpoint: "127.0.0.1:9410".parse().unwrap(),
            storage_id: StorageId(marker),
            parameter: StorageParameter::default(),
            segment_id: SegmentId(0),
            range: Range::with_size(Size(capacity)),
        }
    }

    fn transport() -> Endpoint {
        "127.0.0.1:9411".parse().unwrap()
    }

    fn backend_with(capacities: &[u64]) -> IovBackend<StubOps> {
        let backend = IovBackend::new(StubOps::default(), None);
        for (marker, capacity) in capacities.iter().enumerate() {
            backend.storage_add(
                storage(*capacity, marker as u64),
                Implementation::Heap,
                transport(),
            );
        }
        backend
    }

    #[tokio::test]
    async fn create_tiles_across_storages_in_insertion_order() {
        let backend = backend_with(&[1000, 2500]);
        let collection_id = CollectionId::new("C");
        let used = backend
            .collection_create(collection_id.clone(), Size(3000))
            .await
            .unwrap();

        assert_eq!(used.len(), 2);
        assert_eq!(used[0].range, Range::new(Offset(0), Offset(1000)).unwrap());
        assert_eq!(used[1].range, Range::new(Offset(1000), Offset(3000)).unwrap());

        let locations = backend
            .locations(&collection_id, Range::with_size(Size(3000)))
            .unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].range, used[0].range);
        assert_eq!(locations[1].range, used[1].range);
        // The second location starts at segment offset zero.
        assert_eq!(locations[1].address.offset, Offset(0));
    }

    #[tokio::test]
    async fn locations_cover_a_partial_range() {
        let backend = backend_with(&[1000, 2500]);
        let collection_id = CollectionId::new("C");
        backend
            .collection_create(collection_id.clone(), Size(3000))
            .await
            .unwrap();

        let locations = backend
            .locations(&collection_id, Range::new(Offset(900), Offset(1100)).unwrap())
            .unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].range, Range::new(Offset(900), Offset(1000)).unwrap());
        assert_eq!(locations[0].address.offset, Offset(900));
        assert_eq!(locations[1].range, Range::new(Offset(1000), Offset(1100)).unwrap());
    }

    #[tokio::test]
    async fn locations_outside_the_collection_are_empty() {
        let backend = backend_with(&[1000]);
        let collection_id = CollectionId::new("C");
        backend
            .collection_create(collection_id.clone(), Size(500))
            .await
            .unwrap();
        let locations = backend
            .locations(&collection_id, Range::new(Offset(500), Offset(600)).unwrap())
            .unwrap();
        assert!(locations.is_empty());
    }

    #[tokio::test]
    async fn out_of_capacity_fails_and_reserves_nothing() {
        let backend = backend_with(&[1000, 500]);
        let err = backend
            .collection_create(CollectionId::new("C"), Size(2000))
            .await
            .unwrap_err();
        assert!(matches!(err, IovError::OutOfCapacity { .. }));

        // All capacity is still available.
        backend
            .collection_create(CollectionId::new("D"), Size(1500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_allocation_rolls_back_created_segments() {
        let backend = IovBackend::new(
            StubOps {
                fail_after: Some(1),
                ..StubOps::default()
            },
            None,
        );
        backend.storage_add(storage(1000, 0), Implementation::Heap, transport());
        backend.storage_add(storage(1000, 1), Implementation::Heap, transport());

        let err = backend
            .collection_create(CollectionId::new("C"), Size(1500))
            .await
            .unwrap_err();
        assert!(matches!(err, IovError::Provider(_)));
        assert_eq!(*backend.ops.removed.lock().unwrap(), vec![SegmentId(0)]);

        // Capacity was rolled back too.
        backend
            .collection_create(CollectionId::new("D"), Size(1000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn append_extends_the_range() {
        let backend = backend_with(&[4096]);
        let collection_id = CollectionId::new("C");
        backend
            .collection_create(collection_id.clone(), Size(1000))
            .await
            .unwrap();
        let total = backend
            .collection_append(collection_id.clone(), Size(500))
            .await
            .unwrap();
        assert_eq!(total, Size(1500));
        assert_eq!(
            backend.range(&collection_id).unwrap(),
            Range::with_size(Size(1500))
        );
    }

    #[tokio::test]
    async fn delete_frees_segments_and_capacity() {
        let backend = backend_with(&[1000]);
        let collection_id = CollectionId::new("C");
        backend
            .collection_create(collection_id.clone(), Size(1000))
            .await
            .unwrap();
        backend.collection_delete(collection_id.clone()).await.unwrap();

        assert_eq!(*backend.ops.removed.lock().unwrap(), vec![SegmentId(0)]);
        // Deleting again fails; deletion is not silently idempotent.
        let err = backend.collection_delete(collection_id).await.unwrap_err();
        assert!(matches!(err, IovError::UnknownCollection(_)));

        // Capacity is reusable.
        backend
            .collection_create(CollectionId::new("D"), Size(1000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let backend = backend_with(&[1000]);
        let collection_id = CollectionId::new("C");
        backend
            .collection_create(collection_id.clone(), Size(100))
            .await
            .unwrap();
        let err = backend
            .collection_create(collection_id, Size(100))
            .await
            .unwrap_err();
        assert!(matches!(err, IovError::CollectionExists(_)));
    }

    #[tokio::test]
    async fn state_snapshot_reflects_composition() {
        let backend = backend_with(&[1000, 2500]);
        backend
            .collection_create(CollectionId::new("C"), Size(1200))
            .await
            .unwrap();
        let state = backend.state();
        assert_eq!(state.storages.len(), 2);
        assert_eq!(state.storages[0].used, Size(1000));
        assert_eq!(state.storages[1].used, Size(200));
        assert_eq!(state.collections.len(), 1);
    }

    #[tokio::test]
    async fn db_records_follow_the_collection() {
        let backend = IovBackend::new(StubOps::default(), Some(MetaDb::open_in_memory().unwrap()));
        backend.storage_add(storage(1000, 0), Implementation::Heap, transport());
        let collection_id = CollectionId::new("tracked");
        backend
            .collection_create(collection_id.clone(), Size(100))
            .await
            .unwrap();
        assert!(backend
            .db
            .as_ref()
            .unwrap()
            .get("tracked")
            .unwrap()
            .is_some());

        backend.collection_delete(collection_id).await.unwrap();
        assert!(backend.db.as_ref().unwrap().get("tracked").unwrap().is_none());
    }
}
