//! IOV backend — composing chunks from many providers into logical
//! collections addressable by `(collection, offset)`.

mod backend;
pub mod db;

pub use backend::{IovBackend, IovError, RemoteSegmentOps, SegmentOps};

use std::fmt;

use strata_core::endpoint::Endpoint;
use strata_core::id::{CollectionId, SegmentId, StorageId};
use strata_core::impl_archive_struct;
use strata_core::memory::Range;
use strata_core::storage::{Address, Implementation, Storage, StorageParameter};

// ── Collection composition records ────────────────────────────────────────────

/// One slice of a collection: which IOV-registered storage backs which
/// collection-relative byte range, through which segment.
#[derive(Debug, Clone, PartialEq)]
pub struct UsedStorage {
    /// Collection-relative memory range.
    pub range: Range,
    pub segment_id: SegmentId,
    /// IOV-local storage id, as returned by `storage.Add`.
    pub storage_id: StorageId,
}

impl_archive_struct!(UsedStorage {
    range,
    segment_id,
    storage_id,
});

impl fmt::Display for UsedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on storage {} segment {}",
            self.range, self.storage_id, self.segment_id
        )
    }
}

/// Everything needed to reach one resolved slice of a collection: the
/// provider endpoints for file I/O and bulk transport, the storage
/// implementation, the file-I/O parameter bundles, and the bulk address.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// Collection-relative range this location covers.
    pub range: Range,
    /// Control endpoint for file.read/file.write.
    pub storages_provider: Endpoint,
    pub implementation: Implementation,
    pub parameter_file_read: StorageParameter,
    pub parameter_file_write: StorageParameter,
    /// Bulk-transport endpoint.
    pub transport_provider: Endpoint,
    pub address: Address,
}

impl_archive_struct!(Location {
    range,
    storages_provider,
    implementation,
    parameter_file_read,
    parameter_file_write,
    transport_provider,
    address,
});

// ── Diagnostic state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StorageEntry {
    pub storage_id: StorageId,
    pub storage: Storage,
    pub used: strata_core::memory::Size,
}

impl_archive_struct!(StorageEntry {
    storage_id,
    storage,
    used,
});

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEntry {
    pub collection_id: CollectionId,
    pub used_storages: Vec<UsedStorage>,
}

impl_archive_struct!(CollectionEntry {
    collection_id,
    used_storages,
});

/// Snapshot of `{storages, collections}` for diagnosis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct State {
    pub storages: Vec<StorageEntry>,
    pub collections: Vec<CollectionEntry>,
}

impl_archive_struct!(State {
    storages,
    collections,
});

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "storages:")?;
        for entry in &self.storages {
            writeln!(
                f,
                "  {} -> {} at {} ({} of {} used)",
                entry.storage_id,
                entry.storage.storage_id,
                entry.storage.endpoint,
                entry.used,
                entry.storage.range.len(),
            )?;
        }
        writeln!(f, "collections:")?;
        for entry in &self.collections {
            writeln!(f, "  {}:", entry.collection_id)?;
            for used in &entry.used_storages {
                writeln!(f, "    {used}")?;
            }
        }
        Ok(())
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub mod command {
    use strata_core::endpoint::Endpoint;
    use strata_core::id::{CollectionId, StorageId};
    use strata_core::impl_archive_struct;
    use strata_core::memory::{Range, Size};
    use strata_core::storage::Storage;
    use strata_rpc::command::Command;
    use strata_rpc::command_set;

    use super::{Location, State, UsedStorage};

    /// The collection's total mapped byte range.
    #[derive(Debug, Clone, PartialEq)]
    pub struct QueryRange {
        pub collection_id: CollectionId,
    }

    impl_archive_struct!(QueryRange { collection_id });

    impl Command for QueryRange {
        type Response = Range;
        const NAME: &'static str = "iov.range";
    }

    /// Resolve a byte range of a collection into ordered locations. An
    /// empty answer means the range lies outside the collection.
    #[derive(Debug, Clone, PartialEq)]
    pub struct QueryLocations {
        pub collection_id: CollectionId,
        pub range: Range,
    }

    impl_archive_struct!(QueryLocations {
        collection_id,
        range,
    });

    impl Command for QueryLocations {
        type Response = Vec<Location>;
        const NAME: &'static str = "iov.locations";
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryState;

    impl strata_core::archive::Save for QueryState {
        fn save(&self, _oa: &mut strata_core::archive::OutputArchive) {}
    }

    impl strata_core::archive::Load for QueryState {
        fn load(
            _ia: &mut strata_core::archive::InputArchive<'_>,
        ) -> Result<Self, strata_core::archive::LoadError> {
            Ok(QueryState)
        }
    }

    impl Command for QueryState {
        type Response = State;
        const NAME: &'static str = "iov.state";
    }

    /// Extend a collection by `range.len()` additional bytes. Responds with
    /// the collection's total size after the append.
    #[derive(Debug, Clone, PartialEq)]
    pub struct CollectionAppend {
        pub collection_id: CollectionId,
        pub range: Range,
    }

    impl_archive_struct!(CollectionAppend {
        collection_id,
        range,
    });

    impl Command for CollectionAppend {
        type Response = Size;
        const NAME: &'static str = "iov.collection.append";
    }

    /// Allocate `size` bytes across the registered storages, first-fit in
    /// insertion order.
    #[derive(Debug, Clone, PartialEq)]
    pub struct CollectionCreate {
        pub collection_id: CollectionId,
        pub size: Size,
    }

    impl_archive_struct!(CollectionCreate {
        collection_id,
        size,
    });

    impl Command for CollectionCreate {
        type Response = Vec<UsedStorage>;
        const NAME: &'static str = "iov.collection.create";
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct CollectionDelete {
        pub collection_id: CollectionId,
    }

    impl_archive_struct!(CollectionDelete { collection_id });

    impl Command for CollectionDelete {
        type Response = ();
        const NAME: &'static str = "iov.collection.delete";
    }

    /// Register a storage's capacity for future allocation. The transport
    /// endpoint is where bulk operations on the storage go; the
    /// implementation tag travels into resolved locations.
    #[derive(Debug, Clone, PartialEq)]
    pub struct StorageAdd {
        pub storage: Storage,
        pub implementation: strata_core::storage::Implementation,
        pub transport: Endpoint,
    }

    impl_archive_struct!(StorageAdd {
        storage,
        implementation,
        transport
    });

    impl Command for StorageAdd {
        type Response = StorageId;
        const NAME: &'static str = "iov.storage.add";
    }

    command_set! {
        /// The IOV backend command set.
        pub enum IovCommands {
            QueryRange(QueryRange),
            QueryLocations(QueryLocations),
            QueryState(QueryState),
            CollectionAppend(CollectionAppend),
            CollectionCreate(CollectionCreate),
            CollectionDelete(CollectionDelete),
            StorageAdd(StorageAdd),
        }
    }
}
