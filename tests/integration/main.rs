//! Strata integration test harness.
//!
//! Every test starts real providers on 127.0.0.1 ephemeral ports inside the
//! test's own tokio runtime and drives them through real RPC clients. No
//! external environment is required.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use strata_core::endpoint::Endpoint;
use strata_core::id::{CollectionId, StorageId};
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{Const, Implementation, Mutable, StorageParameter};
use strata_rpc::bulk::{serve_bulk, BulkClient, BulkError};
use strata_rpc::command::CommandSet;
use strata_rpc::command_set;
use strata_rpc::multi_client::{MultiClient, ParallelCallsLimit};
use strata_rpc::policy::{Concurrent, Exclusive};
use strata_rpc::server::{serve, Dispatch};
use strata_rpc::{Client, RpcError};
use strata_services::block::command::{
    Add, BlockCommands, QueryBlockSize, QueryBlocks, QueryLocation, QueryNumberOfBlocks, Remove,
};
use strata_services::block::{BlockId, BlockIndex, BlockRange, BlockSize};
use strata_services::iov::command::{
    CollectionCreate, CollectionDelete, IovCommands, QueryLocations, QueryRange, StorageAdd,
};
use strata_services::iov::{IovBackend, RemoteSegmentOps};
use strata_services::share::{self, ShareCommands, ShareService};
use strata_storage::commands::{
    ControlCommands, Describe, FileRead, FileWrite, SegmentCreate, SegmentRemove, SizeUsed,
    StorageCreate,
};
use strata_storage::parameter::{
    FilesCreate, FilesSegmentCreate, HeapCreate, HeapSegmentCreate, OnRemove,
};
use strata_storage::trace::NoopTracer;
use strata_storage::StorageProvider;

// ── Infrastructure ────────────────────────────────────────────────────────────

/// Bind an ephemeral listener and serve command set `S` with `handler`.
/// Returns the endpoint and the shutdown sender keeping the listener alive.
async fn start_provider<S, H>(handler: Arc<H>) -> (Endpoint, broadcast::Sender<()>)
where
    S: CommandSet + Dispatch<H> + Send + 'static,
    H: Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint(listener.local_addr().unwrap());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(serve::<S, H>(listener, handler, shutdown_rx));
    (endpoint, shutdown_tx)
}

/// Storage provider plus its bulk listener.
async fn start_storage_provider(
) -> (Arc<StorageProvider>, Endpoint, Endpoint, broadcast::Sender<()>) {
    let provider = Arc::new(StorageProvider::new(Arc::new(NoopTracer)));
    let (control, shutdown_tx) = start_provider::<ControlCommands, _>(provider.clone()).await;

    let bulk_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bulk = Endpoint(bulk_listener.local_addr().unwrap());
    tokio::spawn(serve_bulk(
        bulk_listener,
        provider.clone(),
        shutdown_tx.subscribe(),
    ));

    (provider, control, bulk, shutdown_tx)
}

fn heap_create_param(max_size: MaxSize) -> StorageParameter {
    StorageParameter::pack(&HeapCreate { max_size })
}

fn heap_segment_param() -> StorageParameter {
    StorageParameter::pack(&HeapSegmentCreate::default())
}

fn test_dir(tag: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "strata-integration-{tag}-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A block-backing storage descriptor of `bytes` capacity.
fn block_storage(endpoint: Endpoint, marker: u64, bytes: u64) -> strata_core::storage::Storage {
    strata_core::storage::Storage {
        endpoint,
        storage_id: StorageId(marker),
        parameter: StorageParameter::default(),
        segment_id: strata_core::id::SegmentId(0),
        range: Range::with_size(Size(bytes)),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Archive
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn archive_size_is_eight_little_endian_bytes() {
    let value = Size(0x0102030405060708);
    let bytes = strata_core::archive::save_to_bytes(&value);
    assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    assert_eq!(
        strata_core::archive::load_from_bytes::<Size>(&bytes).unwrap(),
        value
    );
}

// ══════════════════════════════════════════════════════════════════════════════
//  Block-device meta-data over RPC
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn block_add_location_remove() {
    let index = Arc::new(BlockIndex::new(BlockSize::new(4096).unwrap()));
    let (endpoint, _shutdown) = start_provider::<BlockCommands, _>(index).await;
    let client: Client<BlockCommands, Exclusive> = Client::connect(endpoint).await.unwrap();

    let storage = block_storage(endpoint, 1, 3 * 4096);
    let added = client
        .call(Add {
            storage: storage.clone(),
        })
        .await
        .unwrap();
    assert_eq!(added.range, BlockRange::new(BlockId(0), BlockId(3)).unwrap());

    let location = client.call(QueryLocation { id: BlockId(1) }).await.unwrap();
    assert_eq!(location.storage, storage);
    assert_eq!(location.offset, Offset(4096));

    let removed = client.call(Remove { range: added.range }).await.unwrap();
    assert_eq!(removed, storage);

    let blocks = client.call(QueryNumberOfBlocks).await.unwrap();
    assert_eq!(blocks.0, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn block_non_aligned_add_fails() {
    let index = Arc::new(BlockIndex::new(BlockSize::new(4096).unwrap()));
    let (endpoint, _shutdown) = start_provider::<BlockCommands, _>(index).await;
    let client: Client<BlockCommands, Exclusive> = Client::connect(endpoint).await.unwrap();

    let err = client
        .call(Add {
            storage: block_storage(endpoint, 1, 5000),
        })
        .await
        .unwrap_err();
    match err {
        RpcError::Handler(message) => assert!(
            message.contains("not a multiple"),
            "unexpected message: {message}"
        ),
        other => panic!("expected handler error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_error_leaves_server_state_unchanged() {
    let index = Arc::new(BlockIndex::new(BlockSize::new(4096).unwrap()));
    let (endpoint, _shutdown) = start_provider::<BlockCommands, _>(index.clone()).await;
    let client: Client<BlockCommands, Exclusive> = Client::connect(endpoint).await.unwrap();

    let err = client
        .call(Remove {
            range: BlockRange::new(BlockId(10), BlockId(20)).unwrap(),
        })
        .await
        .unwrap_err();
    match err {
        RpcError::Handler(message) => {
            assert!(message.contains("unknown range"), "message: {message}")
        }
        other => panic!("expected handler error, got {other:?}"),
    }

    // The connection survives a handler error and the index is untouched.
    assert_eq!(client.call(QueryBlocks).await.unwrap(), vec![]);
    assert!(index.blocks().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn block_ranges_stay_disjoint_under_churn() {
    let index = Arc::new(BlockIndex::new(BlockSize::new(512).unwrap()));
    let (endpoint, _shutdown) = start_provider::<BlockCommands, _>(index).await;
    let client: Client<BlockCommands, Concurrent> = Client::connect(endpoint).await.unwrap();

    let mut live = Vec::new();
    for marker in 0..8u64 {
        let added = client
            .call(Add {
                storage: block_storage(endpoint, marker, (marker % 3 + 1) * 512),
            })
            .await
            .unwrap();
        live.push(added.range);
    }
    for range in live.into_iter().step_by(2) {
        client.call(Remove { range }).await.unwrap();
    }
    client
        .call(Add {
            storage: block_storage(endpoint, 99, 512),
        })
        .await
        .unwrap();

    let blocks = client.call(QueryBlocks).await.unwrap();
    for window in blocks.windows(2) {
        assert!(window[0].end() <= window[1].begin());
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Handshake
// ══════════════════════════════════════════════════════════════════════════════

// The same block commands in a different declaration order: a reordered
// fingerprint that must be rejected.
command_set! {
    enum ReorderedBlockCommands {
        QueryBlockSize(QueryBlockSize),
        QueryBlocks(QueryBlocks),
        QueryNumberOfBlocks(QueryNumberOfBlocks),
    }
}

// A true prefix of the full block command list.
command_set! {
    enum PrefixBlockCommands {
        QueryBlockSize(QueryBlockSize),
        QueryNumberOfBlocks(QueryNumberOfBlocks),
        QueryBlocks(QueryBlocks),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_accepts_a_prefix_client() {
    let index = Arc::new(BlockIndex::new(BlockSize::new(4096).unwrap()));
    let (endpoint, _shutdown) = start_provider::<BlockCommands, _>(index).await;

    let client: Client<PrefixBlockCommands, Exclusive> = Client::connect(endpoint).await.unwrap();
    let block_size = client.call(QueryBlockSize).await.unwrap();
    assert_eq!(block_size.value(), 4096);
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_rejects_a_reordered_client() {
    let index = Arc::new(BlockIndex::new(BlockSize::new(4096).unwrap()));
    let (endpoint, _shutdown) = start_provider::<BlockCommands, _>(index).await;

    let err = Client::<ReorderedBlockCommands, Exclusive>::connect(endpoint)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::HandshakeFailed);
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_rejects_a_client_needing_more_commands() {
    // Provider speaks only the three query commands; a full-set client
    // needs commands past the provider's end.
    let index = Arc::new(BlockIndex::new(BlockSize::new(4096).unwrap()));
    let (endpoint, _shutdown) = start_provider::<PrefixBlockCommands, _>(index).await;

    let err = Client::<BlockCommands, Exclusive>::connect(endpoint)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::HandshakeFailed);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Storage provider over RPC
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn storage_quota_is_enforced_over_rpc() {
    let (_provider, control, _bulk, _shutdown) = start_storage_provider().await;
    let client: Client<ControlCommands, Exclusive> = Client::connect(control).await.unwrap();

    let storage_id = client
        .call(StorageCreate {
            implementation: Implementation::Heap,
            parameter: heap_create_param(MaxSize::Limit(Size(1000))),
        })
        .await
        .unwrap();

    let mut segments = Vec::new();
    for _ in 0..4 {
        segments.push(
            client
                .call(SegmentCreate {
                    storage_id,
                    parameter: heap_segment_param(),
                    size: Size(250),
                })
                .await
                .unwrap(),
        );
    }
    assert_eq!(
        client.call(SizeUsed { storage_id }).await.unwrap(),
        Size(1000)
    );

    let err = client
        .call(SegmentCreate {
            storage_id,
            parameter: heap_segment_param(),
            size: Size(1),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Handler(m) if m.contains("out of quota")));

    client
        .call(SegmentRemove {
            storage_id,
            parameter: heap_segment_param(),
            segment_id: segments[0],
        })
        .await
        .unwrap();
    assert_eq!(
        client.call(SizeUsed { storage_id }).await.unwrap(),
        Size(750)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn chunk_descriptions_carry_the_access_mode() {
    let (_provider, control, _bulk, _shutdown) = start_storage_provider().await;
    let client: Client<ControlCommands, Exclusive> = Client::connect(control).await.unwrap();

    let storage_id = client
        .call(StorageCreate {
            implementation: Implementation::Heap,
            parameter: heap_create_param(MaxSize::Unlimited),
        })
        .await
        .unwrap();
    let segment_id = client
        .call(SegmentCreate {
            storage_id,
            parameter: heap_segment_param(),
            size: Size(64),
        })
        .await
        .unwrap();

    let range = Range::with_size(Size(64));
    let description = client
        .call(Describe::<Const>::new(
            storage_id,
            StorageParameter::default(),
            segment_id,
            range,
        ))
        .await
        .unwrap();
    assert_eq!(description.implementation(), Implementation::Heap);
    assert_eq!(description.range(), range);

    let mutable = client
        .call(Describe::<Mutable>::new(
            storage_id,
            StorageParameter::default(),
            segment_id,
            range,
        ))
        .await
        .unwrap();
    assert_eq!(mutable.implementation(), Implementation::Heap);

    // Two descriptions are outstanding; removal reports busy.
    let err = client
        .call(SegmentRemove {
            storage_id,
            parameter: heap_segment_param(),
            segment_id,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Handler(m) if m.contains("live chunk references")));
}

#[tokio::test(flavor = "multi_thread")]
async fn file_read_and_write_through_a_files_storage() {
    let (_provider, control, _bulk, _shutdown) = start_storage_provider().await;
    let client: Client<ControlCommands, Exclusive> = Client::connect(control).await.unwrap();

    let dir = test_dir("files");
    let storage_id = client
        .call(StorageCreate {
            implementation: Implementation::Files,
            parameter: StorageParameter::pack(&FilesCreate {
                prefix: dir.join("segments"),
                max_size: MaxSize::Unlimited,
            }),
        })
        .await
        .unwrap();
    let segment_id = client
        .call(SegmentCreate {
            storage_id,
            parameter: StorageParameter::pack(&FilesSegmentCreate {
                on_remove: OnRemove::Remove,
            }),
            size: Size(32),
        })
        .await
        .unwrap();

    let input = dir.join("input.bin");
    std::fs::write(&input, b"strata file transfer payload").unwrap();

    // External file -> segment at offset 4.
    let transferred = client
        .call(FileRead {
            storage_id,
            parameter: StorageParameter::default(),
            segment_id,
            offset: Offset(4),
            file: input.clone(),
            range: Range::new(Offset(0), Offset(6)).unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(transferred, Size(6));

    // Segment -> a fresh external file.
    let output = dir.join("output.bin");
    let transferred = client
        .call(FileWrite {
            storage_id,
            parameter: StorageParameter::default(),
            segment_id,
            offset: Offset(4),
            file: output.clone(),
            range: Range::new(Offset(0), Offset(6)).unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(transferred, Size(6));
    assert_eq!(std::fs::read(&output).unwrap(), b"strata");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_segment_fails_with_gone_over_rpc() {
    let (_provider, control, _bulk, _shutdown) = start_storage_provider().await;
    let client: Client<ControlCommands, Exclusive> = Client::connect(control).await.unwrap();

    let storage_id = client
        .call(StorageCreate {
            implementation: Implementation::Heap,
            parameter: heap_create_param(MaxSize::Unlimited),
        })
        .await
        .unwrap();
    let segment_id = client
        .call(SegmentCreate {
            storage_id,
            parameter: heap_segment_param(),
            size: Size(16),
        })
        .await
        .unwrap();
    client
        .call(SegmentRemove {
            storage_id,
            parameter: heap_segment_param(),
            segment_id,
        })
        .await
        .unwrap();

    let err = client
        .call(Describe::<Const>::new(
            storage_id,
            StorageParameter::default(),
            segment_id,
            Range::with_size(Size(16)),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Handler(m) if m.contains("is gone")));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Bulk transport
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn bulk_put_then_get_round_trips() {
    let (provider, _control, bulk, _shutdown) = start_storage_provider().await;

    let storage_id = provider
        .storage_create(Implementation::Heap, &heap_create_param(MaxSize::Unlimited))
        .unwrap();
    let segment_id = provider
        .segment_create(storage_id, &heap_segment_param(), Size(256))
        .unwrap();

    let address = strata_core::storage::Address {
        storage_id,
        parameter_chunk_description: StorageParameter::default(),
        segment_id,
        offset: Offset(16),
    };

    let client = BulkClient::connect(bulk).await.unwrap();
    let accepted = client
        .put(address.clone(), b"inline payload")
        .await
        .unwrap();
    assert_eq!(accepted, Size(14));

    let mut buffer = vec![0u8; 14];
    let got = client.get(address.clone(), &mut buffer).await.unwrap();
    assert_eq!(got, Size(14));
    assert_eq!(&buffer, b"inline payload");

    // The reserving path moves the bytes raw after the frame.
    let accepted = client
        .put_reserved(address.clone(), b"reserved payload")
        .await
        .unwrap();
    assert_eq!(accepted, Size(16));
    let mut buffer = vec![0u8; 16];
    client.get(address, &mut buffer).await.unwrap();
    assert_eq!(&buffer, b"reserved payload");
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_short_get_fails() {
    let (provider, _control, bulk, _shutdown) = start_storage_provider().await;

    let storage_id = provider
        .storage_create(Implementation::Heap, &heap_create_param(MaxSize::Unlimited))
        .unwrap();
    let segment_id = provider
        .segment_create(storage_id, &heap_segment_param(), Size(8))
        .unwrap();

    let address = strata_core::storage::Address {
        storage_id,
        parameter_chunk_description: StorageParameter::default(),
        segment_id,
        offset: Offset(0),
    };

    let client = BulkClient::connect(bulk).await.unwrap();
    // The segment holds 8 bytes; asking for 32 comes up short.
    let mut buffer = vec![0u8; 32];
    let err = client.get(address, &mut buffer).await.unwrap_err();
    assert!(matches!(
        err,
        BulkError::CouldNotReadAllData {
            wanted: Size(32),
            got: Size(8)
        }
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
//  IOV backend
// ══════════════════════════════════════════════════════════════════════════════

/// Register heap storages of the given byte capacities with an IOV backend,
/// all served over real RPC.
async fn iov_with_capacities(
    capacities: &[u64],
) -> (
    Client<IovCommands, Concurrent>,
    Endpoint,
    Vec<broadcast::Sender<()>>,
) {
    let (provider, control, bulk, storage_shutdown) = start_storage_provider().await;

    let backend = Arc::new(IovBackend::new(RemoteSegmentOps::new(), None));
    let (iov_endpoint, iov_shutdown) = start_provider::<IovCommands, _>(backend).await;
    let iov_client: Client<IovCommands, Concurrent> = Client::connect(iov_endpoint).await.unwrap();

    for capacity in capacities {
        let storage_id = provider
            .storage_create(Implementation::Heap, &heap_create_param(MaxSize::Unlimited))
            .unwrap();
        let descriptor = strata_core::storage::Storage {
            endpoint: control,
            storage_id,
            parameter: heap_segment_param(),
            segment_id: strata_core::id::SegmentId(0),
            range: Range::with_size(Size(*capacity)),
        };
        iov_client
            .call(StorageAdd {
                storage: descriptor,
                implementation: Implementation::Heap,
                transport: bulk,
            })
            .await
            .unwrap();
    }

    (iov_client, control, vec![storage_shutdown, iov_shutdown])
}

#[tokio::test(flavor = "multi_thread")]
async fn iov_collection_tiles_across_storages() {
    let (client, control, _shutdowns) = iov_with_capacities(&[1000, 2500]).await;

    let collection_id = CollectionId::new("C");
    let used = client
        .call(CollectionCreate {
            collection_id: collection_id.clone(),
            size: Size(3000),
        })
        .await
        .unwrap();
    assert_eq!(used.len(), 2);
    assert_eq!(used[0].range, Range::new(Offset(0), Offset(1000)).unwrap());
    assert_eq!(
        used[1].range,
        Range::new(Offset(1000), Offset(3000)).unwrap()
    );

    let range = client
        .call(QueryRange {
            collection_id: collection_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(range, Range::with_size(Size(3000)));

    // Locations tile [0, 3000) exactly.
    let locations = client
        .call(QueryLocations {
            collection_id,
            range,
        })
        .await
        .unwrap();
    assert_eq!(locations.len(), 2);
    assert_eq!(locations[0].range.begin(), Offset(0));
    assert_eq!(locations[0].range.end(), locations[1].range.begin());
    assert_eq!(locations[1].range.end(), Offset(3000));
    assert_eq!(locations[0].storages_provider, control);
}

#[tokio::test(flavor = "multi_thread")]
async fn iov_create_beyond_capacity_fails() {
    let (client, _control, _shutdowns) = iov_with_capacities(&[1000, 2500]).await;
    let err = client
        .call(CollectionCreate {
            collection_id: CollectionId::new("too-big"),
            size: Size(4000),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Handler(m) if m.contains("out of capacity")));
}

#[tokio::test(flavor = "multi_thread")]
async fn iov_delete_is_not_silently_idempotent() {
    let (client, _control, _shutdowns) = iov_with_capacities(&[1000]).await;

    let collection_id = CollectionId::new("once");
    client
        .call(CollectionCreate {
            collection_id: collection_id.clone(),
            size: Size(500),
        })
        .await
        .unwrap();

    client
        .call(CollectionDelete {
            collection_id: collection_id.clone(),
        })
        .await
        .unwrap();

    let err = client
        .call(CollectionDelete { collection_id })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Handler(m) if m.contains("unknown collection")));
}

#[tokio::test(flavor = "multi_thread")]
async fn iov_delete_frees_provider_segments() {
    let (provider, control, bulk, _storage_shutdown) = start_storage_provider().await;
    let storage_id = provider
        .storage_create(Implementation::Heap, &heap_create_param(MaxSize::Unlimited))
        .unwrap();

    let backend = Arc::new(IovBackend::new(RemoteSegmentOps::new(), None));
    let (iov_endpoint, _iov_shutdown) = start_provider::<IovCommands, _>(backend).await;
    let client: Client<IovCommands, Concurrent> = Client::connect(iov_endpoint).await.unwrap();

    client
        .call(StorageAdd {
            storage: strata_core::storage::Storage {
                endpoint: control,
                storage_id,
                parameter: heap_segment_param(),
                segment_id: strata_core::id::SegmentId(0),
                range: Range::with_size(Size(1000)),
            },
            implementation: Implementation::Heap,
            transport: bulk,
        })
        .await
        .unwrap();

    let collection_id = CollectionId::new("freed");
    client
        .call(CollectionCreate {
            collection_id: collection_id.clone(),
            size: Size(600),
        })
        .await
        .unwrap();
    assert_eq!(provider.size_used(storage_id).unwrap(), Size(600));

    client
        .call(CollectionDelete { collection_id })
        .await
        .unwrap();
    assert_eq!(provider.size_used(storage_id).unwrap(), Size(0));
}

// ══════════════════════════════════════════════════════════════════════════════
//  Share service
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn share_create_attach_remove_lifecycle() {
    let provider = Arc::new(StorageProvider::new(Arc::new(NoopTracer)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint(listener.local_addr().unwrap());
    let service = Arc::new(ShareService::new(provider, endpoint));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(serve::<ShareCommands, _>(listener, service, shutdown_rx));
    let _shutdown = shutdown_tx;

    let client: Client<ShareCommands, Exclusive> = Client::connect(endpoint).await.unwrap();

    let chunk = client
        .call(share::Create {
            size: Size(128),
            implementation: Implementation::Heap,
            parameter_create: heap_create_param(MaxSize::Unlimited),
            parameter_segment_create: heap_segment_param(),
        })
        .await
        .unwrap();
    assert_eq!(chunk.size, Size(128));
    assert_eq!(chunk.provider, endpoint);

    let description = client
        .call(share::Attach::<Const>::new(chunk.clone()))
        .await
        .unwrap();
    assert_eq!(description.implementation(), Implementation::Heap);

    // Attached chunks refuse removal.
    let err = client
        .call(share::Remove {
            storage_id: chunk.storage_id,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Handler(m) if m.contains("still attached")));

    client
        .call(share::Detach {
            storage_id: chunk.storage_id,
        })
        .await
        .unwrap();
    client
        .call(share::Remove {
            storage_id: chunk.storage_id,
        })
        .await
        .unwrap();
}

// ══════════════════════════════════════════════════════════════════════════════
//  Policies and cancellation
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn connection_loss_fails_outstanding_calls() {
    // A provider that handshakes, reads one frame, and dies.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint(listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        strata_rpc::handshake::send_fingerprint(&mut stream, BlockCommands::NAMES)
            .await
            .unwrap();
        let _ = strata_rpc::frame::read_frame(&mut stream).await;
        drop(stream);
    });

    let client: Client<BlockCommands, Exclusive> = Client::connect(endpoint).await.unwrap();
    let err = client.call(QueryBlockSize).await.unwrap_err();
    assert!(matches!(err, RpcError::CompletionFailure(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_client_fans_out_and_collects_errors() {
    let first = Arc::new(BlockIndex::new(BlockSize::new(512).unwrap()));
    let second = Arc::new(BlockIndex::new(BlockSize::new(512).unwrap()));
    let (first_endpoint, _s1) = start_provider::<BlockCommands, _>(first).await;
    let (second_endpoint, _s2) = start_provider::<BlockCommands, _>(second).await;

    let children = vec![
        Client::<BlockCommands, Exclusive>::connect(first_endpoint)
            .await
            .unwrap(),
        Client::<BlockCommands, Exclusive>::connect(second_endpoint)
            .await
            .unwrap(),
    ];
    let multi = MultiClient::new(children, ParallelCallsLimit::at_most(2).unwrap());

    let sizes = multi.call_all(QueryBlockSize).await.unwrap();
    assert_eq!(sizes.len(), 2);
    assert!(sizes.iter().all(|s| s.value() == 512));

    // A failing child surfaces in the collected error list.
    let outcome = multi
        .call_all(Remove {
            range: BlockRange::new(BlockId(0), BlockId(1)).unwrap(),
        })
        .await;
    match outcome {
        Err(RpcError::Errors(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected collected errors, got {other:?}"),
    }
}
