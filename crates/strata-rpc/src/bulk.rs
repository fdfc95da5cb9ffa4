//! Bulk transport — addressed get/put of raw byte ranges.
//!
//! Bulk moves bypass the command archive for the bytes themselves: a `Get`
//! response frame carries only the actual size, immediately followed by that
//! many raw bytes on the stream; a reserving `Put` sends its frame and then
//! the raw bytes. Operations on one address are not mutually ordered; a
//! caller that needs ordering serializes its own calls.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use strata_core::archive::{
    load_from_bytes, save_to_bytes, InputArchive, Load, LoadError, OutputArchive, Save,
};
use strata_core::endpoint::Endpoint;
use strata_core::impl_archive_struct;
use strata_core::memory::Size;
use strata_core::storage::Address;
use strata_core::wire::{decode_response, encode_response};

use crate::command::{Command, CommandSet, Member};
use crate::command_set;
use crate::error::RpcError;
use crate::frame::{read_frame, write_frame, Frame};
use crate::handshake;
use crate::server::HandlerFailure;

// ── Commands ──────────────────────────────────────────────────────────────────

/// Read `size` bytes at `source`. The destination buffer is the caller's;
/// the bytes travel raw after the response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Get {
    pub source: Address,
    pub size: Size,
}

impl_archive_struct!(Get { source, size });

impl Command for Get {
    type Response = Size;
    const NAME: &'static str = "bulk.get";
}

/// Bytes of a [`Put`]: carried inline in the command payload, or reserved
/// and streamed raw after the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutPayload {
    Inline(Vec<u8>),
    Reserve(Size),
}

impl PutPayload {
    pub fn size(&self) -> Size {
        match self {
            PutPayload::Inline(bytes) => Size(bytes.len() as u64),
            PutPayload::Reserve(size) => *size,
        }
    }
}

impl Save for PutPayload {
    fn save(&self, oa: &mut OutputArchive) {
        match self {
            PutPayload::Inline(bytes) => {
                oa.variant_tag(0);
                bytes.save(oa);
            }
            PutPayload::Reserve(size) => {
                oa.variant_tag(1);
                size.save(oa);
            }
        }
    }
}

impl Load for PutPayload {
    fn load(ia: &mut InputArchive<'_>) -> Result<Self, LoadError> {
        match ia.variant_tag()? {
            0 => Ok(PutPayload::Inline(Vec::<u8>::load(ia)?)),
            1 => Ok(PutPayload::Reserve(Size::load(ia)?)),
            index => Err(LoadError::UnknownVariant {
                type_name: "PutPayload",
                index,
            }),
        }
    }
}

/// Write bytes at `destination`. Response is the accepted size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Put {
    pub destination: Address,
    pub payload: PutPayload,
}

impl_archive_struct!(Put {
    destination,
    payload
});

impl Command for Put {
    type Response = Size;
    const NAME: &'static str = "bulk.put";
}

command_set! {
    /// The bulk-transport command set.
    pub enum BulkCommands {
        Get(Get),
        Put(Put),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BulkError {
    #[error("could not read all data: wanted {wanted}, got {got}")]
    CouldNotReadAllData { wanted: Size, got: Size },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

// ── Store seam ────────────────────────────────────────────────────────────────

/// What a bulk listener serves from: resolve an address and move bytes.
pub trait BulkStore: Send + Sync + 'static {
    /// Read up to `size` bytes at `address`. May return fewer when the
    /// segment ends early; the client decides whether short is fatal.
    fn read(&self, address: &Address, size: Size) -> Result<Vec<u8>, HandlerFailure>;

    /// Write `bytes` at `address`, returning the accepted size.
    fn write(&self, address: &Address, bytes: &[u8]) -> Result<Size, HandlerFailure>;
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Accept loop for the bulk transport.
pub async fn serve_bulk<B: BulkStore>(
    listener: TcpListener,
    store: Arc<B>,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("bulk listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_bulk_connection(stream, store).await {
                        tracing::debug!(peer = %peer, error = %e, "bulk connection closed");
                    }
                });
            }
        }
    }
}

const GET_ID: u32 = <BulkCommands as Member<Get>>::ID;
const PUT_ID: u32 = <BulkCommands as Member<Put>>::ID;

async fn serve_bulk_connection<B: BulkStore>(
    mut stream: TcpStream,
    store: Arc<B>,
) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    handshake::send_fingerprint(&mut stream, BulkCommands::NAMES).await?;

    loop {
        let request = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        match request.command_id {
            GET_ID => {
                let get = match load_from_bytes::<Get>(&request.payload) {
                    Ok(get) => get,
                    Err(e) => {
                        respond(&mut stream, &request, Err(&e.to_string())).await?;
                        continue;
                    }
                };
                match store.read(&get.source, get.size) {
                    Ok(bytes) => {
                        let size = Size(bytes.len() as u64);
                        respond(&mut stream, &request, Ok(&save_to_bytes(&size))).await?;
                        stream.write_all(&bytes).await?;
                        stream.flush().await?;
                    }
                    Err(failure) => {
                        respond(&mut stream, &request, Err(&failure.to_string())).await?;
                    }
                }
            }

            PUT_ID => {
                let put = match load_from_bytes::<Put>(&request.payload) {
                    Ok(put) => put,
                    Err(e) => {
                        respond(&mut stream, &request, Err(&e.to_string())).await?;
                        continue;
                    }
                };
                let bytes = match put.payload {
                    PutPayload::Inline(bytes) => bytes,
                    PutPayload::Reserve(size) => {
                        // The reserved bytes follow the frame on the stream.
                        let mut bytes = vec![0u8; size.value() as usize];
                        stream.read_exact(&mut bytes).await?;
                        bytes
                    }
                };
                match store.write(&put.destination, &bytes) {
                    Ok(accepted) => {
                        respond(&mut stream, &request, Ok(&save_to_bytes(&accepted))).await?;
                    }
                    Err(failure) => {
                        respond(&mut stream, &request, Err(&failure.to_string())).await?;
                    }
                }
            }

            other => {
                tracing::warn!(command_id = other, "unknown bulk command, closing connection");
                return Ok(());
            }
        }
    }
}

async fn respond(
    stream: &mut TcpStream,
    request: &Frame,
    result: Result<&[u8], &str>,
) -> io::Result<()> {
    let response = Frame {
        call_id: request.call_id,
        command_id: request.command_id,
        payload: encode_response(result),
    };
    write_frame(stream, &response).await
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Client for the bulk transport. Operations serialize on the connection;
/// open several clients for parallel transfers.
pub struct BulkClient {
    stream: tokio::sync::Mutex<TcpStream>,
    endpoint: Endpoint,
    next_call_id: std::sync::atomic::AtomicU64,
}

impl BulkClient {
    pub async fn connect(endpoint: Endpoint) -> Result<Self, RpcError> {
        let mut stream = TcpStream::connect(endpoint.addr())
            .await
            .map_err(|e| RpcError::connection(&e))?;
        stream.set_nodelay(true).ok();
        let provider_names = handshake::receive_fingerprint(&mut stream)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        handshake::verify_prefix(BulkCommands::NAMES, &provider_names)?;
        Ok(Self {
            stream: tokio::sync::Mutex::new(stream),
            endpoint,
            next_call_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn call_id(&self) -> u64 {
        self.next_call_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Read `destination.len()` bytes at `source` into `destination`.
    ///
    /// Fails with [`BulkError::CouldNotReadAllData`] when the provider
    /// delivers fewer bytes than requested.
    pub async fn get(&self, source: Address, destination: &mut [u8]) -> Result<Size, BulkError> {
        let wanted = Size(destination.len() as u64);
        let command = Get {
            source,
            size: wanted,
        };

        let mut stream = self.stream.lock().await;
        let request = Frame {
            call_id: self.call_id(),
            command_id: GET_ID,
            payload: save_to_bytes(&command),
        };
        write_frame(&mut *stream, &request)
            .await
            .map_err(|e| RpcError::connection(&e))?;

        let response = read_frame(&mut *stream)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        let got: Size = decode_result(&response.payload)?;
        // A correct provider never announces more than asked.
        let announced = (got.value() as usize).min(destination.len());

        let mut read = 0usize;
        while read < announced {
            let n = stream
                .read(&mut destination[read..announced])
                .await
                .map_err(|e| RpcError::connection(&e))?;
            if n == 0 {
                break;
            }
            read += n;
        }
        let got = Size(read as u64);
        if got < wanted {
            return Err(BulkError::CouldNotReadAllData { wanted, got });
        }
        Ok(got)
    }

    /// Write `bytes` at `destination`, inline in the command payload.
    pub async fn put(&self, destination: Address, bytes: &[u8]) -> Result<Size, BulkError> {
        let command = Put {
            destination,
            payload: PutPayload::Inline(bytes.to_vec()),
        };
        let mut stream = self.stream.lock().await;
        let request = Frame {
            call_id: self.call_id(),
            command_id: PUT_ID,
            payload: save_to_bytes(&command),
        };
        write_frame(&mut *stream, &request)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        let response = read_frame(&mut *stream)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        Ok(decode_result(&response.payload)?)
    }

    /// Write `bytes` at `destination`, reserving first and streaming the
    /// bytes raw after the frame. Preferred for large spans: the bytes are
    /// never copied into the archive.
    pub async fn put_reserved(&self, destination: Address, bytes: &[u8]) -> Result<Size, BulkError> {
        let command = Put {
            destination,
            payload: PutPayload::Reserve(Size(bytes.len() as u64)),
        };
        let mut stream = self.stream.lock().await;
        let request = Frame {
            call_id: self.call_id(),
            command_id: PUT_ID,
            payload: save_to_bytes(&command),
        };
        write_frame(&mut *stream, &request)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        stream.flush().await.map_err(|e| RpcError::connection(&e))?;
        let response = read_frame(&mut *stream)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        Ok(decode_result(&response.payload)?)
    }
}

fn decode_result(payload: &[u8]) -> Result<Size, RpcError> {
    match decode_response(payload).map_err(|e| RpcError::Decode(e.to_string()))? {
        Ok(bytes) => load_from_bytes::<Size>(&bytes).map_err(|e| RpcError::Decode(e.to_string())),
        Err(message) => Err(RpcError::Handler(message)),
    }
}
