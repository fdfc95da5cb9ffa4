//! Provider side: accept loop, per-connection serve loop, handler traits.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use strata_core::archive::LoadError;
use strata_core::error::error_chain;
use strata_core::wire::{encode_response, CommandId};

use crate::command::{Command, CommandSet};
use crate::frame::{read_frame, write_frame, Frame};
use crate::handshake::send_fingerprint;

// ── Handler failure ───────────────────────────────────────────────────────────

/// A handler-raised failure. Only the rendered message chain crosses the
/// wire; the original type stays in the provider process.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerFailure {
    message: String,
}

impl HandlerFailure {
    /// Capture an error with its full source chain.
    pub fn of<E: std::error::Error + 'static>(err: E) -> HandlerFailure {
        HandlerFailure {
            message: error_chain(&err),
        }
    }

    pub fn message(text: impl Into<String>) -> HandlerFailure {
        HandlerFailure {
            message: text.into(),
        }
    }
}

/// Handling of one command type by a provider.
pub trait Handle<C: Command>: Send + Sync {
    fn handle(
        &self,
        command: C,
    ) -> impl Future<Output = Result<C::Response, HandlerFailure>> + Send;
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Errors between frame and handler.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The peer sent a command id outside the set. Fatal for the connection.
    #[error("unknown command id {0}")]
    UnknownCommand(CommandId),

    /// The payload did not decode as the command the id names.
    #[error("decoding command {name} failed: {cause}")]
    Decode {
        name: &'static str,
        cause: LoadError,
    },
}

/// Decoding and dispatching of a command set against a handler.
/// Implemented by [`crate::command_set!`].
pub trait Dispatch<H>: Sized {
    fn decode(command_id: CommandId, payload: &[u8]) -> Result<Self, DispatchError>;

    fn dispatch(self, handler: &H) -> impl Future<Output = Result<Vec<u8>, HandlerFailure>> + Send;
}

// ── Serve loops ───────────────────────────────────────────────────────────────

/// Accept connections until shutdown, serving the command set `S` with
/// `handler`. Each connection gets its own task; requests on one connection
/// are handled in arrival order.
pub async fn serve<S, H>(
    listener: TcpListener,
    handler: Arc<H>,
    mut shutdown: broadcast::Receiver<()>,
) -> io::Result<()>
where
    S: CommandSet + Dispatch<H> + Send + 'static,
    H: Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("provider listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(peer = %peer, "connection accepted");
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection::<S, H>(stream, handler).await {
                        tracing::debug!(peer = %peer, error = %e, "connection closed");
                    }
                });
            }
        }
    }
}

async fn serve_connection<S, H>(mut stream: TcpStream, handler: Arc<H>) -> io::Result<()>
where
    S: CommandSet + Dispatch<H>,
    H: Send + Sync,
{
    stream.set_nodelay(true).ok();
    send_fingerprint(&mut stream, S::NAMES).await?;

    loop {
        let request = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let payload = match S::decode(request.command_id, &request.payload) {
            Ok(command) => match command.dispatch(&*handler).await {
                Ok(response) => encode_response(Ok(&response)),
                Err(failure) => {
                    tracing::debug!(
                        command_id = request.command_id,
                        error = %failure,
                        "handler failed"
                    );
                    encode_response(Err(&failure.to_string()))
                }
            },
            Err(DispatchError::UnknownCommand(id)) => {
                // Unknown ids mean the peer disagrees about the command set;
                // nothing sane can follow on this connection.
                tracing::warn!(command_id = id, "unknown command, closing connection");
                return Ok(());
            }
            Err(decode @ DispatchError::Decode { .. }) => {
                encode_response(Err(&decode.to_string()))
            }
        };

        let response = Frame {
            call_id: request.call_id,
            command_id: request.command_id,
            payload,
        };
        write_frame(&mut stream, &response).await?;
    }
}
