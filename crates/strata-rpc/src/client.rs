//! Client handle: one connection, one access policy.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use strata_core::archive::{load_from_bytes, save_to_bytes};
use strata_core::endpoint::Endpoint;
use strata_core::wire::decode_response;

use crate::command::{Command, CommandSet, Member};
use crate::error::RpcError;
use crate::frame::{read_frame, write_frame, Frame};
use crate::handshake;
use crate::policy::{AccessPolicy, Completion};

/// A connection-carrying client handle scoped to one access policy.
///
/// `S` is the command set this client speaks; connecting verifies the
/// provider advertises at least that set, in that order. Dropping the
/// handle cancels every outstanding call with a completion failure.
#[derive(Debug)]
pub struct Client<S: CommandSet, P: AccessPolicy> {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    policy: Arc<P>,
    pump: tokio::task::JoinHandle<()>,
    endpoint: Endpoint,
    _set: PhantomData<fn() -> S>,
}

impl<S: CommandSet, P: AccessPolicy> Client<S, P> {
    /// Connect and run the handshake.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, RpcError> {
        let mut stream = TcpStream::connect(endpoint.addr())
            .await
            .map_err(|e| RpcError::connection(&e))?;
        stream.set_nodelay(true).ok();

        let provider_names = handshake::receive_fingerprint(&mut stream)
            .await
            .map_err(|e| RpcError::connection(&e))?;
        handshake::verify_prefix(S::NAMES, &provider_names)?;

        let (read_half, write_half) = stream.into_split();
        let policy = Arc::new(P::default());
        let pump = tokio::spawn(read_pump(read_half, policy.clone()));

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            policy,
            pump,
            endpoint,
            _set: PhantomData,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Issue one call and await its response.
    pub async fn call<C>(&self, command: C) -> Result<C::Response, RpcError>
    where
        C: Command,
        S: Member<C>,
    {
        let payload = save_to_bytes(&command);
        let (completion, receiver) = Completion::channel();
        let call_id = self.policy.start_call(completion).await;

        let frame = Frame {
            call_id,
            command_id: <S as Member<C>>::ID,
            payload,
        };
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &frame).await {
                // The send failed: every outstanding call on this handle is
                // done for, ours included.
                self.policy
                    .error(RpcError::CompletionFailure(format!("send failed: {e}")));
            }
        }

        let outcome = match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(RpcError::CompletionFailure(
                    "client handle dropped".into(),
                ))
            }
        };
        let bytes = outcome?;
        load_from_bytes::<C::Response>(&bytes).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

impl<S: CommandSet, P: AccessPolicy> Drop for Client<S, P> {
    fn drop(&mut self) {
        self.pump.abort();
        self.policy
            .error(RpcError::CompletionFailure("client handle dropped".into()));
    }
}

/// Read loop: match response frames to completions through the policy.
///
/// Runs until the connection dies or a protocol violation shows up; either
/// way every pending call is failed before the pump exits.
async fn read_pump<P: AccessPolicy>(mut read_half: OwnedReadHalf, policy: Arc<P>) {
    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(e) => {
                policy.error(RpcError::CompletionFailure(format!("connection lost: {e}")));
                return;
            }
        };

        let outcome = match decode_response(&frame.payload) {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(message)) => Err(RpcError::Handler(message)),
            Err(wire) => {
                policy.error(RpcError::CompletionFailure(wire.to_string()));
                return;
            }
        };

        match policy.completion(frame.call_id) {
            Ok(completion) => completion.complete(outcome),
            Err(violation) => {
                tracing::warn!(call_id = frame.call_id, error = %violation, "stray response frame");
                policy.error(RpcError::CompletionFailure(violation.to_string()));
                return;
            }
        }
    }
}
