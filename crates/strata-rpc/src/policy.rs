//! Access policies — how outstanding calls on one client handle are tracked.
//!
//! A policy hands out call ids, stores the completion for each outstanding
//! call, and surfaces connection failure to every pending caller. The
//! transport is policy-agnostic: it asks for a call id before sending and
//! looks the completion up again when the matching response frame arrives.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::sync::OwnedMutexGuard;

use crate::error::RpcError;
use strata_core::wire::CallId;

// ── Completion ────────────────────────────────────────────────────────────────

/// The receiving end of one call: completing it wakes the caller.
#[derive(Debug)]
pub struct Completion(oneshot::Sender<Result<Vec<u8>, RpcError>>);

impl Completion {
    pub fn channel() -> (Completion, oneshot::Receiver<Result<Vec<u8>, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        (Completion(tx), rx)
    }

    /// Deliver the call's outcome. A caller that stopped listening is fine.
    pub fn complete(self, outcome: Result<Vec<u8>, RpcError>) {
        let _ = self.0.send(outcome);
    }
}

/// A completion was requested for a call id the policy does not track.
/// Protocol violation; the connection is torn down.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PolicyViolation(pub String);

// ── Policy trait ──────────────────────────────────────────────────────────────

/// Call-tracking discipline of a client handle.
pub trait AccessPolicy: Default + Send + Sync + 'static {
    /// Register a completion for a new call. Returns the call id that goes
    /// on the wire. May suspend: `Sequential` waits here for the send slot.
    fn start_call(&self, completion: Completion) -> impl Future<Output = CallId> + Send;

    /// Take the completion of the call `call_id`.
    fn completion(&self, call_id: CallId) -> Result<Completion, PolicyViolation>;

    /// Fail every outstanding completion with `reason`.
    fn error(&self, reason: RpcError);
}

// ── Exclusive ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ExclusiveState {
    call_id: CallId,
    completion: Option<Completion>,
}

/// At most one outstanding call. Call ids increase monotonically.
///
/// Starting a second call while one is outstanding is a logic error in the
/// caller and panics.
#[derive(Debug, Default)]
pub struct Exclusive {
    state: Mutex<ExclusiveState>,
}

impl AccessPolicy for Exclusive {
    async fn start_call(&self, completion: Completion) -> CallId {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.completion.is_none(),
            "exclusive client already has an outstanding call"
        );
        state.completion = Some(completion);
        state.call_id
    }

    fn completion(&self, call_id: CallId) -> Result<Completion, PolicyViolation> {
        let mut state = self.state.lock().unwrap();
        if call_id != state.call_id {
            return Err(PolicyViolation(format!(
                "expected call id {}, got {call_id}",
                state.call_id
            )));
        }
        let completion = state
            .completion
            .take()
            .ok_or_else(|| PolicyViolation("no completion".into()))?;
        state.call_id += 1;
        Ok(completion)
    }

    fn error(&self, reason: RpcError) {
        let completion = {
            let mut state = self.state.lock().unwrap();
            let completion = state.completion.take();
            if completion.is_some() {
                state.call_id += 1;
            }
            completion
        };
        if let Some(completion) = completion {
            completion.complete(Err(reason));
        }
    }
}

// ── Sequential ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SequentialState {
    call_id: CallId,
    completion: Option<Completion>,
    send_lock: Option<OwnedMutexGuard<()>>,
}

/// Like [`Exclusive`], but a second caller waits for the send slot instead
/// of being a logic error. Sends are serialized across threads; the slot is
/// released when the previous call completes.
#[derive(Debug)]
pub struct Sequential {
    send_slot: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<SequentialState>,
}

impl Default for Sequential {
    fn default() -> Self {
        Self {
            send_slot: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(SequentialState::default()),
        }
    }
}

impl AccessPolicy for Sequential {
    async fn start_call(&self, completion: Completion) -> CallId {
        let guard = self.send_slot.clone().lock_owned().await;
        let mut state = self.state.lock().unwrap();
        state.completion = Some(completion);
        state.send_lock = Some(guard);
        state.call_id
    }

    fn completion(&self, call_id: CallId) -> Result<Completion, PolicyViolation> {
        let mut state = self.state.lock().unwrap();
        if call_id != state.call_id {
            return Err(PolicyViolation(format!(
                "expected call id {}, got {call_id}",
                state.call_id
            )));
        }
        let completion = state
            .completion
            .take()
            .ok_or_else(|| PolicyViolation("no completion".into()))?;
        state.call_id += 1;
        state.send_lock = None;
        Ok(completion)
    }

    fn error(&self, reason: RpcError) {
        let completion = {
            let mut state = self.state.lock().unwrap();
            let completion = state.completion.take();
            if completion.is_some() {
                state.call_id += 1;
            }
            state.send_lock = None;
            completion
        };
        if let Some(completion) = completion {
            completion.complete(Err(reason));
        }
    }
}

// ── Concurrent ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ConcurrentState {
    next_call_id: CallId,
    completions: HashMap<CallId, Completion>,
}

/// Unbounded outstanding calls, tracked in a call-id map.
///
/// Socket reads are serialized by the connection's single read pump, which
/// stands in for a dedicated read lock.
#[derive(Debug, Default)]
pub struct Concurrent {
    state: Mutex<ConcurrentState>,
}

impl AccessPolicy for Concurrent {
    async fn start_call(&self, completion: Completion) -> CallId {
        let mut state = self.state.lock().unwrap();
        let call_id = state.next_call_id;
        state.next_call_id += 1;
        state.completions.insert(call_id, completion);
        call_id
    }

    fn completion(&self, call_id: CallId) -> Result<Completion, PolicyViolation> {
        let mut state = self.state.lock().unwrap();
        state
            .completions
            .remove(&call_id)
            .ok_or_else(|| PolicyViolation(format!("no completion for call id {call_id}")))
    }

    fn error(&self, reason: RpcError) {
        let completions: Vec<Completion> = {
            let mut state = self.state.lock().unwrap();
            state.completions.drain().map(|(_, c)| c).collect()
        };
        for completion in completions {
            completion.complete(Err(reason.clone()));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
