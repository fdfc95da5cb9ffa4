//! strata-rpc — the typed request/response transport every provider speaks.
//!
//! One reliable, ordered byte stream per connection. The provider greets
//! with its command fingerprint; the client verifies it supports a prefix;
//! afterwards both sides exchange frames of
//! `[u32 length][u64 call-id][u32 command-id][payload]`.
//!
//! Commands are members of closed, ordered command sets declared with
//! [`command_set!`]; the wire id of a command is its declaration position,
//! resolved at compile time.

pub mod bulk;
pub mod client;
pub mod command;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod multi_client;
pub mod policy;
pub mod server;

pub use client::Client;
pub use command::{Command, CommandSet, Member};
pub use error::RpcError;
pub use policy::{AccessPolicy, Completion, Concurrent, Exclusive, Sequential};
pub use server::{Dispatch, Handle, HandlerFailure};
