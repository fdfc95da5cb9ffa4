//! strata-storage — the four storage kinds and the storage provider.
//!
//! A provider owns a table of storages, each backed by one of four kinds
//! (files on disk, process heap, POSIX shared memory, or a dynamically
//! loaded foreign implementation) behind one uniform surface. Segments are
//! the unit of allocation; chunks are borrowed views into segments; every
//! mutating operation flows through the trace pipeline.

pub mod commands;
pub mod error;
pub mod fileio;
pub mod kind;
pub mod parameter;
pub mod provider;
pub mod trace;

pub use error::StorageError;
pub use provider::StorageProvider;
