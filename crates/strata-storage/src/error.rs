//! Storage-provider failures.

use std::path::PathBuf;

use strata_core::id::{SegmentId, StorageId};
use strata_core::memory::{Offset, Range, Size};

/// Everything a storage operation can fail with. Handlers return these to
/// the caller; they are never fatal for the provider.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no storage with id {0}")]
    UnknownStorage(StorageId),

    #[error("segment {segment_id} is gone")]
    SegmentGone { segment_id: SegmentId },

    #[error("segment {segment_id} has {references} live chunk references")]
    SegmentBusy {
        segment_id: SegmentId,
        references: usize,
    },

    #[error("segment {segment_id} is read-only")]
    ReadOnlySegment { segment_id: SegmentId },

    #[error("out of quota: used {used} + requested {requested} exceeds limit {limit}")]
    OutOfQuota {
        used: Size,
        requested: Size,
        limit: Size,
    },

    #[error("range {requested} is not covered by segment of size {segment_size} at offset {offset}")]
    OutOfRange {
        requested: Range,
        segment_size: Size,
        offset: Offset,
    },

    #[error("path {0} does not exist")]
    PathDoesNotExist(PathBuf),

    #[error("path {0} already exists")]
    PathAlreadyExists(PathBuf),

    #[error("storage parameter bundle did not decode: {0}")]
    BadParameter(#[from] strata_core::archive::LoadError),

    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("foreign implementation failed: {operation} returned {code}")]
    Foreign {
        operation: &'static str,
        code: i64,
    },

    #[error("loading foreign library {path}: {reason}")]
    ForeignLibrary { path: PathBuf, reason: String },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
