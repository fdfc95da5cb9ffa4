//! Trace events — one record per mutating provider operation, plus a
//! matching result record.
//!
//! The stream is pluggable: the no-op tracer for production paths that do
//! not observe, the log-file tracer for diagnosis. Writers are best-effort;
//! a failing tracer never fails the operation it observes.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use strata_core::id::{SegmentId, StorageId};
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{AccessMode, Implementation};

/// A structured record of a state-changing storage operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Create {
        storage_id: StorageId,
        implementation: Implementation,
    },
    Destruct {
        storage_id: StorageId,
    },
    SegmentCreate {
        storage_id: StorageId,
        size: Size,
    },
    SegmentCreateResult {
        storage_id: StorageId,
        segment_id: SegmentId,
    },
    SegmentRemove {
        storage_id: StorageId,
        segment_id: SegmentId,
    },
    SegmentRemoveResult {
        storage_id: StorageId,
        segment_id: SegmentId,
    },
    FileRead {
        storage_id: StorageId,
        segment_id: SegmentId,
        offset: Offset,
        file: PathBuf,
        range: Range,
    },
    FileReadResult {
        storage_id: StorageId,
        segment_id: SegmentId,
        transferred: Size,
    },
    FileWrite {
        storage_id: StorageId,
        segment_id: SegmentId,
        offset: Offset,
        file: PathBuf,
        range: Range,
    },
    FileWriteResult {
        storage_id: StorageId,
        segment_id: SegmentId,
        transferred: Size,
    },
    SizeMax {
        storage_id: StorageId,
    },
    SizeMaxResult {
        storage_id: StorageId,
        max: MaxSize,
    },
    SizeUsed {
        storage_id: StorageId,
    },
    SizeUsedResult {
        storage_id: StorageId,
        used: Size,
    },
    ChunkDescription {
        storage_id: StorageId,
        segment_id: SegmentId,
        access: AccessMode,
        range: Range,
    },
    ChunkDescriptionResult {
        storage_id: StorageId,
        segment_id: SegmentId,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Sink for the event stream.
pub trait Tracer: Send + Sync {
    fn record(&self, event: &Event);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn record(&self, _event: &Event) {}
}

/// Appends one line per event to a log file.
#[derive(Debug)]
pub struct LogTracer {
    file: Mutex<File>,
}

impl LogTracer {
    pub fn create(path: &Path) -> std::io::Result<LogTracer> {
        let file = File::options().create(true).append(true).open(path)?;
        Ok(LogTracer {
            file: Mutex::new(file),
        })
    }
}

impl Tracer for LogTracer {
    fn record(&self, event: &Event) {
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{event}") {
            tracing::warn!(error = %e, "trace write failed");
        }
    }
}

/// Keeps every event in memory; the tracer the tests observe with.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<Event>>,
}

impl RecordingTracer {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Tracer for RecordingTracer {
    fn record(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    #[test]
    fn log_tracer_appends_lines() {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "strata-trace-test-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);

        let tracer = LogTracer::create(&path).unwrap();
        tracer.record(&Event::Create {
            storage_id: StorageId(1),
            implementation: Implementation::Heap,
        });
        tracer.record(&Event::Destruct {
            storage_id: StorageId(1),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("Create"));
        assert!(content.contains("Destruct"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn recording_tracer_keeps_order() {
        let tracer = RecordingTracer::default();
        tracer.record(&Event::SizeUsed {
            storage_id: StorageId(3),
        });
        tracer.record(&Event::SizeUsedResult {
            storage_id: StorageId(3),
            used: Size(42),
        });
        let events = tracer.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::SizeUsed { .. }));
    }
}
