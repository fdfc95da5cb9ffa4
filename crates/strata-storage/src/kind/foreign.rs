//! Foreign storage kind — a dynamically loaded implementation behind a
//! C ABI function table.
//!
//! The shared object exports one symbol per operation; every method here is
//! a trampoline through the resolved function pointers. Negative return
//! codes are implementation errors; byte-moving entry points return the
//! transferred count or a negative errno.
//!
//! Loaded libraries are cached process-wide by path so several storages can
//! share one handle; [`clear_library_cache`] is the teardown hook.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use strata_core::id::SegmentId;
use strata_core::memory::{MaxSize, Offset, Range, Size};
use strata_core::storage::{AccessMode, ChunkDescription, ForeignChunk, StorageParameter};

use crate::error::StorageError;
use crate::kind::{check_coverage, Quota};
use crate::parameter::ForeignCreate;

// ── C ABI ─────────────────────────────────────────────────────────────────────

type CreateFn = unsafe extern "C" fn(config: *const u8, config_len: usize, out: *mut u64) -> c_int;
type DestroyFn = unsafe extern "C" fn(handle: u64) -> c_int;
type SegmentCreateFn = unsafe extern "C" fn(handle: u64, size: u64, out: *mut u64) -> c_int;
type SegmentRemoveFn = unsafe extern "C" fn(handle: u64, segment: u64) -> c_int;
type ChunkTokenFn = unsafe extern "C" fn(
    handle: u64,
    segment: u64,
    begin: u64,
    end: u64,
    mutable_access: u8,
    out: *mut u64,
) -> c_int;
type TransferFn =
    unsafe extern "C" fn(handle: u64, segment: u64, offset: u64, bytes: *mut u8, len: usize) -> i64;

#[derive(Debug)]
struct VTable {
    create: CreateFn,
    destroy: DestroyFn,
    segment_create: SegmentCreateFn,
    segment_remove: SegmentRemoveFn,
    chunk_token: ChunkTokenFn,
    read: TransferFn,
    write: TransferFn,
}

// ── Library handle and cache ──────────────────────────────────────────────────

/// A dlopen'd storage implementation. Closed when the last storage using it
/// and the cache entry are gone.
#[derive(Debug)]
pub struct Library {
    raw: *mut c_void,
    path: PathBuf,
    vtable: VTable,
}

// The handle is only used through the vtable, whose functions the loaded
// implementation must make thread-safe per the storage contract.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

fn dlerror_text() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dlopen failure".into();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

impl Library {
    fn open(path: &Path) -> Result<Library, StorageError> {
        let cpath = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
            StorageError::ForeignLibrary {
                path: path.to_owned(),
                reason: "path contains a NUL byte".into(),
            }
        })?;
        let raw = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if raw.is_null() {
            return Err(StorageError::ForeignLibrary {
                path: path.to_owned(),
                reason: dlerror_text(),
            });
        }

        let resolve = |symbol: &'static str| -> Result<*mut c_void, StorageError> {
            let csymbol = CString::new(symbol).expect("symbol names are static");
            let address = unsafe { libc::dlsym(raw, csymbol.as_ptr() as *const c_char) };
            if address.is_null() {
                return Err(StorageError::ForeignLibrary {
                    path: path.to_owned(),
                    reason: format!("missing symbol {symbol}: {}", dlerror_text()),
                });
            }
            Ok(address)
        };

        // Transmutes pair a dlsym'd address with its declared signature.
        let vtable = unsafe {
            VTable {
                create: std::mem::transmute::<*mut c_void, CreateFn>(resolve(
                    "strata_storage_create",
                )?),
                destroy: std::mem::transmute::<*mut c_void, DestroyFn>(resolve(
                    "strata_storage_destroy",
                )?),
                segment_create: std::mem::transmute::<*mut c_void, SegmentCreateFn>(resolve(
                    "strata_storage_segment_create",
                )?),
                segment_remove: std::mem::transmute::<*mut c_void, SegmentRemoveFn>(resolve(
                    "strata_storage_segment_remove",
                )?),
                chunk_token: std::mem::transmute::<*mut c_void, ChunkTokenFn>(resolve(
                    "strata_storage_chunk_token",
                )?),
                read: std::mem::transmute::<*mut c_void, TransferFn>(resolve(
                    "strata_storage_read",
                )?),
                write: std::mem::transmute::<*mut c_void, TransferFn>(resolve(
                    "strata_storage_write",
                )?),
            }
        };

        Ok(Library {
            raw,
            path: path.to_owned(),
            vtable,
        })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if unsafe { libc::dlclose(self.raw) } != 0 {
            tracing::warn!(path = %self.path.display(), "dlclose failed");
        }
    }
}

fn library_cache() -> &'static Mutex<HashMap<PathBuf, Arc<Library>>> {
    static CACHE: OnceLock<Mutex<HashMap<PathBuf, Arc<Library>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn load_library(path: &Path) -> Result<Arc<Library>, StorageError> {
    let mut cache = library_cache().lock().unwrap();
    if let Some(library) = cache.get(path) {
        return Ok(library.clone());
    }
    let library = Arc::new(Library::open(path)?);
    cache.insert(path.to_owned(), library.clone());
    Ok(library)
}

/// Drop all cached library handles. Storages still holding an `Arc` keep
/// theirs alive; fresh creates re-open from disk.
pub fn clear_library_cache() {
    library_cache().lock().unwrap().clear();
}

// ── Storage ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ForeignSegment {
    size: Size,
}

/// A storage whose method bodies trampoline into a loaded shared object.
#[derive(Debug)]
pub struct ForeignStorage {
    library: Arc<Library>,
    handle: u64,
    quota: Quota,
    segments: HashMap<SegmentId, ForeignSegment>,
}

fn check(operation: &'static str, code: c_int) -> Result<(), StorageError> {
    if code != 0 {
        return Err(StorageError::Foreign {
            operation,
            code: code as i64,
        });
    }
    Ok(())
}

impl ForeignStorage {
    pub fn create(bundle: ForeignCreate) -> Result<ForeignStorage, StorageError> {
        let library = load_library(&bundle.library)?;
        let mut handle = 0u64;
        let code = unsafe {
            (library.vtable.create)(bundle.config.as_ptr(), bundle.config.len(), &mut handle)
        };
        check("create", code)?;
        Ok(ForeignStorage {
            library,
            handle,
            quota: Quota::new(bundle.max_size),
            segments: HashMap::new(),
        })
    }

    pub fn max_size(&self) -> MaxSize {
        self.quota.max()
    }

    pub fn used_size(&self) -> Size {
        self.quota.used()
    }

    fn segment(&self, segment_id: SegmentId) -> Result<&ForeignSegment, StorageError> {
        self.segments
            .get(&segment_id)
            .ok_or(StorageError::SegmentGone { segment_id })
    }

    pub fn segment_create(
        &mut self,
        size: Size,
        _parameter: &StorageParameter,
    ) -> Result<SegmentId, StorageError> {
        self.quota.reserve(size)?;
        let mut raw_segment = 0u64;
        let code = unsafe {
            (self.library.vtable.segment_create)(self.handle, size.value(), &mut raw_segment)
        };
        if let Err(e) = check("segment_create", code) {
            self.quota.release(size);
            return Err(e);
        }
        let segment_id = SegmentId(raw_segment);
        self.segments.insert(segment_id, ForeignSegment { size });
        Ok(segment_id)
    }

    pub fn segment_remove(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        let size = self.segment(segment_id)?.size;
        let code =
            unsafe { (self.library.vtable.segment_remove)(self.handle, segment_id.value()) };
        check("segment_remove", code)?;
        self.segments.remove(&segment_id);
        self.quota.release(size);
        Ok(())
    }

    pub fn segment_size(&self, segment_id: SegmentId) -> Result<Size, StorageError> {
        Ok(self.segment(segment_id)?.size)
    }

    pub fn chunk_description(
        &mut self,
        segment_id: SegmentId,
        access: AccessMode,
        range: Range,
    ) -> Result<ChunkDescription, StorageError> {
        let size = {
            let segment = self.segment(segment_id)?;
            check_coverage(segment.size, range.begin(), range.len(), range)?;
            segment.size
        };
        let mut token = 0u64;
        let mutable_access = matches!(access, AccessMode::Mutable) as u8;
        let code = unsafe {
            (self.library.vtable.chunk_token)(
                self.handle,
                segment_id.value(),
                range.begin().value(),
                range.end().value(),
                mutable_access,
                &mut token,
            )
        };
        check("chunk_token", code)?;
        Ok(ChunkDescription::Foreign(ForeignChunk {
            token,
            size,
            range,
        }))
    }

    // Reference bookkeeping, if any, lives behind the ABI.
    pub fn chunk_release(&mut self, segment_id: SegmentId) -> Result<(), StorageError> {
        self.segment(segment_id).map(|_| ())
    }

    pub fn read_bytes(
        &self,
        segment_id: SegmentId,
        offset: Offset,
        size: Size,
    ) -> Result<Vec<u8>, StorageError> {
        let segment = self.segment(segment_id)?;
        let available = segment
            .size
            .value()
            .saturating_sub(offset.value())
            .min(size.value());
        let mut bytes = vec![0u8; available as usize];
        let moved = unsafe {
            (self.library.vtable.read)(
                self.handle,
                segment_id.value(),
                offset.value(),
                bytes.as_mut_ptr(),
                bytes.len(),
            )
        };
        if moved < 0 {
            return Err(StorageError::Foreign {
                operation: "read",
                code: moved,
            });
        }
        bytes.truncate(moved as usize);
        Ok(bytes)
    }

    pub fn write_bytes(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        bytes: &[u8],
    ) -> Result<Size, StorageError> {
        let segment = self.segment(segment_id)?;
        let length = Size(bytes.len() as u64);
        check_coverage(segment.size, offset, length, Range::with_size(length))?;
        let moved = unsafe {
            (self.library.vtable.write)(
                self.handle,
                segment_id.value(),
                offset.value(),
                bytes.as_ptr() as *mut u8,
                bytes.len(),
            )
        };
        if moved < 0 {
            return Err(StorageError::Foreign {
                operation: "write",
                code: moved,
            });
        }
        Ok(Size(moved as u64))
    }

    pub fn file_read(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        let segment_size = self.segment(segment_id)?.size;
        check_coverage(segment_size, offset, range.len(), range)?;
        if !file.exists() {
            return Err(StorageError::PathDoesNotExist(file.to_owned()));
        }

        use std::os::unix::fs::FileExt;
        let external = std::fs::File::open(file).map_err(|e| StorageError::io(file, e))?;
        let mut bytes = vec![0u8; range.len().value() as usize];
        let read = external
            .read_at(&mut bytes, range.begin().value())
            .map_err(|e| StorageError::io(file, e))?;
        bytes.truncate(read);
        self.write_bytes(segment_id, offset, &bytes)
    }

    pub fn file_write(
        &mut self,
        segment_id: SegmentId,
        offset: Offset,
        file: &Path,
        range: Range,
    ) -> Result<Size, StorageError> {
        let segment_size = self.segment(segment_id)?.size;
        check_coverage(segment_size, offset, range.len(), range)?;

        use std::os::unix::fs::FileExt;
        let bytes = self.read_bytes(segment_id, offset, range.len())?;
        let external = std::fs::File::options()
            .create(true)
            .write(true)
            .open(file)
            .map_err(|e| StorageError::io(file, e))?;
        external
            .write_all_at(&bytes, range.begin().value())
            .map_err(|e| StorageError::io(file, e))?;
        Ok(Size(bytes.len() as u64))
    }

    pub fn destroy(&mut self) {
        let segment_ids: Vec<SegmentId> = self.segments.keys().copied().collect();
        for segment_id in segment_ids {
            if let Err(e) = self.segment_remove(segment_id) {
                tracing::warn!(%segment_id, error = %e, "foreign segment removal failed");
            }
        }
    }
}

impl Drop for ForeignStorage {
    fn drop(&mut self) {
        if unsafe { (self.library.vtable.destroy)(self.handle) } != 0 {
            tracing::warn!(path = %self.library.path.display(), "foreign storage destroy failed");
        }
    }
}
