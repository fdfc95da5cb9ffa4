//! File-range copies via the most efficient available syscall.
//!
//! `copy_file_range` moves bytes entirely in the kernel; it fails with
//! EXDEV when source and destination sit on different filesystems, in which
//! case `sendfile` takes over. Both update the passed offsets and may move
//! fewer bytes than asked, so callers loop.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

/// Copy up to `len` bytes from `src` at `src_offset` to `dst` at
/// `dst_offset`. Returns the number of bytes actually copied, which may be
/// short when the source ends early.
pub fn copy_range(
    src: &File,
    mut src_offset: i64,
    dst: &File,
    mut dst_offset: i64,
    len: u64,
) -> io::Result<u64> {
    let mut remaining = len;
    let mut copied = 0u64;
    let mut use_sendfile = false;

    while remaining > 0 {
        let moved = if use_sendfile {
            sendfile_once(src, &mut src_offset, dst, &mut dst_offset, remaining)?
        } else {
            match copy_file_range_once(src, &mut src_offset, dst, &mut dst_offset, remaining) {
                Ok(moved) => moved,
                Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                    use_sendfile = true;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };
        if moved == 0 {
            break;
        }
        copied += moved;
        remaining -= moved;
    }
    Ok(copied)
}

fn copy_file_range_once(
    src: &File,
    src_offset: &mut i64,
    dst: &File,
    dst_offset: &mut i64,
    len: u64,
) -> io::Result<u64> {
    let moved = unsafe {
        libc::copy_file_range(
            src.as_raw_fd(),
            src_offset as *mut i64,
            dst.as_raw_fd(),
            dst_offset as *mut i64,
            len as usize,
            0,
        )
    };
    if moved < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(moved as u64)
}

/// One sendfile step. sendfile only advances the input offset, so the
/// destination file position is set explicitly first.
fn sendfile_once(
    src: &File,
    src_offset: &mut i64,
    dst: &File,
    dst_offset: &mut i64,
    len: u64,
) -> io::Result<u64> {
    let seeked = unsafe { libc::lseek(dst.as_raw_fd(), *dst_offset, libc::SEEK_SET) };
    if seeked < 0 {
        return Err(io::Error::last_os_error());
    }
    let moved = unsafe {
        libc::sendfile(
            dst.as_raw_fd(),
            src.as_raw_fd(),
            src_offset as *mut i64,
            len as usize,
        )
    };
    if moved < 0 {
        return Err(io::Error::last_os_error());
    }
    *dst_offset += moved as i64;
    Ok(moved as u64)
}
