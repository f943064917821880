//! Unlinked temporary files used as the backing store of file-backed mappings.
//!
//! The file is unlinked right after `mkstemp` returns, so its storage is only
//! reachable through the open descriptor and goes away with the last close,
//! even when the process dies without running any cleanup.

use super::vm::VmError;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;

/// Prefix of the `mkstemp` template; six `X`s are appended.
const NAME_PREFIX: &str = "largemem-";

/// Bytes written at the tail of the file to set its length.
const MARKER: [u8; 4] = [0; 4];

/// Create a uniquely named file in `dir` and unlink it immediately.
///
/// # Errors
///
/// `VmError::TempFileFailed` if the template is invalid, `mkstemp` fails, or
/// the directory entry cannot be removed. The descriptor is closed on error.
pub(crate) fn create_unlinked(dir: &Path) -> Result<File, VmError> {
    let template = dir.join(format!("{NAME_PREFIX}XXXXXX"));
    let template = CString::new(template.as_os_str().as_bytes())
        .map_err(|e| VmError::TempFileFailed(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let mut template = template.into_bytes_with_nul();

    // Safety: FFI call to mkstemp; `template` is NUL-terminated and writable.
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast::<libc::c_char>()) };
    if fd < 0 {
        return Err(VmError::TempFileFailed(io::Error::last_os_error()));
    }
    // Safety: mkstemp returned a fresh descriptor that nothing else owns.
    let file = unsafe { File::from_raw_fd(fd) };

    // Safety: FFI call to unlink; mkstemp rewrote the template in place.
    if unsafe { libc::unlink(template.as_ptr().cast::<libc::c_char>()) } != 0 {
        return Err(VmError::TempFileFailed(io::Error::last_os_error()));
    }

    Ok(file)
}

/// Extend `file` to exactly `len` bytes without writing `len` bytes.
///
/// Seeks to the tail and writes a short zeroed marker; the skipped range stays
/// a hole that reads back as zeros.
///
/// # Errors
///
/// `VmError::ResizeFailed` if `len` is zero or the seek or write fails.
pub(crate) fn sparse_resize(file: &mut File, len: usize) -> Result<(), VmError> {
    if len == 0 {
        return Err(VmError::ResizeFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "backing file length must be non-zero",
        )));
    }
    let marker = &MARKER[..MARKER.len().min(len)];
    let offset = (len - marker.len()) as u64;

    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(marker))
        .map_err(VmError::ResizeFailed)
}
