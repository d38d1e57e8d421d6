//! OS syscall surface.
//!
//! The flusher never calls the kernel directly; it goes through an OsCalls
//! trait object supplied at construction. Production uses LibcCalls on raw
//! descriptors. Tests substitute a recording mock and script the returned
//! descriptors, which is how the reopen and failure paths are exercised
//! without touching a real filesystem.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc;

/// The three syscalls the flusher is allowed to make. A negative return
/// value from any of them means failure; no errno-specific handling is done
/// above this layer.
pub trait OsCalls: Send + Sync {
    fn open(&self, path: &Path, flags: libc::c_int, mode: libc::mode_t) -> libc::c_int;

    fn write(&self, fd: libc::c_int, buf: &[u8]) -> isize;

    fn close(&self, fd: libc::c_int) -> libc::c_int;
}

/// Real syscalls through libc.
pub struct LibcCalls;

impl OsCalls for LibcCalls {
    fn open(&self, path: &Path, flags: libc::c_int, mode: libc::mode_t) -> libc::c_int {
        let cpath = match CString::new(path.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => return -1,
        };
        unsafe { libc::open(cpath.as_ptr(), flags, mode as libc::c_uint) }
    }

    fn write(&self, fd: libc::c_int, buf: &[u8]) -> isize {
        unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize }
    }

    fn close(&self, fd: libc::c_int) -> libc::c_int {
        unsafe { libc::close(fd) }
    }
}
