//! Kernel pipe creation and the `splice(2)` wrapper.
//!
//! Grounded on `original_source/src/server_ctx.c`'s direct `pipe()` +
//! `splice()` calls; `pipe2(O_NONBLOCK)` replaces `pipe()` + a separate
//! `fcntl(F_SETFL, O_NONBLOCK)` pair, which is the idiomatic way to get
//! an atomically-non-blocking pipe in a `libc`-based Rust crate.

use std::io;
use std::os::fd::RawFd;

/// A single large sentinel capping one `splice()` call's requested
/// length when draining a socket into its pipe. Actual movement is
/// still bounded by pipe capacity and OS policy. Matches
/// `MAX_SPLICE_AT_ONCE` in the original implementation.
pub const MAX_SPLICE_AT_ONCE: usize = 1 << 30;

/// Create an anonymous, non-blocking kernel pipe. If `requested_size`
/// is non-zero, best-effort request that capacity via `F_SETPIPE_SZ` on
/// the read end — failure to resize is not fatal, the pipe still works
/// at its default capacity.
pub fn create_pipe(requested_size: usize) -> io::Result<(RawFd, RawFd)> {
    let mut fds = [-1i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    if requested_size > 0 {
        unsafe {
            libc::fcntl(fds[0], libc::F_SETPIPE_SZ, requested_size as libc::c_int);
        }
    }

    Ok((fds[0], fds[1]))
}

/// Outcome of one `splice()` call, already stripped of the
/// EINTR-retries / EAGAIN-ambiguity handling so callers can match on it
/// directly.
pub enum SpliceOutcome {
    /// `n` bytes moved.
    Moved(usize),
    /// Source (socket) empty or sink (pipe) full — the disambiguation
    /// spec.md §4.6 calls out as unavoidable from `EAGAIN` alone.
    WouldBlock,
    /// The source returned EOF (0 bytes, no error).
    Eof,
    /// Any other error.
    Err(io::Error),
}

/// Move up to `len` bytes from `fd_in` to `fd_out` (one fd must be a
/// pipe end) with `SPLICE_F_MOVE | SPLICE_F_NONBLOCK`. Retries
/// internally on `EINTR`.
pub fn splice(fd_in: RawFd, fd_out: RawFd, len: usize) -> SpliceOutcome {
    loop {
        let ret = unsafe {
            libc::splice(
                fd_in,
                std::ptr::null_mut(),
                fd_out,
                std::ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
            )
        };

        if ret > 0 {
            return SpliceOutcome::Moved(ret as usize);
        }
        if ret == 0 {
            return SpliceOutcome::Eof;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return SpliceOutcome::WouldBlock,
            _ => return SpliceOutcome::Err(err),
        }
    }
}

/// Close a raw fd if it's live, idempotently.
pub fn close_if_live(fd: &mut RawFd) {
    if *fd >= 0 {
        unsafe { libc::close(*fd) };
        *fd = -1;
    }
}
