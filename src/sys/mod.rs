//! Raw OS layer: typed wrappers over the system calls the runtime needs.
//!
//! Everything in here goes through the `syscall!` macro and returns
//! `io::Result`, so errno handling lives in exactly one place.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Once;

mod net;
mod socket;

pub(crate) use socket::Socket;

/// Installs a process-wide ignore handler for `SIGPIPE`, once.
///
/// A write to a half-closed peer must surface as `EPIPE` from the write
/// call instead of terminating the process.
pub(crate) fn ignore_sigpipe() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Creates the loop's wake-up descriptor.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are added to the count; reads reset the count to 0.
/// One unread write is enough to make the next poll return.
pub(crate) fn create_event_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates the timer queue's driving descriptor.
///
/// `CLOCK_MONOTONIC` keeps expirations immune to wall-clock adjustment,
/// matching the `Instant`-based bookkeeping of the timer queue.
pub(crate) fn create_timer_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Opens the acceptor's idle sentinel descriptor.
pub(crate) fn open_idle_fd() -> io::Result<OwnedFd> {
    File::open("/dev/null").map(OwnedFd::from)
}
