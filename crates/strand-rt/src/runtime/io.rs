// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness futures and raw syscall helpers.
//!
//! I/O operations try their syscall first. On `EAGAIN` they await an
//! `AsyncReady` for the matching interest and then retry the syscall once.
//! Another `EAGAIN` simply arms the reactor again.

use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::reactor::{Interest, Reactor, Readiness};
use crate::error::{Failure, Outcome};

/// Future that arms the reactor for `fd` and resolves with the delivered
/// readiness.
///
/// First poll: register with the reactor, return Pending.
/// Later polls: Pending while the registration is still armed (the waker
/// is refreshed), Ready once the event was delivered.
/// Dropping it while armed disarms the descriptor.
pub struct AsyncReady {
    reactor: Rc<Reactor>,
    fd: RawFd,
    interest: Interest,
    registered: bool,
}

impl AsyncReady {
    pub(crate) fn new(reactor: Rc<Reactor>, fd: RawFd, interest: Interest) -> Self {
        Self {
            reactor,
            fd,
            interest,
            registered: false,
        }
    }
}

impl Future for AsyncReady {
    type Output = Outcome<Readiness>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.registered && !self.reactor.is_armed(self.fd) {
            self.registered = false;
            let readiness = self.reactor.readiness(self.fd).unwrap_or_default();
            return Poll::Ready(Ok(readiness));
        }

        // A failed registration resumes the unit with the failure instead
        // of leaving it parked forever.
        if let Err(failure) = self.reactor.register(self.fd, self.interest, cx.waker()) {
            self.registered = false;
            return Poll::Ready(Err(failure));
        }
        self.registered = true;
        Poll::Pending
    }
}

impl Drop for AsyncReady {
    fn drop(&mut self) {
        if self.registered {
            self.reactor.disarm(self.fd);
        }
    }
}

/// `read(2)` into `buf`. `Ok(0)` is end of stream.
pub(crate) fn sys_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// `write(2)` from `buf`.
pub(crate) fn sys_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Run `op` until it stops failing with `EINTR`; on `EAGAIN` wait for
/// `interest` on `fd` and try again.
pub(crate) async fn retry_on_ready<T>(
    reactor: &Rc<Reactor>,
    fd: RawFd,
    interest: Interest,
    mut op: impl FnMut() -> io::Result<T>,
) -> Outcome<T> {
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                AsyncReady::new(reactor.clone(), fd, interest).await?;
            }
            Err(e) => return Err(Failure::Io(e)),
        }
    }
}
