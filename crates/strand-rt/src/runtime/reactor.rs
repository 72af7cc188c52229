// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll-based readiness multiplexer.
//!
//! Registrations are one-shot (`EPOLLONESHOT`). A descriptor is attached
//! once, armed with an interest and a waker, and disarmed again when its
//! event is delivered. Further events need a fresh `register`. There is at
//! most one armed registration per descriptor.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::task::Waker;
use std::time::Duration;

use crate::error::Failure;

/// I/O interest for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        let events = match self {
            Interest::Readable => libc::EPOLLIN | libc::EPOLLRDHUP,
            Interest::Writable => libc::EPOLLOUT,
        };
        (events | libc::EPOLLONESHOT) as u32
    }
}

/// Event bits delivered for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u32);

impl Readiness {
    pub const READABLE: Readiness = Readiness(libc::EPOLLIN as u32);
    pub const WRITABLE: Readiness = Readiness(libc::EPOLLOUT as u32);
    pub const ERROR: Readiness = Readiness(libc::EPOLLERR as u32);
    pub const HANGUP: Readiness = Readiness(libc::EPOLLHUP as u32);

    pub fn from_epoll(events: u32) -> Self {
        Readiness(events)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_readable(self) -> bool {
        self.0 & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & libc::EPOLLHUP as u32 != 0
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// Per-FD state. Armed while `waker` is set.
#[derive(Default)]
struct Registration {
    interest: Option<Interest>,
    waker: Option<Waker>,
    last: Option<Readiness>,
}

/// Readiness multiplexer backed by epoll (Linux).
///
/// Owned by one runtime and used only from its thread.
pub struct Reactor {
    epoll_fd: RawFd,
    /// FD → registration mapping.
    registrations: RefCell<HashMap<RawFd, Registration>>,
    max_events: usize,
}

impl Reactor {
    /// Create a new reactor with its own epoll instance.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(epoll_fd, "reactor created");

        Ok(Self {
            epoll_fd,
            registrations: RefCell::new(HashMap::new()),
            max_events: max_events.max(1),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Add a descriptor with an empty interest set.
    ///
    /// I/O handles attach on construction so later registrations are
    /// always a modify.
    pub fn attach(&self, fd: RawFd) -> Result<(), Failure> {
        let mut regs = self.registrations.borrow_mut();
        if regs.contains_key(&fd) {
            return Ok(());
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLONESHOT as u32)
            .map_err(|source| Failure::Register { fd, source })?;
        regs.insert(fd, Registration::default());
        tracing::debug!(fd, "descriptor attached");
        Ok(())
    }

    /// Arm `fd` for `interest`; `waker` fires on the next matching event.
    ///
    /// Re-arming from the same task (a waker that `will_wake` the same
    /// task) refreshes the registration. Arming from anyone else while an
    /// earlier registration is pending fails with `Failure::Busy`.
    pub fn register(&self, fd: RawFd, interest: Interest, waker: &Waker) -> Result<(), Failure> {
        let mut regs = self.registrations.borrow_mut();

        let op = match regs.get(&fd) {
            Some(reg) => {
                if let Some(pending) = &reg.waker {
                    if !pending.will_wake(waker) {
                        return Err(Failure::Busy(fd));
                    }
                }
                libc::EPOLL_CTL_MOD
            }
            None => libc::EPOLL_CTL_ADD,
        };

        self.ctl(op, fd, interest.to_epoll_events())
            .map_err(|source| Failure::Register { fd, source })?;

        let reg = regs.entry(fd).or_default();
        reg.interest = Some(interest);
        reg.waker = Some(waker.clone());
        reg.last = None;
        tracing::trace!(fd, ?interest, "descriptor armed");
        Ok(())
    }

    /// Drop a pending registration without removing the descriptor.
    pub fn disarm(&self, fd: RawFd) {
        let mut regs = self.registrations.borrow_mut();
        let Some(reg) = regs.get_mut(&fd) else {
            return;
        };
        if reg.waker.take().is_none() {
            return;
        }
        reg.interest = None;
        if let Err(err) = self.ctl(libc::EPOLL_CTL_MOD, fd, libc::EPOLLONESHOT as u32) {
            tracing::warn!(fd, %err, "failed to disarm descriptor");
        }
    }

    /// Remove a file descriptor from the reactor.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut regs = self.registrations.borrow_mut();
        if regs.remove(&fd).is_some() {
            let ret = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // ENOENT / EBADF are expected if FD was already closed.
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
            tracing::debug!(fd, "descriptor deregistered");
        }
        Ok(())
    }

    /// Hand one readiness event to its registration.
    ///
    /// Consumes the registration and wakes exactly the waker that armed
    /// it. Returns false if `fd` was not armed. `wait` calls this for each
    /// OS event; tests call it to inject synthetic readiness.
    pub fn deliver(&self, fd: RawFd, readiness: Readiness) -> bool {
        let waker = {
            let mut regs = self.registrations.borrow_mut();
            let Some(reg) = regs.get_mut(&fd) else {
                return false;
            };
            reg.last = Some(readiness);
            reg.interest = None;
            reg.waker.take()
        };

        // Wake outside the borrow: the waker may touch the reactor again.
        match waker {
            Some(waker) => {
                tracing::trace!(fd, events = readiness.bits(), "delivering readiness");
                waker.wake();
                true
            }
            None => false,
        }
    }

    /// Block until a registered descriptor is ready or `timeout` elapses
    /// (`None` waits indefinitely). Returns the number of units woken.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        let timeout_ms = timeout_millis(timeout);

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0); // EINTR: retry next cycle.
            }
            return Err(err);
        }

        let mut woken = 0;
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if self.deliver(fd, Readiness::from_epoll(ev.events)) {
                woken += 1;
            }
        }
        Ok(woken)
    }

    /// Last readiness delivered for `fd` since it was armed.
    pub fn readiness(&self, fd: RawFd) -> Option<Readiness> {
        self.registrations.borrow().get(&fd).and_then(|r| r.last)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.borrow().contains_key(&fd)
    }

    pub fn is_armed(&self, fd: RawFd) -> bool {
        self.registrations
            .borrow()
            .get(&fd)
            .is_some_and(|r| r.waker.is_some())
    }

    pub fn registered_count(&self) -> usize {
        self.registrations.borrow().len()
    }

    /// Registrations still waiting for an event. The scheduler keeps
    /// running while this is non-zero.
    pub fn armed_count(&self) -> usize {
        self.registrations
            .borrow()
            .values()
            .filter(|r| r.waker.is_some())
            .count()
    }

    /// Future resolving on the next readable event for `fd`.
    pub fn readable(self: &Rc<Self>, fd: RawFd) -> super::io::AsyncReady {
        super::io::AsyncReady::new(self.clone(), fd, Interest::Readable)
    }

    /// Future resolving on the next writable event for `fd`.
    pub fn writable(self: &Rc<Self>, fd: RawFd) -> super::io::AsyncReady {
        super::io::AsyncReady::new(self.clone(), fd, Interest::Writable)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Closing the epoll instance drops every interest it holds.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// Round up so a timer a fraction of a millisecond away does not spin.
fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}
