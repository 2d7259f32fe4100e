//! Linux `epoll` poller with an eventfd wake channel

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Readiness bits registered for read interest.
const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;

/// Readiness bits registered for write interest.
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;

/// Default capacity of the reusable readiness buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 512;

/// One ready descriptor reported by [`Poller::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    /// Descriptor that became ready.
    pub fd: RawFd,
    /// Read readiness (includes error/hangup conditions).
    pub readable: bool,
    /// Write readiness.
    pub writable: bool,
}

/// Wake handle for a [`Poller`].
///
/// Writing to the internal eventfd forces a blocked [`Poller::wait`] to
/// return with the wake descriptor flagged ready. The handle owns a
/// reference to the descriptor, so a late `wake()` can never land on a
/// recycled descriptor number.
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    /// Interrupt a blocked [`Poller::wait`] from any thread.
    ///
    /// Wakes stacked before the loop observes one are coalesced by the
    /// eventfd counter, but at least one wake-up is guaranteed.
    pub fn wake(&self) {
        let one: u64 = 1;
        let ret =
            unsafe { libc::write(self.fd.as_raw_fd(), &one as *const u64 as *const libc::c_void, 8) };
        if ret < 0 {
            tracing::trace!(error = %io::Error::last_os_error(), "wake write failed");
        }
    }
}

/// Readiness poller over a set of registered descriptors.
///
/// Owns the epoll instance, the wake eventfd, and a reusable event buffer.
/// Only one concurrent [`Poller::wait`] call is supported. Dropping the
/// poller closes the epoll object; the wake descriptor closes once the last
/// [`Waker`] handle goes with it.
pub struct Poller {
    epoll: OwnedFd,
    waker: Arc<Waker>,
    capacity: usize,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    /// Create a poller with the default readiness buffer capacity.
    pub fn new() -> io::Result<Self> {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a poller whose readiness buffer holds `capacity` entries.
    ///
    /// Allocates the epoll instance and the wake eventfd, and registers the
    /// eventfd for read readiness. Every descriptor opened before a failure
    /// is closed again before this returns.
    pub fn with_event_capacity(capacity: usize) -> io::Result<Self> {
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let wake = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake = unsafe { OwnedFd::from_raw_fd(wake) };

        let capacity = capacity.max(1);
        let poller = Self {
            epoll,
            waker: Arc::new(Waker { fd: wake }),
            capacity,
            events: Vec::with_capacity(capacity),
        };
        poller.register_read(poller.waker.fd.as_raw_fd())?;
        Ok(poller)
    }

    /// Register `fd` for read readiness.
    pub fn register_read(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, READ_EVENTS)
    }

    /// Register `fd` for write readiness.
    pub fn register_write(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, WRITE_EVENTS)
    }

    /// Register `fd` for both read and write readiness.
    pub fn register_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, READ_EVENTS | WRITE_EVENTS)
    }

    fn register(&self, fd: RawFd, interest: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: fd as u64,
        };
        let ret = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Hand out a wake handle usable from other threads.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Block until at least one registered descriptor is ready.
    ///
    /// Clears and refills `ready` with at most the configured capacity.
    /// Interrupted and empty waits are retried, so a successful return
    /// always carries at least one entry.
    pub fn wait(&mut self, ready: &mut Vec<PollEvent>) -> io::Result<()> {
        let capacity = self.capacity;
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    capacity as i32,
                    -1,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                continue;
            }
            // The kernel wrote `n` initialized entries.
            unsafe { self.events.set_len(n as usize) };
            break;
        }

        ready.clear();
        for event in &self.events {
            let flags = event.events;
            ready.push(PollEvent {
                fd: event.u64 as RawFd,
                readable: flags & (READ_EVENTS | (libc::EPOLLERR | libc::EPOLLHUP) as u32) != 0,
                writable: flags & WRITE_EVENTS != 0,
            });
        }
        Ok(())
    }

    /// True iff this ready entry is the internal wake descriptor.
    pub fn is_wake(&self, event: &PollEvent) -> bool {
        event.fd == self.waker.fd.as_raw_fd()
    }

    /// Drain the pending wake signal after observing one.
    ///
    /// Skipping the drain leaves the eventfd readable and the next
    /// [`Poller::wait`] returns immediately. Finding nothing to drain is
    /// not an error.
    pub fn clear_wake(&self) -> io::Result<()> {
        let mut count: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.waker.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}
