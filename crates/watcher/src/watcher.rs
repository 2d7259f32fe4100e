//! The engine: inotify descriptor, decode loop, delivery queues

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use netpoll::{PollEvent, Poller, Waker};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{Event, Op};
use crate::mask;
use crate::table::WatchTable;

/// Fixed-size prefix of one raw inotify record: wd, mask, cookie, name len.
const RECORD_HEADER_LEN: usize = mem::size_of::<libc::inotify_event>();

/// Decode buffer size, amortizing many small records per read.
const DECODE_BUF_LEN: usize = RECORD_HEADER_LEN * 4096;

/// State the registration calls share with the decode loop.
struct Shared {
    table: WatchTable,
    closed: AtomicBool,
}

/// Filesystem-notification engine.
///
/// Owns the inotify descriptor and a background decode thread that turns
/// the kernel's raw record stream into [`Event`]s on a blocking handoff
/// queue. Construction starts the engine; [`Watcher::close`] (or drop)
/// shuts it down and disconnects both queues.
pub struct Watcher {
    fd: Option<Arc<OwnedFd>>,
    shared: Arc<Shared>,
    waker: Option<Arc<Waker>>,
    shutdown: Option<Sender<()>>,
    events: Receiver<Event>,
    errors: Receiver<Error>,
    decode: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Construct and start the engine with the default poller capacity.
    pub fn new() -> Result<Self> {
        Self::with_event_capacity(netpoll::DEFAULT_EVENT_CAPACITY)
    }

    /// Construct and start the engine with a custom readiness buffer
    /// capacity for the underlying poller.
    pub fn with_event_capacity(capacity: usize) -> Result<Self> {
        let poller = Poller::with_event_capacity(capacity).map_err(Error::Init)?;

        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Init(io::Error::last_os_error()));
        }
        let fd = Arc::new(unsafe { OwnedFd::from_raw_fd(fd) });

        poller.register_read(fd.as_raw_fd()).map_err(Error::Init)?;

        let (event_tx, event_rx) = bounded(0);
        // Capacity one: the single fatal error must not wedge shutdown
        // behind an inattentive consumer.
        let (error_tx, error_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded(0);

        let shared = Arc::new(Shared {
            table: WatchTable::default(),
            closed: AtomicBool::new(false),
        });
        let waker = poller.waker();

        let mut decode = DecodeLoop {
            poller,
            fd: Arc::clone(&fd),
            shared: Arc::clone(&shared),
            events: event_tx,
            errors: error_tx,
            shutdown: shutdown_rx,
            buf: vec![0u8; DECODE_BUF_LEN],
        };
        let handle = std::thread::Builder::new()
            .name("watcher-decode".into())
            .spawn(move || decode.run())
            .map_err(Error::Init)?;

        debug!("watcher engine started");
        Ok(Self {
            fd: Some(fd),
            shared,
            waker: Some(waker),
            shutdown: Some(shutdown_tx),
            events: event_rx,
            errors: error_rx,
            decode: Some(handle),
        })
    }

    /// Register interest in `path`.
    ///
    /// An empty `op` subscribes to every operation. Re-adding a watched
    /// path replaces its subscription instead of creating a second kernel
    /// registration.
    pub fn add(&self, path: impl AsRef<Path>, op: Op) -> Result<()> {
        let fd = self.notify_fd()?;
        let op = if op.is_empty() { Op::ALL } else { op };
        let path = path.as_ref();
        let kernel_mask = mask::encode(op);
        self.shared
            .table
            .add(path, kernel_mask, |cleaned| {
                inotify_add_watch(fd, cleaned, kernel_mask)
            })
            .map_err(|source| Error::Registration {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), %op, "watch registered");
        Ok(())
    }

    /// Stop watching `path`.
    ///
    /// Unknown paths are rejected so callers can tell a typo from a
    /// successful removal.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let fd = self.notify_fd()?;
        let path = path.as_ref();
        let watch = self
            .shared
            .table
            .remove(path)
            .ok_or_else(|| Error::Registration {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })?;
        let ret = unsafe { libc::inotify_rm_watch(fd, watch.wd) };
        if ret < 0 {
            let source = io::Error::last_os_error();
            // The kernel retires the descriptor on its own when the watched
            // target disappears.
            if source.raw_os_error() != Some(libc::EINVAL) {
                return Err(Error::Registration {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
        debug!(path = %path.display(), "watch removed");
        Ok(())
    }

    /// Snapshot of the currently registered paths.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.shared.table.paths()
    }

    /// Delivery queue of decoded events; disconnects when the engine stops.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Delivery queue for the single fatal error, if any; disconnects when
    /// the engine stops.
    pub fn errors(&self) -> &Receiver<Error> {
        &self.errors
    }

    /// Shut the engine down and wait for the decode thread to exit.
    ///
    /// Both delivery queues disconnect and every descriptor is closed
    /// before this returns. Subsequent calls are no-ops.
    pub fn close(&mut self) {
        let Some(handle) = self.decode.take() else {
            return;
        };
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
        // Unblocks a handoff stalled on a consumer that stopped draining.
        self.shutdown.take();
        if handle.join().is_err() {
            warn!("decode thread panicked during shutdown");
        }
        self.fd.take();
    }

    fn notify_fd(&self) -> Result<RawFd> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match &self.fd {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(Error::Closed),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn inotify_add_watch(fd: RawFd, path: &Path, mask: u32) -> io::Result<i32> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let wd = unsafe { libc::inotify_add_watch(fd, cpath.as_ptr(), mask) };
    if wd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(wd)
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    i32::from_ne_bytes(raw)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_ne_bytes(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Background half of the engine: waits for readiness, reads and decodes
/// raw records, performs the blocking handoff to the consumer.
struct DecodeLoop {
    poller: Poller,
    fd: Arc<OwnedFd>,
    shared: Arc<Shared>,
    events: Sender<Event>,
    errors: Sender<Error>,
    shutdown: Receiver<()>,
    buf: Vec<u8>,
}

impl DecodeLoop {
    fn run(&mut self) {
        if let Err(err) = self.drive() {
            warn!(error = %err, "watcher engine stopped");
            let _ = self.errors.send(err);
        }
        self.shared.table.clear();
        self.shared.closed.store(true, Ordering::Release);
        debug!("decode loop exited");
        // Dropping self closes the poller and disconnects both queues.
    }

    /// Core loop; returns `Ok(())` on an orderly wake, `Err` on anything
    /// fatal to the record stream.
    fn drive(&mut self) -> Result<()> {
        let mut ready: Vec<PollEvent> = Vec::new();
        loop {
            self.poller.wait(&mut ready).map_err(Error::Poller)?;

            let mut woke = false;
            for entry in &ready {
                if self.poller.is_wake(entry) {
                    self.poller.clear_wake().map_err(Error::Poller)?;
                    woke = true;
                    continue;
                }
                if entry.fd != self.fd.as_raw_fd() {
                    // No other descriptors are ever registered.
                    continue;
                }
                if self.drain()? == Flow::Stop {
                    return Ok(());
                }
            }
            if woke {
                return Ok(());
            }
        }
    }

    /// Read whatever the kernel buffered and decode the records.
    fn drain(&mut self) -> Result<Flow> {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // Nothing buffered, or a signal landed mid-read: zero records
            // this pass.
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(Flow::Continue),
                _ => Err(Error::Poller(err)),
            };
        }
        self.decode_chunk(n as usize)
    }

    /// Walk `n` bytes of back-to-back records at the head of the buffer.
    ///
    /// Each record is a fixed header followed by a variable-length trailing
    /// name, which the engine ignores: events are named by the registered
    /// path of their watch descriptor.
    fn decode_chunk(&self, n: usize) -> Result<Flow> {
        if n == 0 {
            return Err(Error::Eof);
        }
        if n < RECORD_HEADER_LEN {
            return Err(Error::Protocol("short read"));
        }

        let mut offset = 0;
        while offset + RECORD_HEADER_LEN <= n {
            let header = &self.buf[offset..offset + RECORD_HEADER_LEN];
            let wd = read_i32(&header[0..4]);
            let kernel_mask = read_u32(&header[4..8]);
            let name_len = read_u32(&header[12..16]) as usize;

            let next = offset + RECORD_HEADER_LEN + name_len;
            if next > n {
                return Err(Error::Protocol("record name overruns buffer"));
            }

            if self.handle_record(wd, kernel_mask) == Flow::Stop {
                return Ok(Flow::Stop);
            }
            offset = next;
        }
        Ok(Flow::Continue)
    }

    /// Route one raw record: translate the mask, resolve the descriptor,
    /// filter against the registered subscription, deliver.
    fn handle_record(&self, wd: i32, kernel_mask: u32) -> Flow {
        let Some(op) = mask::decode(kernel_mask) else {
            trace!(wd, kernel_mask, "record carries no mapped operation");
            return Flow::Continue;
        };
        let Some((path, registered_mask)) = self.shared.table.route(wd, op) else {
            trace!(wd, "record for an unregistered descriptor");
            return Flow::Continue;
        };
        if registered_mask & kernel_mask == 0 {
            trace!(path = %path.display(), "operation outside the registered subscription");
            return Flow::Continue;
        }
        self.deliver(Event { path, op })
    }

    /// Blocking handoff to the consumer.
    ///
    /// Unblocks when the consumer takes the event, drops its receiver, or
    /// shutdown is requested.
    fn deliver(&self, event: Event) -> Flow {
        select! {
            send(self.events, event) -> res => match res {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Stop,
            },
            recv(self.shutdown) -> _ => {
                // Shutdown raced the handoff: hand the event over if a
                // consumer is waiting right now, then stop either way.
                let _ = self.events.try_send(event);
                Flow::Stop
            }
        }
    }
}
