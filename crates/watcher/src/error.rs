//! Error taxonomy for the watcher engine

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong constructing or running a watcher.
///
/// Per-record oddities (unknown descriptors, unmapped kernel bits,
/// operations outside the registered subscription) are expected races and
/// are dropped silently, not reported here.
#[derive(Debug, Error)]
pub enum Error {
    /// Kernel objects could not be allocated during construction.
    #[error("watcher initialization failed")]
    Init(#[source] io::Error),

    /// A watch could not be registered or updated for one path.
    #[error("failed to register watch for {path:?}")]
    Registration {
        /// The path the registration was attempted for.
        path: PathBuf,
        /// Underlying syscall failure.
        #[source]
        source: io::Error,
    },

    /// The raw record stream was malformed; the engine shuts down.
    #[error("malformed notification stream: {0}")]
    Protocol(&'static str),

    /// The kernel notification source reached end of stream; the engine
    /// shuts down.
    #[error("notification stream closed by the kernel")]
    Eof,

    /// The readiness poller or the notification read failed; the engine
    /// shuts down.
    #[error("readiness poller failed")]
    Poller(#[source] io::Error),

    /// Operation attempted after the watcher shut down.
    #[error("watcher is closed")]
    Closed,
}
