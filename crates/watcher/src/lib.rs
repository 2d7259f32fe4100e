//! Filesystem change notification for Linux
//!
//! Layers a typed event API over inotify, with readiness multiplexing
//! handled by the `netpoll` crate:
//! - Register paths with [`Watcher::add`] and an [`Op`] subscription
//! - Decoded [`Event`]s arrive on a blocking handoff queue
//! - A fatal [`Error`] ends the stream and is reported exactly once
//!
//! ```no_run
//! use watcher::{Op, Watcher};
//!
//! fn main() -> watcher::Result<()> {
//!     let mut w = Watcher::new()?;
//!     w.add("/tmp/config.toml", Op::MODIFY | Op::DELETE)?;
//!     for event in w.events().iter() {
//!         println!("{} {}", event.op, event.path.display());
//!     }
//!     w.close();
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod event;
mod mask;
mod table;
mod watcher;

pub use error::{Error, Result};
pub use event::{Event, Op};
pub use watcher::Watcher;
