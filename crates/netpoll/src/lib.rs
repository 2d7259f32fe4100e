//! Readiness multiplexing for the watcher engine
//!
//! Wraps Linux `epoll` with:
//! - A reusable fixed-capacity readiness buffer
//! - An always-registered `eventfd` wake descriptor for cooperative shutdown
//! - Transparent `EINTR` retry, so a successful wait always carries events

pub mod poller;

pub use poller::{PollEvent, Poller, Waker, DEFAULT_EVENT_CAPACITY};
