//! Completion monitoring for submitted jobs.
//!
//! The monitor polls a job handle at a fixed interval, streams new log bytes
//! to a callback, and ends in one of three outcomes:
//!
//! ```text
//!             exit 0
//!           ┌────────► Success
//!           │
//! Pending ──┼────────► Failure(code)   exit != 0
//!    ▲  │   │
//!    └──┘   └────────► Timeout         elapsed >= max_wait
//!  pending / query error
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use shard_launch::monitor::{CompletionMonitor, WatchOptions};
//! use std::io::Write;
//! use std::time::Duration;
//!
//! let options = WatchOptions::new(Duration::from_secs(30), Duration::from_secs(6 * 3600));
//! let mut monitor = CompletionMonitor::new(backend, options);
//! let state = monitor
//!     .watch(&handle, |bytes| {
//!         let _ = std::io::stdout().write_all(bytes);
//!     })
//!     .await?;
//! println!("{}", state.outcome);
//! ```

pub mod clock;
pub mod state;
pub mod watcher;

pub use clock::{Clock, ManualClock, TokioClock};
pub use state::{MonitorState, Outcome};
pub use watcher::{watch, CompletionMonitor, WatchOptions, DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL};
