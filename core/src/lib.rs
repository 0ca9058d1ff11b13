//! Local process supervisor with multiplexed live-log streaming.
//!
//! A [`Supervisor`] launches child processes keyed by caller-chosen run
//! ids, captures their merged stdout/stderr as timestamped lines in a
//! bounded per-run buffer, and fans every line out to any number of
//! subscribers — late joiners first receive a bounded replay. Finished
//! runs linger briefly so trailing observers can catch the exit marker,
//! then their records are evicted and the id becomes reusable.
//!
//! The HTTP/SSE transport that exposes this to outside callers is a
//! separate, thin layer speaking the types in [`procmux_protocol`].

mod config;
mod error;
mod log_channel;
mod registry;
mod spawn;
mod supervisor;

pub use config::SupervisorConfig;
pub use error::Result;
pub use error::SupervisorError;
pub use supervisor::RunStream;
pub use supervisor::Supervisor;

pub use procmux_protocol as protocol;
