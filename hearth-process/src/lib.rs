//! Supervision of the game-server child process.
//!
//! [`ProcessSupervisor`] owns the child's lifecycle and its stdin; output
//! from stdout/stderr lands in a shared [`LogStore`]. The [`ServerConsole`]
//! trait is the seam the backup coordinator drives.

pub mod containment;
mod error;
pub mod log_store;
mod supervisor;

pub use containment::{default_containment, Containment, NoContainment};
pub use error::ProcessError;
pub use log_store::LogStore;
pub use supervisor::{
    CommandResponse, ProcessSupervisor, ServerConsole, DEFAULT_STOP_GRACE, RESPONSE_POLL_INTERVAL,
};
