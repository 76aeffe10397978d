//! Hearth daemon: supervises the server child and serves the backup
//! scheduler, config watcher and control socket.

mod error;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request, request_backup, request_for_backup, request_log, request_send, request_status,
    request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking};
