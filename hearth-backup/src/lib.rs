//! # hearth-backup
//!
//! Consistent world backups for a running Bedrock server.
//!
//! [`BackupCoordinator`] drives the `save hold` / `save query` /
//! `save resume` exchange over a [`hearth_process::ServerConsole`], copies
//! the files the server lists, and prunes old backups. The catalogue
//! functions ([`list_backups`], [`delete_backup`], [`restore_backup`]) work
//! on the backup directory directly.

pub mod copy;
pub mod coordinator;
pub mod error;
pub mod manifest;
pub mod restore;
pub mod retention;

pub use coordinator::{
    BackupCoordinator, BackupOutcome, BackupRun, ProtocolTimings, RestoreTicket, TriggerOutcome,
    SAVE_HOLD, SAVE_QUERY, SAVE_RESUME,
};
pub use error::BackupError;
pub use restore::{restore_backup, RestoreReport};
pub use retention::{delete_backup, list_backups, prune, PruneReport};
