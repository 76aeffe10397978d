//! Hearth — Bedrock server host with consistent world backups.
//!
//! # Usage
//!
//! ```text
//! hearth init --exe <path> [--backup-dir <dir>] [--frequency <min>] [--keep <n>]
//! hearth daemon start|stop|status|logs
//! hearth server send <line...> [--timeout-ms <ms>]
//! hearth server log [--lines <n>]
//! hearth server status [--json]
//! hearth server restart
//! hearth backup now|list|delete <name>|restore <name>|config
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    backup::BackupCommand, daemon::DaemonCommand, init::InitArgs, server::ServerCommand,
};

#[derive(Parser, Debug)]
#[command(
    name = "hearth",
    version,
    about = "Run a Bedrock dedicated server and keep consistent world backups",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write ~/.hearth/config.yaml.
    Init(InitArgs),

    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Talk to the supervised server through the daemon.
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },

    /// Trigger, list and manage world backups.
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Server { command } => commands::server::run(command),
        Commands::Backup { command } => commands::backup::run(command),
    }
}
