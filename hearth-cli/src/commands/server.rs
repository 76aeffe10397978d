//! `hearth server` — console access to the supervised server.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::Value;

use hearth_daemon::{request, request_log, request_send, request_status, DaemonRequest};

use super::{home_dir, print_json};

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    /// Write one line to the server console.
    Send(SendArgs),
    /// Print captured console output.
    Log(LogArgs),
    /// Show process state, pid, uptime and memory.
    Status(StatusArgs),
    /// Stop the server, wait, and start it again.
    Restart,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Command text, e.g. `say hello` or `list`.
    #[arg(required = true, trailing_var_arg = true)]
    pub line: Vec<String>,

    /// Wait this long for output and print it.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Only the last N lines.
    #[arg(long)]
    pub lines: Option<usize>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(command: ServerCommand) -> Result<()> {
    let home = home_dir()?;

    match command {
        ServerCommand::Send(args) => {
            let line = args.line.join(" ");
            let timeout = args.timeout_ms.map(Duration::from_millis);
            let data = request_send(&home, &line, timeout)
                .with_context(|| format!("failed to send '{line}'"))?;
            match data.get("output") {
                Some(Value::String(output)) => println!("{output}"),
                Some(_) => println!("(no output)"),
                None => println!("sent: {line}"),
            }
        }
        ServerCommand::Log(args) => {
            let data = request_log(&home, args.lines).context("failed to fetch console log")?;
            if let Some(log) = data.get("log").and_then(Value::as_str) {
                println!("{}", log.trim_end());
            }
        }
        ServerCommand::Status(args) => {
            let status = request_status(&home).context("failed to query daemon status")?;
            if args.json {
                print_json(&status["server"])?;
            } else {
                print_status(&status);
            }
        }
        ServerCommand::Restart => {
            let data = request(&home, &DaemonRequest::new("restart"))
                .context("failed to restart server")?;
            match data.get("pid").and_then(Value::as_u64) {
                Some(pid) => println!("✓ Server restarted (pid {pid})"),
                None => println!("✓ Server restarted"),
            }
        }
    }

    Ok(())
}

fn print_status(status: &Value) {
    let server = &status["server"];
    let state = server["state"].as_str().unwrap_or("unknown");
    let label = match state {
        "running" => state.green().bold(),
        "exited" => state.red().bold(),
        _ => state.bright_black().bold(),
    };

    println!("server:      {label}");
    if let Some(pid) = server["pid"].as_u64() {
        println!("pid:         {pid}");
    }
    if let Some(uptime) = server["uptime_secs"].as_u64() {
        println!("uptime:      {}", format_uptime(uptime));
    }
    if let Some(code) = server["exit_code"].as_i64() {
        println!("exit code:   {code}");
    }
    if let Some(rss) = server["memory_rss_bytes"].as_u64() {
        println!("memory:      {:.1} MiB", rss as f64 / (1024.0 * 1024.0));
    }
    if let Some(level) = status["level_name"].as_str() {
        println!("level:       {level}");
    }
    if let Some(world) = status["world_path"].as_str() {
        println!("world:       {world}");
    }
    if let Some(minutes) = status["backup"]["frequency_minutes"].as_u64() {
        println!("backups:     every {minutes} min");
    }
}

fn format_uptime(secs: u64) -> String {
    let (hours, rest) = (secs / 3600, secs % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_compact() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(3 * 3600 + 61), "3h 1m");
    }
}
