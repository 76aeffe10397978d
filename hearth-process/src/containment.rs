//! Keeping the child from outliving the supervisor.
//!
//! On Unix the child leads its own process group so a forced stop can signal
//! every descendant at once. On Linux it additionally receives `SIGKILL` when
//! the supervisor dies. Platforms without either primitive use
//! [`NoContainment`]; starting the child never fails because containment is
//! unavailable.

use std::io;
use std::sync::Arc;

use tokio::process::Command;

/// OS-level containment applied to the spawned child.
pub trait Containment: Send + Sync + std::fmt::Debug {
    /// Configure `command` before it is spawned.
    fn prepare(&self, command: &mut Command);

    /// Forcefully terminate the child `pid` and everything it started.
    fn kill_tree(&self, pid: u32) -> io::Result<()>;
}

/// No containment; the supervisor only kills the direct child.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContainment;

impl Containment for NoContainment {
    fn prepare(&self, _command: &mut Command) {}

    fn kill_tree(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Dedicated process group, plus parent-death signal on Linux.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroup;

#[cfg(unix)]
impl Containment for ProcessGroup {
    fn prepare(&self, command: &mut Command) {
        command.process_group(0);

        #[cfg(target_os = "linux")]
        {
            // SAFETY: the closure only calls prctl(2), which is async-signal-safe.
            // The signal fires when the spawning thread exits; tokio workers live
            // as long as the runtime.
            unsafe {
                command.pre_exec(|| {
                    nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)
                        .map_err(io::Error::from)
                });
            }
        }
    }

    fn kill_tree(&self, pid: u32) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

/// Best containment available on this platform.
pub fn default_containment() -> Arc<dyn Containment> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroup)
    }
    #[cfg(not(unix))]
    {
        Arc::new(NoContainment)
    }
}
