use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::debug;

/// OS process operations the session manager relies on. No handle to a
/// spawned process is kept; it is tracked by pid only.
pub trait ExternalProcessHandle: Send + Sync {
    /// Starts `program` in its own process group with stdout and stderr
    /// written to a freshly truncated `log_path`, and returns its pid
    /// without waiting for it.
    fn spawn_detached(&self, program: &str, args: &[String], log_path: &Path) -> Result<u32>;

    /// Whether `pid` names a live process, probed with a null signal.
    fn probe_alive(&self, pid: u32) -> bool;

    fn signal_group(&self, pid: u32, signal: Signal) -> Result<()>;

    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// Real processes, through `std::process` and `nix`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ExternalProcessHandle for SystemProcesses {
    fn spawn_detached(&self, program: &str, args: &[String], log_path: &Path) -> Result<u32> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
        }
        let log = File::create(log_path).with_context(|| format!("open log {:?}", log_path))?;
        let log_err = log.try_clone().context("duplicate log handle")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", program))?;
        let pid = child.id();

        // Reap in the background so an exited child never lingers as a
        // zombie that still answers the liveness probe.
        let reaper = thread::Builder::new()
            .name(format!("reap-{}", pid))
            .spawn(move || {
                let status = child.wait();
                debug!("Capture process {} exited: {:?}", pid, status);
            });
        if let Err(e) = reaper {
            debug!("No reaper thread for {}: {}", pid, e);
        }
        Ok(pid)
    }

    fn probe_alive(&self, pid: u32) -> bool {
        let Some(pid) = to_pid(pid) else {
            return false;
        };
        match kill(pid, None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn signal_group(&self, pid: u32, signal: Signal) -> Result<()> {
        let pgid = to_pid(pid).ok_or_else(|| anyhow!("invalid process group {}", pid))?;
        killpg(pgid, signal).with_context(|| format!("signal process group {}", pid))
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let target = to_pid(pid).ok_or_else(|| anyhow!("invalid pid {}", pid))?;
        kill(target, signal).with_context(|| format!("signal process {}", pid))
    }
}
