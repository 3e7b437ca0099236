//! Dev-server child processes.
//!
//! Children run in their own process group with stdio attached to the
//! invoking terminal, so the whole tree can be signalled as one unit while
//! output flows to the user. Liveness everywhere in faa is the signal-0
//! probe.

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitStatus;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::warn;

/// A spawned dev server and its process group.
#[derive(Debug)]
pub struct DevProc {
    pid: i32,
    child: Child,
}

impl DevProc {
    /// Spawn `command[0]` with the remaining arguments in `cwd`, in a new
    /// process group, with the parent's environment overlaid by `env` and
    /// stdio inherited.
    pub fn start(command: &[String], cwd: &Path, env: &HashMap<String, String>) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("command cannot be empty");
        };

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;

        let pid = child
            .id()
            .map(|pid| pid as i32)
            .context("child exited before its PID could be read")?;

        Ok(Self { pid, child })
    }

    /// Spawn as [`DevProc::start`] and additionally forward SIGINT/SIGTERM
    /// received by this process to the child's group.
    pub fn start_with_signal_forwarding(
        command: &[String],
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let proc = Self::start(command, cwd, env)?;
        spawn_signal_forwarder(proc.pid)?;
        Ok(proc)
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Wait for the child to exit. Single-shot.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.context("failed to wait for child")
    }

    /// SIGTERM the child's process group. A missing group means it already
    /// exited and is not an error.
    pub fn stop(&self) -> Result<()> {
        stop_group(self.pid)
    }
}

/// SIGTERM an entire process group by its leader PID.
pub fn stop_group(pid: i32) -> Result<()> {
    match kill(Pid::from_raw(-pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context("failed to send SIGTERM to process group"),
    }
}

/// Signal-0 probe: whether a process with `pid` currently exists. Non-
/// positive PIDs are never alive.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Install SIGINT/SIGTERM handlers that terminate the child's process
/// group. The handler task exits after the first signal; the caller's
/// `wait` observes the child's death and drives cleanup from there.
fn spawn_signal_forwarder(pid: i32) -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        eprintln!("\nReceived signal, terminating process...");
        if let Err(err) = stop_group(pid) {
            warn!("failed to stop child process group: {err:#}");
        }
    });

    Ok(())
}

/// Append the `--port` convention to a command and build the matching
/// `PORT` environment overlay.
pub fn inject_port(command: &[String], port: u16) -> (Vec<String>, HashMap<String, String>) {
    let mut args = command.to_vec();
    args.push("--port".to_string());
    args.push(port.to_string());

    let mut env = HashMap::new();
    env.insert("PORT".to_string(), port.to_string());

    (args, env)
}
