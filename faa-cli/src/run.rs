//! The `faa run` orchestration flow.
//!
//! Resolves the project, takes the per-project lock, makes sure the
//! supervisor is up (starting it in the background when it is not),
//! reserves a stable route, spawns the dev server with the port injected,
//! registers it, and cleans the record up when the child exits. The
//! supervisor never spawns the dev server itself — it is spawned here so
//! its stdio stays attached to the user's terminal.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use faa_core::config::Config;
use faa_core::devproc::{self, DevProc};
use faa_core::ipc::SetProcessParams;
use faa_core::lock::{Lock, LockError};
use faa_core::port;
use faa_core::project;
use tracing::warn;

use crate::client::Client;

/// Name of the per-project lock file, created in the project root.
pub const PROJECT_LOCK_FILE: &str = ".faa.lock";

const SUPERVISOR_START_TIMEOUT: Duration = Duration::from_secs(5);
const SUPERVISOR_START_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run `command` as the project's dev server. Returns the process exit
/// code to propagate.
pub async fn run(args: &[String], config: &Config) -> Result<i32> {
    let command = split_command(args);
    if command.is_empty() {
        bail!("no command specified. Usage: faa run -- <command> [args...]");
    }

    let cwd = std::env::current_dir().context("failed to get current directory")?;
    let project = project::find_project_root(&cwd)?;
    if project.name.is_empty() {
        bail!(
            "project name in {} yields an empty host label; set a \"name\" with letters or digits",
            project.root.join(project::MANIFEST_FILE).display()
        );
    }
    let host = format!("{}{}", project.name, config.domain_suffix());

    // One orchestrator per project at a time.
    let _project_lock = match Lock::acquire(&project.root.join(PROJECT_LOCK_FILE)) {
        Ok(lock) => lock,
        Err(LockError::Busy) => {
            bail!("another faa instance is already running for this project")
        }
        Err(LockError::Io(err)) => {
            return Err(err).context("failed to acquire project lock");
        }
    };

    ensure_supervisor(config).await?;
    let mut client = Client::connect(config).await?;

    // A live prior run wins; a dead record is cleared and the parked
    // route's port gets reused below.
    if let Some(existing) = client.get_process(&project.root).await? {
        if devproc::is_alive(existing.pid) {
            println!(
                "Already running: https://{} (PID {}, port {})",
                existing.host, existing.pid, existing.port
            );
            return Ok(0);
        }
        client.clear_process(&project.root).await?;
    }

    let existing_port = client.get_route(&host).await?;
    let final_port = if existing_port != 0 && port::is_port_free(existing_port) {
        existing_port
    } else {
        // First run for this host, or the parked port is held by some
        // unrelated listener.
        port::stable_port(&project.name).context("failed to compute stable port")?
    };

    let (command, env) = devproc::inject_port(&command, final_port);

    client.upsert_route(&host, final_port).await?;

    let mut proc = DevProc::start_with_signal_forwarding(&command, &project.root, &env)
        .context("failed to start dev server")?;

    let registration = client
        .set_process(&SetProcessParams {
            project_root: project.root.clone(),
            pid: proc.pid(),
            host: host.clone(),
            port: final_port,
            started_at: Some(Utc::now()),
        })
        .await;
    if let Err(err) = registration {
        if let Err(stop_err) = proc.stop() {
            warn!("failed to stop process after registration failure: {stop_err:#}");
        }
        return Err(err).context("failed to register process");
    }

    println!(
        "Started: https://{host} (PID {}, port {final_port})",
        proc.pid()
    );

    let status = proc.wait().await;

    if let Err(err) = client.clear_process(&project.root).await {
        warn!("failed to clear process from registry during cleanup: {err:#}");
    }

    let status = status?;
    Ok(status.code().unwrap_or(1))
}

/// Split the argument vector at the first `--`; without one, the whole
/// vector is the command.
fn split_command(args: &[String]) -> Vec<String> {
    match args.iter().position(|arg| arg == "--") {
        Some(index) => args[index + 1..].to_vec(),
        None => args.to_vec(),
    }
}

/// Make sure a supervisor is answering on the control socket, starting one
/// in the background when necessary.
pub async fn ensure_supervisor(config: &Config) -> Result<()> {
    if ping_supervisor(config).await {
        return Ok(());
    }

    start_supervisor_in_background().context("failed to start daemon")?;

    let deadline = Instant::now() + SUPERVISOR_START_TIMEOUT;
    while Instant::now() < deadline {
        if ping_supervisor(config).await {
            return Ok(());
        }
        tokio::time::sleep(SUPERVISOR_START_RETRY_DELAY).await;
    }

    bail!(
        "daemon failed to start within {}s. It may require elevated permissions; \
         run 'faa setup' to configure them, or start it manually with 'faa daemon'",
        SUPERVISOR_START_TIMEOUT.as_secs()
    )
}

async fn ping_supervisor(config: &Config) -> bool {
    match Client::connect(config).await {
        Ok(mut client) => client.ping().await.is_ok(),
        Err(_) => false,
    }
}

/// Fork off `faa daemon` with detached stdio. Its lifetime is independent
/// of this invocation; output is observable by running `faa daemon` in the
/// foreground instead.
fn start_supervisor_in_background() -> Result<()> {
    let exe = std::env::current_exe().context("failed to get executable path")?;
    std::process::Command::new(exe)
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to spawn daemon process")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn command_after_separator_wins() {
        let split = split_command(&args(&["--", "node", "server.js"]));
        assert_eq!(split, ["node", "server.js"]);
    }

    #[test]
    fn without_separator_all_args_are_the_command() {
        let split = split_command(&args(&["npm", "run", "dev"]));
        assert_eq!(split, ["npm", "run", "dev"]);
    }

    #[test]
    fn separator_with_nothing_after_is_empty() {
        assert!(split_command(&args(&["--"])).is_empty());
        assert!(split_command(&args(&[])).is_empty());
    }

    #[test]
    fn flags_before_separator_are_dropped() {
        let split = split_command(&args(&["--verbose", "--", "vite"]));
        assert_eq!(split, ["vite"]);
    }
}
