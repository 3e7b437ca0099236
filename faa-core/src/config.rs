//! Filesystem layout and environment-derived settings.
//!
//! All paths are resolved once at startup and treated as immutable for the
//! life of the process. The on-disk contract lives under `~/.config/faa`:
//! `ctl.sock`, `daemon.lock`, `daemon.pid`, `routes.json`, `processes.json`
//! and the exported CA certificate `root.pem`.

use std::path::{Path, PathBuf};

use directories::UserDirs;
use thiserror::Error;

/// Environment variable overriding the control socket directory. Set when
/// the daemon runs system-wide (e.g. as a macOS LaunchDaemon) and clients
/// of all users need to reach it.
pub const SOCKET_DIR_ENV: &str = "FAA_SOCKET_DIR";

/// Environment variable overriding the hosts file path (tests, non-root).
pub const HOSTS_PATH_ENV: &str = "FAA_HOSTS_PATH";

const SOCKET_FILE: &str = "ctl.sock";
const LOCK_FILE: &str = "daemon.lock";
const PID_FILE: &str = "daemon.pid";
const ROUTES_FILE: &str = "routes.json";
const PROCESSES_FILE: &str = "processes.json";
const CA_EXPORT_FILE: &str = "root.pem";

/// Default domain suffix appended to host labels.
pub const DEFAULT_DOMAIN_SUFFIX: &str = ".local";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to resolve home directory")]
    NoHome,
}

/// Resolved configuration for one process.
#[derive(Debug, Clone)]
pub struct Config {
    config_dir: PathBuf,
    socket_dir: PathBuf,
    /// True when the socket lives in a shared directory and must be
    /// world-connectable (mode 0666 instead of 0600).
    shared_socket: bool,
    hosts_path: PathBuf,
    domain_suffix: String,
    /// Suffixes that mDNS does not resolve; these are synced into the
    /// hosts file instead.
    hosts_file_suffixes: Vec<String>,
}

impl Config {
    /// Derive the configuration from the environment (`HOME`,
    /// `FAA_SOCKET_DIR`, `FAA_HOSTS_PATH`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or(ConfigError::NoHome)?;
        let config_dir = home.join(".config").join("faa");

        let (socket_dir, shared_socket) = match std::env::var_os(SOCKET_DIR_ENV) {
            Some(dir) if !dir.is_empty() => (PathBuf::from(dir), true),
            _ => (config_dir.clone(), false),
        };

        let hosts_path = match std::env::var_os(HOSTS_PATH_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from("/etc/hosts"),
        };

        Ok(Self {
            config_dir,
            socket_dir,
            shared_socket,
            hosts_path,
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            hosts_file_suffixes: vec![".lab".to_string()],
        })
    }

    /// Configuration rooted at an explicit directory. The socket and hosts
    /// file live under the same directory; used by tests.
    pub fn with_config_dir(dir: impl Into<PathBuf>) -> Self {
        let config_dir = dir.into();
        Self {
            socket_dir: config_dir.clone(),
            shared_socket: false,
            hosts_path: config_dir.join("hosts"),
            config_dir,
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            hosts_file_suffixes: vec![".lab".to_string()],
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(SOCKET_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config_dir.join(LOCK_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.config_dir.join(PID_FILE)
    }

    pub fn routes_path(&self) -> PathBuf {
        self.config_dir.join(ROUTES_FILE)
    }

    pub fn processes_path(&self) -> PathBuf {
        self.config_dir.join(PROCESSES_FILE)
    }

    pub fn ca_export_path(&self) -> PathBuf {
        self.config_dir.join(CA_EXPORT_FILE)
    }

    pub fn hosts_path(&self) -> &Path {
        &self.hosts_path
    }

    pub fn domain_suffix(&self) -> &str {
        &self.domain_suffix
    }

    pub fn hosts_file_suffixes(&self) -> &[String] {
        &self.hosts_file_suffixes
    }

    /// Unix permission bits for the control socket: 0666 in shared-service
    /// mode, 0600 otherwise.
    pub fn socket_mode(&self) -> u32 {
        if self.shared_socket {
            0o666
        } else {
            0o600
        }
    }
}
