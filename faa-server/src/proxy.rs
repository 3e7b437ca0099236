//! Controller for the Caddy reverse proxy.
//!
//! The supervisor owns a single `caddy run` child and drives it entirely
//! through its admin endpoint: route snapshots are translated into a full
//! Caddy configuration document and handed to `POST /load`. Caddy
//! terminates TLS with its internal CA, so every registered host gets a
//! locally-issued certificate without any per-host setup.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_ADMIN_PORT: u16 = 2019;

const READY_ATTEMPTS: u32 = 50;
const READY_DELAY: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy is already running")]
    AlreadyRunning,
    #[error("failed to spawn caddy: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("proxy exited during startup ({0}); is its admin port already in use?")]
    Exited(std::process::ExitStatus),
    #[error("proxy did not become ready on its admin endpoint")]
    NotReady,
    #[error("failed to apply proxy configuration: {0}")]
    Apply(String),
}

#[derive(Default)]
struct ProxyState {
    routes: BTreeMap<String, u16>,
    child: Option<Child>,
}

/// Owns the reverse-proxy child process and the routes snapshot applied to
/// it. All configuration changes are serialized behind the internal lock.
pub struct ProxyController {
    command: String,
    http_port: u16,
    https_port: u16,
    admin_port: u16,
    client: reqwest::Client,
    state: RwLock<ProxyState>,
}

impl Default for ProxyController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyController {
    /// Controller for the standard ports (80/443, admin on 2019).
    pub fn new() -> Self {
        Self::with_ports(DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, DEFAULT_ADMIN_PORT)
    }

    /// Controller with custom ports, for unprivileged test runs.
    pub fn with_ports(http_port: u16, https_port: u16, admin_port: u16) -> Self {
        Self {
            command: "caddy".to_string(),
            http_port,
            https_port,
            admin_port,
            client: reqwest::Client::new(),
            state: RwLock::new(ProxyState::default()),
        }
    }

    /// Override the proxy binary (tests).
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    fn admin_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.admin_port)
    }

    /// Start the proxy child and load the current snapshot into it.
    /// Starting an already-started controller is an error; `stop` first.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut state = self.state.write().await;
        if state.child.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        // Boot with an admin-only config; routes are loaded through the
        // admin endpoint once it answers.
        let mut child = Command::new(&self.command)
            .args(["run", "--config", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let boot_config = json!({
            "admin": { "listen": format!("localhost:{}", self.admin_port) },
        });
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(boot_config.to_string().as_bytes()).await?;
        }

        if let Err(err) = self.wait_ready(&mut child).await {
            terminate(&mut child).await;
            return Err(err);
        }

        let config = build_config(
            &state.routes,
            self.http_port,
            self.https_port,
            self.admin_port,
        );
        if let Err(err) = self.load(&config).await {
            terminate(&mut child).await;
            return Err(err);
        }

        info!(
            "proxy running on ports {}/{} (admin {})",
            self.http_port, self.https_port, self.admin_port
        );
        state.child = Some(child);
        Ok(())
    }

    async fn wait_ready(&self, child: &mut Child) -> Result<(), ProxyError> {
        let url = self.admin_url("/config/");
        for _ in 0..READY_ATTEMPTS {
            // A child that dies here most likely lost the admin-port bind;
            // probing on would answer against whoever holds the port.
            if let Some(status) = child.try_wait()? {
                return Err(ProxyError::Exited(status));
            }
            if self.client.get(&url).send().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(READY_DELAY).await;
        }
        Err(ProxyError::NotReady)
    }

    async fn load(&self, config: &Value) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.admin_url("/load"))
            .json(config)
            .send()
            .await
            .map_err(|err| ProxyError::Apply(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Apply(format!("{status}: {body}")));
        }
        Ok(())
    }

    /// Stop the proxy child. Idempotent; stopping a stopped controller is
    /// a no-op.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        let Some(mut child) = state.child.take() else {
            return;
        };
        terminate(&mut child).await;
        info!("proxy stopped");
    }

    /// Replace the proxy's rule set with `snapshot`.
    ///
    /// When the proxy is not running the snapshot is stored for the next
    /// `start`. When a reload fails the previously applied snapshot stays
    /// authoritative and the error surfaces to the caller.
    pub async fn apply_routes(&self, snapshot: BTreeMap<String, u16>) -> Result<(), ProxyError> {
        let mut state = self.state.write().await;
        if state.child.is_none() {
            debug!("proxy not running; storing {} route(s) for next start", snapshot.len());
            state.routes = snapshot;
            return Ok(());
        }

        let config = build_config(
            &snapshot,
            self.http_port,
            self.https_port,
            self.admin_port,
        );
        self.load(&config).await?;
        state.routes = snapshot;
        Ok(())
    }

    /// The routes snapshot the controller currently considers applied.
    pub async fn routes(&self) -> BTreeMap<String, u16> {
        self.state.read().await.routes.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.child.is_some()
    }
}

/// SIGTERM the child, escalating to SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!("failed to signal proxy: {err}"),
        }
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("proxy did not exit after SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

/// Build the full Caddy configuration document for a routes snapshot:
/// an HTTP redirector to HTTPS, one Host-matched reverse-proxy rule per
/// route, and TLS automation backed by the internal CA. The internal CA
/// has no OCSP responder, so stapling is off.
fn build_config(
    routes: &BTreeMap<String, u16>,
    http_port: u16,
    https_port: u16,
    admin_port: u16,
) -> Value {
    let https_routes: Vec<Value> = routes
        .iter()
        .map(|(host, port)| {
            json!({
                "match": [ { "host": [host] } ],
                "handle": [
                    {
                        "handler": "reverse_proxy",
                        "upstreams": [ { "dial": format!("127.0.0.1:{port}") } ],
                    }
                ],
            })
        })
        .collect();

    json!({
        "admin": { "listen": format!("localhost:{admin_port}") },
        "apps": {
            "http": {
                "http_port": http_port,
                "https_port": https_port,
                "servers": {
                    "http_redirector": {
                        "listen": [format!(":{http_port}")],
                        "routes": [
                            {
                                "handle": [
                                    {
                                        "handler": "static_response",
                                        "status_code": 301,
                                        "headers": {
                                            "Location": ["https://{http.request.host}{http.request.uri}"],
                                        },
                                    }
                                ],
                            }
                        ],
                    },
                    "https_server": {
                        "listen": [format!(":{https_port}")],
                        "routes": https_routes,
                        "tls_connection_policies": [ {} ],
                    },
                },
            },
            "tls": {
                "automation": {
                    "policies": [
                        {
                            "issuers": [ { "module": "internal", "ca": "local" } ],
                            "disable_ocsp_stapling": true,
                        }
                    ],
                },
            },
        },
    })
}
