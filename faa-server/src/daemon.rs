//! The faa supervisor.
//!
//! A single instance per machine, guarded by the daemon lock. It owns the
//! registry and the proxy controller, listens on the control socket, and
//! answers newline-delimited JSON requests. Connections are handled
//! concurrently; frames within one connection are answered in order.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use faa_core::config::Config;
use faa_core::hosts;
use faa_core::ipc::{
    self, GetRouteParams, GetRouteReply, MessageType, PingReply, ProjectRootParams, Request,
    Response, SetProcessParams, StatusReply, StopParams, UpsertRouteParams,
};
use faa_core::lock::{Lock, LockError};
use faa_core::registry::{ProcessRecord, Registry};
use serde::Serialize;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::proxy::ProxyController;

/// Delay between answering a `stop` request and beginning shutdown, so the
/// response can flush to the client.
const STOP_RESPONSE_GRACE: Duration = Duration::from_millis(100);

/// Attempts made to export the CA after proxy start, 200 ms apart; covers
/// the window while Caddy generates its internal root.
const CA_EXPORT_ATTEMPTS: u32 = 10;
const CA_EXPORT_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("another supervisor instance is already running (failed to acquire daemon lock)")]
    AlreadyRunning,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Daemon {
    config: Config,
    registry: Registry,
    proxy: Option<Arc<ProxyController>>,
}

impl Daemon {
    pub fn new(config: Config, registry: Registry, proxy: Option<Arc<ProxyController>>) -> Self {
        Self {
            config,
            registry,
            proxy,
        }
    }

    /// Run the supervisor until a signal or a `stop` request arrives.
    ///
    /// Holds the daemon lock for the whole run; the PID file, the control
    /// socket, and the proxy are torn down on every exit path.
    pub async fn run(self) -> Result<(), DaemonError> {
        tokio::fs::create_dir_all(self.config.config_dir())
            .await
            .with_context(|| {
                format!("failed to create {}", self.config.config_dir().display())
            })?;

        let lock = match Lock::acquire(&self.config.lock_path()) {
            Ok(lock) => lock,
            Err(LockError::Busy) => return Err(DaemonError::AlreadyRunning),
            Err(LockError::Io(err)) => {
                return Err(DaemonError::Other(
                    anyhow::Error::from(err).context("failed to acquire daemon lock"),
                ))
            }
        };

        let pid_path = self.config.pid_path();
        tokio::fs::write(&pid_path, format!("{}\n", std::process::id()))
            .await
            .with_context(|| format!("failed to write PID file {}", pid_path.display()))?;

        let result = self.serve().await;

        let _ = tokio::fs::remove_file(self.config.socket_path()).await;
        let _ = tokio::fs::remove_file(&pid_path).await;

        if let Some(proxy) = &self.proxy {
            proxy.stop().await;
        }

        if let Err(err) = lock.release() {
            warn!("failed to release daemon lock: {err}");
        }

        result.map_err(DaemonError::Other)
    }

    async fn serve(&self) -> Result<()> {
        if let Some(proxy) = &self.proxy {
            proxy
                .start()
                .await
                .map_err(|err| anyhow::Error::from(err).context("failed to start proxy"))?;

            match crate::ca::export_ca_with_retry(
                &self.config,
                CA_EXPORT_ATTEMPTS,
                CA_EXPORT_DELAY,
            )
            .await
            {
                Ok(()) => info!(
                    "CA certificate exported to {}",
                    self.config.ca_export_path().display()
                ),
                Err(err) => {
                    warn!("failed to export CA certificate: {err:#}");
                    warn!("the certificate will be exported once the proxy has generated it");
                }
            }
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let context = RequestContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            proxy: self.proxy.clone(),
            shutdown: shutdown_tx,
        };

        // Routes survive restarts; bring the proxy up to date before
        // accepting requests.
        context
            .apply_registry_routes()
            .await
            .context("failed to load and apply routes")?;

        let socket_path = self.config.socket_path();
        // A previous unclean shutdown may have left the socket behind.
        let _ = tokio::fs::remove_file(&socket_path).await;
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(self.config.socket_mode()),
        )
        .context("failed to set socket permissions")?;

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

        info!("supervisor listening on {}", socket_path.display());

        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let context = context.clone();
                            handlers.spawn(handle_connection(stream, context));
                        }
                        Err(err) => warn!("failed to accept connection: {err}"),
                    }
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, stopping supervisor");
                    break;
                }
            }
        }

        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
        drop(listener);

        Ok(())
    }
}

async fn handle_connection(stream: UnixStream, context: RequestContext) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request: Request = match ipc::read_frame(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                // A frame that does not decode poisons the stream; drop
                // the connection and let the peer reconnect.
                debug!("closing connection after decode failure: {err}");
                return;
            }
        };

        let response = context.handle(request).await;
        if let Err(err) = ipc::write_frame(&mut write_half, &response).await {
            warn!("failed to write response: {err}");
            return;
        }
    }
}

#[derive(Clone)]
struct RequestContext {
    config: Config,
    registry: Registry,
    proxy: Option<Arc<ProxyController>>,
    shutdown: mpsc::Sender<()>,
}

impl RequestContext {
    async fn handle(&self, request: Request) -> Response {
        let Some(kind) = MessageType::parse(&request.kind) else {
            return Response::failure(format!("unknown message type: {}", request.kind));
        };

        match kind {
            MessageType::Ping => reply(&PingReply {
                message: "pong".to_string(),
            }),
            MessageType::UpsertRoute => self.handle_upsert_route(&request).await,
            MessageType::GetRoute => self.handle_get_route(&request).await,
            MessageType::ListRoutes => match self.registry.list_routes().await {
                Ok(routes) => reply(&routes),
                Err(err) => failure(err),
            },
            MessageType::SetProcess => self.handle_set_process(&request).await,
            MessageType::GetProcess => self.handle_get_process(&request).await,
            MessageType::ClearProcess => self.handle_clear_process(&request).await,
            MessageType::Status => self.handle_status().await,
            MessageType::Stop => self.handle_stop(&request).await,
        }
    }

    async fn handle_upsert_route(&self, request: &Request) -> Response {
        let params: UpsertRouteParams = match request.payload() {
            Ok(params) => params,
            Err(err) => return bad_request(err),
        };

        if let Err(err) = self.registry.upsert_route(&params.host, params.port).await {
            return failure(err);
        }

        // The reservation is durable at this point; the response is held
        // back until the proxy has committed the new snapshot, so a
        // subsequent HTTP request observes the route as live.
        if let Err(err) = self.apply_registry_routes().await {
            return failure(err);
        }

        Response::success(None)
    }

    async fn handle_get_route(&self, request: &Request) -> Response {
        let params: GetRouteParams = match request.payload() {
            Ok(params) => params,
            Err(err) => return bad_request(err),
        };

        match self.registry.get_route(&params.host).await {
            Ok(port) => reply(&GetRouteReply {
                port: port.unwrap_or(0),
            }),
            Err(err) => failure(err),
        }
    }

    async fn handle_set_process(&self, request: &Request) -> Response {
        let params: SetProcessParams = match request.payload() {
            Ok(params) => params,
            Err(err) => return bad_request(err),
        };

        let record = ProcessRecord {
            project_root: params.project_root,
            pid: params.pid,
            host: params.host,
            port: params.port,
            started_at: params.started_at.unwrap_or_else(Utc::now),
        };

        match self.registry.set_process(record).await {
            Ok(()) => Response::success(None),
            Err(err) => failure(err),
        }
    }

    async fn handle_get_process(&self, request: &Request) -> Response {
        let params: ProjectRootParams = match request.payload() {
            Ok(params) => params,
            Err(err) => return bad_request(err),
        };

        self.sweep_stale().await;

        match self.registry.get_process(&params.project_root).await {
            Ok(record) => reply(&record),
            Err(err) => failure(err),
        }
    }

    async fn handle_clear_process(&self, request: &Request) -> Response {
        let params: ProjectRootParams = match request.payload() {
            Ok(params) => params,
            Err(err) => return bad_request(err),
        };

        match self.registry.clear_process(&params.project_root).await {
            Ok(()) => Response::success(None),
            Err(err) => failure(err),
        }
    }

    async fn handle_status(&self) -> Response {
        self.sweep_stale().await;

        let routes = match self.registry.list_routes().await {
            Ok(routes) => routes,
            Err(err) => return failure(err),
        };
        let processes = match self.registry.list_processes().await {
            Ok(processes) => processes,
            Err(err) => return failure(err),
        };

        reply(&StatusReply { routes, processes })
    }

    async fn handle_stop(&self, request: &Request) -> Response {
        let params: StopParams = match request.payload() {
            Ok(params) => params,
            Err(err) => return bad_request(err),
        };

        if params.clear_routes {
            if let Err(err) = self.registry.clear_routes().await {
                return failure(err);
            }
            if let Err(err) = self.apply_registry_routes().await {
                warn!("failed to clear proxy routes during stop: {err:#}");
            }
        }

        // Begin shutdown only after the response has had a chance to
        // reach the client.
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_RESPONSE_GRACE).await;
            let _ = shutdown.send(()).await;
        });

        Response::success(None)
    }

    /// Push the registry's current routes to the proxy and the hosts-file
    /// block. Hosts-file failures are warnings; the proxy stays in sync or
    /// the error surfaces.
    async fn apply_registry_routes(&self) -> Result<()> {
        let routes = self.registry.load_routes().await?;

        if let Some(proxy) = &self.proxy {
            proxy
                .apply_routes(routes.clone())
                .await
                .context("failed to apply routes to proxy")?;
        }

        let managed = hosts::collect_managed_hosts(&routes, self.config.hosts_file_suffixes());
        if let Err(err) = hosts::sync_managed_block(self.config.hosts_path(), &managed).await {
            warn!("failed to update hosts file: {err:#}");
        }

        Ok(())
    }

    async fn sweep_stale(&self) {
        match self.registry.cleanup_stale_processes().await {
            Ok(0) => {}
            Ok(removed) => debug!("swept {removed} stale process record(s)"),
            Err(err) => warn!("failed to clean up stale processes: {err:#}"),
        }
    }
}

fn reply<T: Serialize>(payload: &T) -> Response {
    match Response::with_payload(payload) {
        Ok(response) => response,
        Err(err) => failure(err),
    }
}

fn failure(err: impl std::fmt::Display) -> Response {
    Response::failure(err.to_string())
}

fn bad_request(err: impl std::fmt::Display) -> Response {
    Response::failure(format!("invalid request data: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::unix::OwnedWriteHalf;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct TestClient {
        reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(config: &Config) -> Self {
            let stream = UnixStream::connect(config.socket_path()).await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                reader: BufReader::new(read_half),
                writer,
            }
        }

        async fn send(&mut self, request: &Request) {
            ipc::write_frame(&mut self.writer, request).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Response> {
            ipc::read_frame(&mut self.reader).await.unwrap()
        }

        async fn call(&mut self, request: Request) -> Response {
            self.send(&request).await;
            self.recv().await.expect("connection closed unexpectedly")
        }
    }

    async fn spawn_daemon(dir: &Path) -> (JoinHandle<Result<(), DaemonError>>, Config) {
        let config = Config::with_config_dir(dir);
        let registry = Registry::new(&config);
        let daemon = Daemon::new(config.clone(), registry, None);
        let handle = tokio::spawn(daemon.run());

        for _ in 0..100 {
            if UnixStream::connect(config.socket_path()).await.is_ok() {
                return (handle, config);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("daemon did not become ready");
    }

    async fn stop_daemon(handle: JoinHandle<Result<(), DaemonError>>, config: &Config) {
        let mut client = TestClient::connect(config).await;
        let response = client
            .call(Request::with_payload(MessageType::Stop, &StopParams::default()).unwrap())
            .await;
        assert!(response.ok);
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;

        let mut client = TestClient::connect(&config).await;
        let response = client.call(Request::new(MessageType::Ping, None)).await;
        assert!(response.ok);
        let reply: PingReply = response.payload().unwrap();
        assert_eq!(reply.message, "pong");

        stop_daemon(handle, &config).await;
    }

    #[tokio::test]
    async fn routes_round_trip_through_the_daemon() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;
        let mut client = TestClient::connect(&config).await;

        let response = client
            .call(
                Request::with_payload(
                    MessageType::UpsertRoute,
                    &UpsertRouteParams {
                        host: "my-app".to_string(),
                        port: 12345,
                    },
                )
                .unwrap(),
            )
            .await;
        assert!(response.ok, "{:?}", response.error);

        let response = client
            .call(
                Request::with_payload(
                    MessageType::GetRoute,
                    &GetRouteParams {
                        host: "my-app".to_string(),
                    },
                )
                .unwrap(),
            )
            .await;
        let reply: GetRouteReply = response.payload().unwrap();
        assert_eq!(reply.port, 12345);

        let response = client
            .call(
                Request::with_payload(
                    MessageType::GetRoute,
                    &GetRouteParams {
                        host: "missing".to_string(),
                    },
                )
                .unwrap(),
            )
            .await;
        let reply: GetRouteReply = response.payload().unwrap();
        assert_eq!(reply.port, 0);

        let response = client.call(Request::new(MessageType::ListRoutes, None)).await;
        let routes: Vec<faa_core::Route> = response.payload().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].host, "my-app.local");

        stop_daemon(handle, &config).await;
    }

    #[tokio::test]
    async fn process_lifecycle_with_stale_sweep() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;
        let mut client = TestClient::connect(&config).await;

        // A live record survives get_process's sweep.
        let live = SetProcessParams {
            project_root: "/tmp/live-project".into(),
            pid: std::process::id() as i32,
            host: "live.local".to_string(),
            port: 12000,
            started_at: None,
        };
        let response = client
            .call(Request::with_payload(MessageType::SetProcess, &live).unwrap())
            .await;
        assert!(response.ok, "{:?}", response.error);

        // A dead one is swept before lookup.
        let dead = SetProcessParams {
            project_root: "/tmp/dead-project".into(),
            pid: 999_999,
            host: "dead.local".to_string(),
            port: 12001,
            started_at: None,
        };
        assert!(
            client
                .call(Request::with_payload(MessageType::SetProcess, &dead).unwrap())
                .await
                .ok
        );

        let response = client
            .call(
                Request::with_payload(
                    MessageType::GetProcess,
                    &ProjectRootParams {
                        project_root: "/tmp/dead-project".into(),
                    },
                )
                .unwrap(),
            )
            .await;
        assert!(response.ok);
        let record: Option<ProcessRecord> = response.payload().unwrap();
        assert!(record.is_none());

        let response = client
            .call(
                Request::with_payload(
                    MessageType::GetProcess,
                    &ProjectRootParams {
                        project_root: "/tmp/live-project".into(),
                    },
                )
                .unwrap(),
            )
            .await;
        let record: Option<ProcessRecord> = response.payload().unwrap();
        let record = record.expect("live record should remain");
        assert_eq!(record.host, "live.local");

        let response = client.call(Request::new(MessageType::Status, None)).await;
        let status: StatusReply = response.payload().unwrap();
        assert_eq!(status.processes.len(), 1);

        assert!(
            client
                .call(
                    Request::with_payload(
                        MessageType::ClearProcess,
                        &ProjectRootParams {
                            project_root: "/tmp/live-project".into(),
                        },
                    )
                    .unwrap(),
                )
                .await
                .ok
        );

        let response = client.call(Request::new(MessageType::Status, None)).await;
        let status: StatusReply = response.payload().unwrap();
        assert!(status.processes.is_empty());

        stop_daemon(handle, &config).await;
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;
        let mut client = TestClient::connect(&config).await;

        for port in [1u16, 2, 3] {
            client
                .send(
                    &Request::with_payload(
                        MessageType::UpsertRoute,
                        &UpsertRouteParams {
                            host: format!("pipeline-{port}"),
                            port,
                        },
                    )
                    .unwrap(),
                )
                .await;
            client
                .send(
                    &Request::with_payload(
                        MessageType::GetRoute,
                        &GetRouteParams {
                            host: format!("pipeline-{port}"),
                        },
                    )
                    .unwrap(),
                )
                .await;
        }

        for port in [1u16, 2, 3] {
            let upserted = client.recv().await.unwrap();
            assert!(upserted.ok);
            let fetched = client.recv().await.unwrap();
            let reply: GetRouteReply = fetched.payload().unwrap();
            assert_eq!(reply.port, port);
        }

        stop_daemon(handle, &config).await;
    }

    #[tokio::test]
    async fn unknown_message_type_is_a_typed_error() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;
        let mut client = TestClient::connect(&config).await;

        let response = client
            .call(Request {
                kind: "bogus".to_string(),
                data: None,
            })
            .await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("unknown message type"));

        // The connection survives a bad request.
        assert!(client.call(Request::new(MessageType::Ping, None)).await.ok);

        stop_daemon(handle, &config).await;
    }

    #[tokio::test]
    async fn malformed_frame_closes_the_connection() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;
        let mut client = TestClient::connect(&config).await;

        client.writer.write_all(b"{this is not json}\n").await.unwrap();
        assert!(client.recv().await.is_none());

        stop_daemon(handle, &config).await;
    }

    #[tokio::test]
    async fn stop_removes_socket_and_pid_file() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;

        assert!(config.socket_path().exists());
        assert!(config.pid_path().exists());
        let pid_content = std::fs::read_to_string(config.pid_path()).unwrap();
        assert_eq!(pid_content.trim(), std::process::id().to_string());

        stop_daemon(handle, &config).await;

        assert!(!config.socket_path().exists());
        assert!(!config.pid_path().exists());
    }

    #[tokio::test]
    async fn stop_with_clear_routes_empties_the_registry() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;
        let mut client = TestClient::connect(&config).await;

        assert!(
            client
                .call(
                    Request::with_payload(
                        MessageType::UpsertRoute,
                        &UpsertRouteParams {
                            host: "app".to_string(),
                            port: 12000,
                        },
                    )
                    .unwrap(),
                )
                .await
                .ok
        );

        let response = client
            .call(
                Request::with_payload(MessageType::Stop, &StopParams { clear_routes: true })
                    .unwrap(),
            )
            .await;
        assert!(response.ok);
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();

        let registry = Registry::new(&config);
        assert!(registry.list_routes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_daemon_reports_already_running() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;

        let second = Daemon::new(config.clone(), Registry::new(&config), None);
        match timeout(Duration::from_secs(2), second.run()).await {
            Ok(Err(DaemonError::AlreadyRunning)) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        stop_daemon(handle, &config).await;
    }

    #[tokio::test]
    async fn status_payload_uses_wire_shapes() {
        let dir = tempdir().unwrap();
        let (handle, config) = spawn_daemon(dir.path()).await;
        let mut client = TestClient::connect(&config).await;

        assert!(
            client
                .call(
                    Request::with_payload(
                        MessageType::UpsertRoute,
                        &UpsertRouteParams {
                            host: "wire".to_string(),
                            port: 12000,
                        },
                    )
                    .unwrap(),
                )
                .await
                .ok
        );

        let response = client.call(Request::new(MessageType::Status, None)).await;
        let raw = response.data.unwrap();
        assert!(matches!(raw.get("routes"), Some(Value::Array(_))));
        assert!(matches!(raw.get("processes"), Some(Value::Array(_))));

        stop_daemon(handle, &config).await;
    }
}
