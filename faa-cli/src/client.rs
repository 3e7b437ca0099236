//! Client side of the supervisor's control socket.
//!
//! One connection per command is plenty; each method writes one frame and
//! reads one frame. A response with `ok: false` surfaces the daemon's
//! error string.

use std::path::Path;

use anyhow::{bail, Context, Result};
use faa_core::config::Config;
use faa_core::ipc::{
    self, GetRouteParams, GetRouteReply, MessageType, ProjectRootParams, Request, Response,
    SetProcessParams, StatusReply, StopParams, UpsertRouteParams,
};
use faa_core::registry::{ProcessRecord, Route};
use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect to the supervisor's control socket.
    pub async fn connect(config: &Config) -> Result<Self> {
        let socket_path = config.socket_path();
        let stream = UnixStream::connect(&socket_path)
            .await
            .with_context(|| format!("failed to connect to daemon at {}", socket_path.display()))?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    async fn request(&mut self, request: Request) -> Result<Response> {
        let operation = request.kind.clone();
        ipc::write_frame(&mut self.writer, &request)
            .await
            .with_context(|| format!("failed to send {operation} request"))?;

        let response: Response = ipc::read_frame(&mut self.reader)
            .await
            .with_context(|| format!("failed to read {operation} response"))?
            .with_context(|| format!("daemon closed the connection during {operation}"))?;

        if !response.ok {
            let message = response.error.unwrap_or_else(|| "unknown error".to_string());
            bail!("{operation} failed: {message}");
        }
        Ok(response)
    }

    async fn call<T: Serialize>(&mut self, kind: MessageType, payload: &T) -> Result<Response> {
        self.request(Request::with_payload(kind, payload)?).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.request(Request::new(MessageType::Ping, None)).await?;
        Ok(())
    }

    pub async fn upsert_route(&mut self, host: &str, port: u16) -> Result<()> {
        self.call(
            MessageType::UpsertRoute,
            &UpsertRouteParams {
                host: host.to_string(),
                port,
            },
        )
        .await?;
        Ok(())
    }

    /// The registered port for `host`, or 0 when no route exists.
    pub async fn get_route(&mut self, host: &str) -> Result<u16> {
        let response = self
            .call(
                MessageType::GetRoute,
                &GetRouteParams {
                    host: host.to_string(),
                },
            )
            .await?;
        let reply: GetRouteReply = response.payload().context("malformed get_route reply")?;
        Ok(reply.port)
    }

    pub async fn list_routes(&mut self) -> Result<Vec<Route>> {
        let response = self.request(Request::new(MessageType::ListRoutes, None)).await?;
        response.payload().context("malformed list_routes reply")
    }

    pub async fn set_process(&mut self, params: &SetProcessParams) -> Result<()> {
        self.call(MessageType::SetProcess, params).await?;
        Ok(())
    }

    pub async fn get_process(&mut self, project_root: &Path) -> Result<Option<ProcessRecord>> {
        let response = self
            .call(
                MessageType::GetProcess,
                &ProjectRootParams {
                    project_root: project_root.to_path_buf(),
                },
            )
            .await?;
        response.payload().context("malformed get_process reply")
    }

    pub async fn clear_process(&mut self, project_root: &Path) -> Result<()> {
        self.call(
            MessageType::ClearProcess,
            &ProjectRootParams {
                project_root: project_root.to_path_buf(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<StatusReply> {
        let response = self.request(Request::new(MessageType::Status, None)).await?;
        response.payload().context("malformed status reply")
    }

    pub async fn stop(&mut self, clear_routes: bool) -> Result<()> {
        self.call(MessageType::Stop, &StopParams { clear_routes })
            .await?;
        Ok(())
    }
}
