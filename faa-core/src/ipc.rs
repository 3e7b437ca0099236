//! Typed request/response envelope over newline-delimited JSON.
//!
//! Every frame is a single line of UTF-8 JSON. Requests carry a string
//! type tag and an optional payload; responses carry `ok`, an optional
//! error string, and an optional payload. A frame that fails to decode is
//! a transport error and the connection must be closed.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::registry::{ProcessRecord, Route};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("daemon reported an error: {0}")]
    Remote(String),
}

/// Known message types. The wire tag is a plain string so an unknown tag
/// decodes cleanly and can be answered with a typed error instead of
/// tearing down the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    UpsertRoute,
    GetRoute,
    ListRoutes,
    SetProcess,
    GetProcess,
    ClearProcess,
    Status,
    Stop,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::UpsertRoute => "upsert_route",
            Self::GetRoute => "get_route",
            Self::ListRoutes => "list_routes",
            Self::SetProcess => "set_process",
            Self::GetProcess => "get_process",
            Self::ClearProcess => "clear_process",
            Self::Status => "status",
            Self::Stop => "stop",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "ping" => Some(Self::Ping),
            "upsert_route" => Some(Self::UpsertRoute),
            "get_route" => Some(Self::GetRoute),
            "list_routes" => Some(Self::ListRoutes),
            "set_process" => Some(Self::SetProcess),
            "get_process" => Some(Self::GetProcess),
            "clear_process" => Some(Self::ClearProcess),
            "status" => Some(Self::Status),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// An IPC request frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Request {
    pub fn new(kind: MessageType, data: Option<Value>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            data,
        }
    }

    /// Build a request with a serializable payload.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, IpcError> {
        Ok(Self::new(kind, Some(serde_json::to_value(payload)?)))
    }

    /// Deserialize this request's payload, treating a missing payload as
    /// JSON `null` (so payload structs with only optional fields decode).
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        let value = self.data.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

/// An IPC response frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            ok: true,
            error: None,
            data,
        }
    }

    pub fn with_payload<T: Serialize>(payload: &T) -> Result<Self, IpcError> {
        Ok(Self::success(Some(serde_json::to_value(payload)?)))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            data: None,
        }
    }

    /// Deserialize this response's payload; a missing payload decodes as
    /// JSON `null`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        let value = self.data.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

/// Write one frame: the JSON document followed by a newline.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), IpcError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF before any bytes of
/// the next frame; a decode failure is an error and the caller must close
/// the connection.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, IpcError>
where
    R: AsyncBufReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line)?))
}

// Request payloads.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertRouteParams {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetRouteParams {
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetProcessParams {
    pub project_root: PathBuf,
    pub pid: i32,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRootParams {
    pub project_root: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StopParams {
    #[serde(default)]
    pub clear_routes: bool,
}

// Response payloads.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingReply {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetRouteReply {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReply {
    pub routes: Vec<Route>,
    pub processes: Vec<ProcessRecord>,
}
