//! Unix-socket control channel. One JSON object per line in both
//! directions, grounded on generalizing `rs_mail_client`'s IPC socket
//! lifecycle (stale-socket detection via connect-probe, one task per
//! connection) to newline-delimited JSON over async I/O rather than that
//! file's length-prefixed binary framing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize)]
struct IpcRequest {
    #[serde(rename = "type")]
    kind: String,
    platform: Option<String>,
}

#[derive(Debug, Serialize)]
struct IpcResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    fn err(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }
}

/// Removes a leftover socket file from an unclean prior shutdown. If a live
/// daemon is still listening on it, refuses to clobber it.
pub async fn clear_stale_socket(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match UnixStream::connect(path).await {
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("another daemon is already listening on {}", path.display()),
        )),
        Err(_) => tokio::fs::remove_file(path).await,
    }
}

pub async fn serve(
    socket_path: PathBuf,
    orchestrator: Arc<Orchestrator>,
    mut shutting_down: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    clear_stale_socket(&socket_path).await?;
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(path = %socket_path.display(), "ipc socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, orchestrator).await {
                        tracing::debug!(error = %e, "ipc connection ended with error");
                    }
                });
            }
            _ = shutting_down.changed() => {
                if *shutting_down.borrow() {
                    break;
                }
            }
        }
    }

    tokio::fs::remove_file(&socket_path).await.ok();
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => dispatch(&orchestrator, request).await,
            Err(e) => IpcResponse::err(format!("malformed request: {e}")),
        };
        let mut payload = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
    Ok(())
}

async fn dispatch(orchestrator: &Arc<Orchestrator>, request: IpcRequest) -> IpcResponse {
    match request.kind.as_str() {
        "status" => {
            let status = orchestrator.status_response().await;
            match serde_json::to_value(status) {
                Ok(value) => IpcResponse::ok(value),
                Err(e) => IpcResponse::err(e.to_string()),
            }
        }
        "health" => {
            let report = orchestrator.health_report().await;
            match serde_json::to_value(report) {
                Ok(value) => IpcResponse::ok(value),
                Err(e) => IpcResponse::err(e.to_string()),
            }
        }
        "start" => {
            if !orchestrator.is_running() {
                orchestrator.start().await;
            }
            IpcResponse::ok(serde_json::json!({ "message": "Daemon started" }))
        }
        "stop" => {
            orchestrator.stop().await;
            IpcResponse::ok(serde_json::json!({ "message": "Daemon stopped" }))
        }
        "restart" => {
            orchestrator.stop().await;
            orchestrator.start().await;
            IpcResponse::ok(serde_json::json!({ "message": "Daemon restarted" }))
        }
        "restart-platform" => match request.platform {
            Some(platform) => {
                if orchestrator.restart_platform(&platform).await {
                    IpcResponse::ok(serde_json::json!({
                        "message": format!("Platform {platform} restarted")
                    }))
                } else {
                    IpcResponse::err(format!("unknown platform: {platform}"))
                }
            }
            None => IpcResponse::err("restart-platform requires a platform field"),
        },
        other => IpcResponse::err(format!("unknown command: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_stale_socket_removes_file_with_no_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messaged.sock");
        std::fs::write(&path, b"").unwrap();
        assert!(clear_stale_socket(&path).await.is_ok());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn clear_stale_socket_is_noop_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messaged.sock");
        assert!(clear_stale_socket(&path).await.is_ok());
    }

    #[test]
    fn request_parses_without_platform_field() {
        let req: IpcRequest = serde_json::from_str(r#"{"type":"status"}"#).unwrap();
        assert_eq!(req.kind, "status");
        assert!(req.platform.is_none());
    }
}
