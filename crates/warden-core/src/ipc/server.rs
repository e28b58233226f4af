//! IPC server: axum HTTP router over a Unix domain socket.
//!
//! The daemon binds its control socket with mode `0777` so unprivileged
//! clients can reach it, then serves until the supplied shutdown future
//! resolves. Graceful shutdown lets open exchanges, including streaming
//! `run-command` responses, run to completion.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use super::frame::{self, LineBuffer};
use super::stream::duplex;
use super::types::*;
use crate::exec;
use crate::network::NetworkHandle;
use crate::supervisor::Shutdown;

/// Content type of streamed `run-command` bodies.
pub const NDJSON: &str = "application/x-ndjson";

/// Frames buffered per direction of a command stream.
const FRAME_BUFFER: usize = 32;

/// Shared state accessible to all IPC route handlers.
pub struct IpcState {
    pub network: NetworkHandle,
    pub shutdown: Shutdown,
}

/// Build the axum router with all IPC routes.
pub fn router(state: Arc<IpcState>) -> axum::Router {
    axum::Router::new()
        .route("/version", get(handle_version))
        .route("/status", get(handle_status))
        .route("/pause", post(handle_pause))
        .route("/resume", post(handle_resume))
        .route("/quit", post(handle_quit))
        .route("/logger", post(handle_logger))
        .route("/run-command", post(handle_run_command))
        .with_state(state)
}

/// Bind the control socket and open it to every local user.
///
/// A stale socket file from a previous run is removed first. Errors name the
/// socket path.
pub fn bind(socket_path: &Path) -> std::io::Result<UnixListener> {
    let wrap = |what: &str, e: std::io::Error| {
        std::io::Error::new(
            e.kind(),
            format!("failed to {what} {}: {e}", socket_path.display()),
        )
    };

    if std::fs::symlink_metadata(socket_path).is_ok() {
        std::fs::remove_file(socket_path).map_err(|e| wrap("remove stale socket", e))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| wrap("create directory for", e))?;
    }

    let listener = UnixListener::bind(socket_path).map_err(|e| wrap("bind", e))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o777))
        .map_err(|e| wrap("set permissions on", e))?;

    info!(path = %socket_path.display(), "IPC server listening");
    Ok(listener)
}

/// Serve the IPC API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: UnixListener,
    state: Arc<IpcState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("IPC server shutting down");
        })
        .await
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        api_version: crate::build_info::API_VERSION,
        version: crate::build_info::VERSION.to_string(),
    })
}

async fn handle_status(State(state): State<Arc<IpcState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.network.status().await,
    })
}

async fn handle_pause(State(state): State<Arc<IpcState>>) -> Json<PauseResponse> {
    Json(state.network.pause().await.into())
}

async fn handle_resume(State(state): State<Arc<IpcState>>) -> Json<ResumeResponse> {
    Json(state.network.resume().await.into())
}

async fn handle_quit(State(state): State<Arc<IpcState>>) -> Json<QuitResponse> {
    info!("Quit requested via IPC");
    state.shutdown.trigger();
    Json(QuitResponse {
        acknowledged: true,
        message: "Shutdown initiated".to_string(),
    })
}

async fn handle_logger(
    body: Body,
) -> Result<Json<LoggerResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut data = body.into_data_stream();
    let mut lines = LineBuffer::new();
    let mut count = 0u64;

    let mut emit = |line: Vec<u8>| {
        info!(target: "warden::client", "{}", String::from_utf8_lossy(&line));
        count += 1;
    };

    while let Some(chunk) = data.next().await {
        let chunk = chunk.map_err(|e| {
            warn!(error = %e, "logger stream failed");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("logger stream failed: {e}"),
                }),
            )
        })?;
        lines.push(&chunk);
        while let Some(line) = lines.next_line() {
            emit(line);
        }
    }
    if let Some(rest) = lines.finish() {
        emit(rest);
    }

    debug!(lines = count, "logger stream closed");
    Ok(Json(LoggerResponse { lines: count }))
}

async fn handle_run_command(State(state): State<Arc<IpcState>>, body: Body) -> Response {
    let (stream, peer) = duplex(FRAME_BUFFER);
    tokio::spawn(exec::execute(peer, state.shutdown.clone()));

    let sender = stream.sender;
    tokio::spawn(async move {
        let frames = frame::decode_frames::<RunCommandRequest, _, _>(body.into_data_stream());
        let mut frames = std::pin::pin!(frames);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "run-command request stream failed");
                    break;
                }
            }
        }
        sender.close_send();
    });

    let outgoing = futures::stream::unfold(stream.receiver, |mut receiver| async move {
        match receiver.recv().await {
            Ok(Some(response)) => Some((frame::encode(&response), receiver)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "run-command response stream failed");
                None
            }
        }
    });

    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(outgoing)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    use crate::network::{NetworkService, NoopInstaller};

    struct Harness {
        state: Arc<IpcState>,
        _dir: tempfile::TempDir,
    }

    fn test_state() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (service, network) = NetworkService::new(
            Arc::new(NoopInstaller::new(&Default::default())),
            dir.path().join("connector.sock"),
        );
        let shutdown = Shutdown::new();
        tokio::spawn(service.run(shutdown.clone()));
        Harness {
            state: Arc::new(IpcState { network, shutdown }),
            _dir: dir,
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let h = test_state();
        let req = Request::get("/version").body(Body::empty()).unwrap();
        let resp = router(h.state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let version: VersionResponse = body_json(resp).await;
        assert_eq!(version.api_version, crate::build_info::API_VERSION);
        assert!(!version.version.is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_status_endpoints() {
        let h = test_state();
        let app = router(h.state.clone());

        let req = Request::get("/status").body(Body::empty()).unwrap();
        let status: StatusResponse = body_json(app.clone().oneshot(req).await.unwrap()).await;
        assert_eq!(status.status, DaemonStatus::Paused);

        let req = Request::post("/resume").body(Body::empty()).unwrap();
        let resume: ResumeResponse = body_json(app.clone().oneshot(req).await.unwrap()).await;
        assert_eq!(resume.into_result(), Ok(()));

        let req = Request::get("/status").body(Body::empty()).unwrap();
        let status: StatusResponse = body_json(app.clone().oneshot(req).await.unwrap()).await;
        assert_eq!(status.status, DaemonStatus::Ok);

        let req = Request::post("/pause").body(Body::empty()).unwrap();
        let pause: PauseResponse = body_json(app.clone().oneshot(req).await.unwrap()).await;
        assert_eq!(pause.into_result(), Ok(()));

        let req = Request::post("/pause").body(Body::empty()).unwrap();
        let pause: PauseResponse = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(pause.into_result(), Err(PauseError::AlreadyPaused));
    }

    #[tokio::test]
    async fn test_quit_endpoint_triggers_shutdown() {
        let h = test_state();
        let shutdown = h.state.shutdown.clone();

        let req = Request::post("/quit").body(Body::empty()).unwrap();
        let resp = router(h.state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let quit: QuitResponse = body_json(resp).await;
        assert!(quit.acknowledged);
        assert!(shutdown.is_triggered());
    }

    #[test_log::test(tokio::test)]
    async fn test_logger_endpoint_counts_lines() {
        let h = test_state();
        let req = Request::post("/logger")
            .body(Body::from("first\nsecond\r\n\nlast without newline"))
            .unwrap();
        let resp = router(h.state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let logged: LoggerResponse = body_json(resp).await;
        assert_eq!(logged.lines, 4);
    }

    #[tokio::test]
    async fn test_run_command_endpoint_streams_frames() {
        let h = test_state();
        let wire = [
            frame::encode(&RunCommandRequest::Command {
                os_args: vec!["echo".into(), "hi".into()],
                cwd: std::env::temp_dir(),
            })
            .unwrap(),
        ]
        .concat();
        let req = Request::post("/run-command")
            .header(header::CONTENT_TYPE, NDJSON)
            .body(Body::from(wire))
            .unwrap();
        let resp = router(h.state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], NDJSON);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let frames: Vec<RunCommandResponse> = body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| frame::decode(line).unwrap())
            .collect();

        assert_eq!(frames.last(), Some(&RunCommandResponse::success()));
        let stdout: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                RunCommandResponse::Data {
                    data,
                    error_category: ErrorCategory::Ok,
                } => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(stdout, b"hi\n");
    }

    #[tokio::test]
    async fn test_bind_sets_world_permissions_and_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("daemon.sock");

        let first = bind(&path).unwrap();
        drop(first);
        // The socket file outlives the listener; binding again must succeed.
        let _second = bind(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[tokio::test]
    async fn test_bind_failure_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let err = bind(&blocker.join("daemon.sock")).unwrap_err();
        assert!(err.to_string().contains("daemon.sock"));
    }
}
