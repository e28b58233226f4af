//! IPC client: connects to a daemon over a Unix domain socket.
//!
//! Provides a typed client for the CLI (and for one daemon asking another to
//! quit). Uses `hyper` for HTTP/1.1 over the Unix socket; streamed calls
//! keep the request body open while the response is read.

use std::path::PathBuf;

use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::{Method, Response};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncRead;
use tokio::net::UnixStream;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::frame;
use super::server::NDJSON;
use super::stream::{CommandPeer, CommandStream, duplex};
use super::types::*;

const FRAME_BUFFER: usize = 32;

type RequestBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Errors from the IPC client.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("failed to connect to daemon socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("daemon is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon returned error: {0}")]
    DaemonError(String),
}

/// Client for communicating with a warden daemon via Unix socket.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a new IPC client targeting the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Check if the daemon socket exists (daemon is likely running).
    pub fn daemon_available(&self) -> bool {
        super::socket_exists(&self.socket_path)
    }

    /// Open a connection and send one request, returning the response head
    /// and its still-streaming body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        content_type: Option<&str>,
    ) -> Result<Response<Incoming>, IpcClientError> {
        if !self.daemon_available() {
            return Err(IpcClientError::NotRunning(self.socket_path.clone()));
        }

        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| IpcClientError::Connect {
                    path: self.socket_path.clone(),
                    source: e,
                })?;

        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, RequestBody>(io)
            .await
            .map_err(|e| IpcClientError::Request(format!("HTTP handshake failed: {e}")))?;

        // Drive the connection in the background
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!(error = %e, "IPC connection error");
            }
        });

        debug!(%method, path, "IPC request");

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "localhost");

        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }

        let req = builder
            .body(body)
            .map_err(|e| IpcClientError::Request(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| IpcClientError::Request(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&body) {
                return Err(IpcClientError::DaemonError(err.error));
            }
            return Err(IpcClientError::Request(format!(
                "unexpected status: {status}"
            )));
        }

        Ok(resp)
    }

    /// Send a bodiless request and collect the whole response body.
    async fn request(&self, method: Method, path: &str) -> Result<Bytes, IpcClientError> {
        let empty = Empty::<Bytes>::new()
            .map_err(|never| -> std::io::Error { match never {} })
            .boxed_unsync();
        let resp = self.send(method, path, empty, None).await?;
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| IpcClientError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();
        Ok(body)
    }

    // ── Typed API methods ──────────────────────────────────────────────

    /// API and build version of the daemon.
    pub async fn version(&self) -> Result<VersionResponse, IpcClientError> {
        let body = self.request(Method::GET, "/version").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("version: {e}")))
    }

    /// Network override status.
    pub async fn status(&self) -> Result<StatusResponse, IpcClientError> {
        let body = self.request(Method::GET, "/status").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("status: {e}")))
    }

    /// Ask the daemon to release its network override.
    pub async fn pause(&self) -> Result<PauseResponse, IpcClientError> {
        let body = self.request(Method::POST, "/pause").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("pause: {e}")))
    }

    /// Ask the daemon to reinstall its network override.
    pub async fn resume(&self) -> Result<ResumeResponse, IpcClientError> {
        let body = self.request(Method::POST, "/resume").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("resume: {e}")))
    }

    /// Request daemon shutdown.
    pub async fn quit(&self) -> Result<QuitResponse, IpcClientError> {
        let body = self.request(Method::POST, "/quit").await?;
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("quit: {e}")))
    }

    /// Stream `reader` to the daemon's log until it reaches end of input.
    pub async fn logger<R>(&self, reader: R) -> Result<LoggerResponse, IpcClientError>
    where
        R: AsyncRead + Send + 'static,
    {
        let chunks = ReaderStream::new(reader).map(|chunk| chunk.map(Frame::data));
        let body = StreamBody::new(chunks).boxed_unsync();

        let resp = self
            .send(Method::POST, "/logger", body, Some("text/plain"))
            .await?;
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| IpcClientError::Request(format!("failed to read response body: {e}")))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| IpcClientError::Parse(format!("logger: {e}")))
    }

    /// Open a `run-command` stream.
    ///
    /// Frames sent on the returned stream's sender go out as the request
    /// body; closing the sender ends the request. Response frames arrive on
    /// the receiver until the daemon ends its response.
    pub async fn run_command(&self) -> Result<CommandStream, IpcClientError> {
        let (stream, peer) = duplex(FRAME_BUFFER);
        let CommandPeer {
            requests,
            responses,
        } = peer;

        let outgoing = futures::stream::unfold(requests, |mut requests| async move {
            let request = requests.recv().await?;
            let encoded = frame::encode(&request)
                .map(Frame::data)
                .map_err(std::io::Error::other);
            Some((encoded, requests))
        });
        let body = StreamBody::new(outgoing).boxed_unsync();

        let resp = self
            .send(Method::POST, "/run-command", body, Some(NDJSON))
            .await?;

        tokio::spawn(async move {
            let frames = frame::decode_frames::<RunCommandResponse, _, _>(
                resp.into_body().into_data_stream(),
            );
            let mut frames = std::pin::pin!(frames);
            loop {
                let next = tokio::select! {
                    next = frames.next() => next,
                    _ = responses.closed() => break,
                };
                let relayed = match next {
                    Some(Ok(frame)) => responses.send(Ok(frame)).await,
                    Some(Err(e)) => {
                        let _ = responses.send(Err(e.into())).await;
                        break;
                    }
                    None => break,
                };
                if relayed.is_err() {
                    break;
                }
            }
        });

        Ok(stream)
    }
}
