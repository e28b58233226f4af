//! In-process duplex stream for `run-command`.
//!
//! [`duplex`] returns two ends: the [`CommandStream`] held by whoever starts a
//! command (the client session) and the [`CommandPeer`] held by whoever
//! executes it. The IPC client and server bridge these ends over HTTP; tests
//! connect them directly.
//!
//! Each direction preserves frame order. Closing the request side is explicit
//! ([`RequestSender::close_send`]) so that every clone of the sender observes
//! it at once.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::frame::FrameError;
use super::types::{RunCommandRequest, RunCommandResponse};

/// Errors observed on a command stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("command stream is closed")]
    Closed,

    #[error("command stream transport failed: {0}")]
    Transport(String),

    #[error("malformed frame on command stream: {0}")]
    Decode(String),
}

impl From<FrameError> for StreamError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Decode(e) => Self::Decode(e.to_string()),
            FrameError::Encode(e) => Self::Transport(e.to_string()),
            FrameError::Transport(text) => Self::Transport(text),
        }
    }
}

/// Create a connected pair of stream ends.
pub fn duplex(buffer: usize) -> (CommandStream, CommandPeer) {
    let (request_tx, request_rx) = mpsc::channel(buffer);
    let (response_tx, response_rx) = mpsc::channel(buffer);

    let stream = CommandStream {
        sender: RequestSender {
            tx: Arc::new(Mutex::new(Some(request_tx))),
        },
        receiver: ResponseReceiver { rx: response_rx },
    };
    let peer = CommandPeer {
        requests: request_rx,
        responses: response_tx,
    };
    (stream, peer)
}

/// The initiating end of a command stream.
pub struct CommandStream {
    pub sender: RequestSender,
    pub receiver: ResponseReceiver,
}

/// The executing end of a command stream.
pub struct CommandPeer {
    /// Request frames in send order; `None` once the sender closed.
    pub requests: mpsc::Receiver<RunCommandRequest>,
    /// Response frames, or a transport error observed while relaying them.
    pub responses: mpsc::Sender<Result<RunCommandResponse, StreamError>>,
}

/// Sending half of a [`CommandStream`]. Clones share one underlying channel.
#[derive(Clone)]
pub struct RequestSender {
    tx: Arc<Mutex<Option<mpsc::Sender<RunCommandRequest>>>>,
}

impl RequestSender {
    pub async fn send(&self, frame: RunCommandRequest) -> Result<(), StreamError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(StreamError::Closed)?;
        tx.send(frame).await.map_err(|_| StreamError::Closed)
    }

    /// Close the request direction. Returns `false` if it was already closed.
    pub fn close_send(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }
}

/// Receiving half of a [`CommandStream`].
pub struct ResponseReceiver {
    rx: mpsc::Receiver<Result<RunCommandResponse, StreamError>>,
}

impl ResponseReceiver {
    /// Next response frame; `Ok(None)` at end of stream.
    pub async fn recv(&mut self) -> Result<Option<RunCommandResponse>, StreamError> {
        self.rx.recv().await.transpose()
    }
}
