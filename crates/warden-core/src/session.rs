//! Client side of `run-command`: drive one remote command session.
//!
//! A session sends the command frame, then runs three pumps over the same
//! [`CommandStream`]:
//!
//! - **input**: local stdin chunks become `Data` frames. End of input is
//!   forwarded as an empty `Data` frame and stops this pump only; the request
//!   side stays open so a `SoftCancel` can still follow.
//! - **output**: response frames are written to local stdout or stderr; the
//!   final frame decides the session's outcome.
//! - **cancel**: the first forwarded signal sends one `SoftCancel`; if the
//!   session is still running after the grace period the local cancellation
//!   token is fired.
//!
//! The output pump's result is the session's result. The request side of the
//! stream is closed exactly once when the session ends.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::stream::{CommandStream, RequestSender, ResponseReceiver, StreamError};
use crate::ipc::types::{CommandError, CommandResult, RunCommandRequest, RunCommandResponse};

/// How long a soft-cancelled command may keep running before the session
/// gives up on it.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Bytes read from local stdin per `Data` frame.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

type Input = Box<dyn AsyncRead + Unpin + Send>;
type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to send command: {0}")]
    Send(#[source] StreamError),

    #[error("command stream failed: {0}")]
    Receive(#[source] StreamError),

    #[error("failed to write command output: {0}")]
    Output(#[from] std::io::Error),

    /// The remote side reported a categorized failure.
    #[error(transparent)]
    Remote(CommandError),
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The remote side finished and reported success (or closed the stream).
    Completed,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The remote side ignored a soft cancel for the whole grace period.
    HardCancelled,
}

/// One remote command invocation.
pub struct RemoteCommandSession {
    stdin: Input,
    stdout: Output,
    stderr: Output,
    interrupts: Option<broadcast::Receiver<Signal>>,
    grace_period: Duration,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl RemoteCommandSession {
    pub fn new(stdin: Input, stdout: Output, stderr: Output) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            interrupts: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    /// A session wired to the process's own standard streams.
    pub fn stdio() -> Self {
        Self::new(
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
            Box::new(tokio::io::stderr()),
        )
    }

    /// Signals received here trigger the soft-cancel handshake.
    pub fn with_interrupts(mut self, interrupts: broadcast::Receiver<Signal>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Scope the session under `parent`; cancelling it ends the session.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Run `os_args` in `cwd` on the far side of `stream`.
    pub async fn run(
        self,
        stream: CommandStream,
        os_args: Vec<String>,
        cwd: PathBuf,
    ) -> Result<Termination, SessionError> {
        let CommandStream {
            sender,
            mut receiver,
        } = stream;
        let cancel = self.cancel;

        debug!(args = ?os_args, cwd = %cwd.display(), "starting remote command");
        if let Err(e) = sender
            .send(RunCommandRequest::Command { os_args, cwd })
            .await
        {
            sender.close_send();
            return Err(SessionError::Send(e));
        }

        let input = tokio::spawn(pump_input(
            self.stdin,
            sender.clone(),
            self.chunk_size,
            cancel.clone(),
        ));

        let hard_cancelled = Arc::new(AtomicBool::new(false));
        let canceller = self.interrupts.map(|interrupts| {
            tokio::spawn(pump_cancel(
                interrupts,
                sender.clone(),
                self.grace_period,
                cancel.clone(),
                hard_cancelled.clone(),
            ))
        });

        let outcome = pump_output(&mut receiver, self.stdout, self.stderr, &cancel).await;

        let was_cancelled = cancel.is_cancelled();
        sender.close_send();
        cancel.cancel();
        input.abort();
        if let Some(canceller) = canceller {
            canceller.abort();
        }

        outcome?;
        Ok(if hard_cancelled.load(Ordering::SeqCst) {
            Termination::HardCancelled
        } else if was_cancelled {
            Termination::Cancelled
        } else {
            Termination::Completed
        })
    }
}

async fn pump_output(
    receiver: &mut ResponseReceiver,
    mut stdout: Output,
    mut stderr: Output,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            received = receiver.recv() => received,
        };

        match received {
            Ok(Some(RunCommandResponse::Data {
                data,
                error_category,
            })) => {
                let out = if error_category.is_ok() {
                    &mut stdout
                } else {
                    &mut stderr
                };
                out.write_all(&data).await?;
                out.flush().await?;
            }
            Ok(Some(RunCommandResponse::Final { result })) => {
                return match result.and_then(CommandResult::into_error) {
                    Some(err) => Err(SessionError::Remote(err)),
                    None => Ok(()),
                };
            }
            Ok(None) => return Ok(()),
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(SessionError::Receive(e)),
        }
    }
}

async fn pump_input(
    mut stdin: Input,
    sender: RequestSender,
    chunk_size: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = stdin.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("local input reached end of file");
                if let Err(e) = sender.send(RunCommandRequest::end_of_input()).await
                    && !cancel.is_cancelled()
                {
                    warn!(error = %e, "failed to forward end of input");
                }
                return;
            }
            Ok(n) => {
                let frame = RunCommandRequest::Data {
                    data: buf[..n].to_vec(),
                };
                if let Err(e) = sender.send(frame).await {
                    if !cancel.is_cancelled() {
                        warn!(error = %e, "failed to forward input");
                    }
                    return;
                }
            }
            Err(e) => {
                if !cancel.is_cancelled() {
                    warn!(error = %e, "failed to read local input");
                }
                return;
            }
        }
    }
}

async fn pump_cancel(
    mut interrupts: broadcast::Receiver<Signal>,
    sender: RequestSender,
    grace_period: Duration,
    cancel: CancellationToken,
    hard_cancelled: Arc<AtomicBool>,
) {
    let signal = tokio::select! {
        _ = cancel.cancelled() => return,
        received = interrupts.recv() => match received {
            Ok(signal) => Some(signal),
            Err(RecvError::Lagged(_)) => None,
            Err(RecvError::Closed) => return,
        },
    };

    info!(
        signal = signal.map_or("signal", Signal::as_str),
        "Asking remote command to stop"
    );
    if let Err(e) = sender.send(RunCommandRequest::SoftCancel).await {
        if !cancel.is_cancelled() {
            warn!(error = %e, "failed to send soft cancel");
        }
        return;
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(grace_period) => {
            warn!(
                grace_secs = grace_period.as_secs(),
                "Remote command still running after soft cancel; cancelling"
            );
            hard_cancelled.store(true, Ordering::SeqCst);
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    use crate::ipc::stream::{CommandPeer, duplex};
    use crate::ipc::types::ErrorCategory;

    /// Clonable in-memory writer.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AsyncWrite for Captured {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Fixture {
        stdout: Captured,
        stderr: Captured,
        session: RemoteCommandSession,
    }

    fn fixture(stdin: &'static [u8]) -> Fixture {
        let stdout = Captured::default();
        let stderr = Captured::default();
        let session = RemoteCommandSession::new(
            Box::new(stdin),
            Box::new(stdout.clone()),
            Box::new(stderr.clone()),
        );
        Fixture {
            stdout,
            stderr,
            session,
        }
    }

    /// Next request frame, skipping end-of-input markers.
    async fn next_request(peer: &mut CommandPeer) -> Option<RunCommandRequest> {
        loop {
            match peer.requests.recv().await {
                Some(frame) if frame.is_end_of_input() => continue,
                other => return other,
            }
        }
    }

    async fn respond(peer: &CommandPeer, frame: RunCommandResponse) {
        peer.responses.send(Ok(frame)).await.unwrap();
    }

    fn spawn_session(
        session: RemoteCommandSession,
        args: &[&str],
    ) -> (
        CommandPeer,
        tokio::task::JoinHandle<Result<Termination, SessionError>>,
    ) {
        let (stream, peer) = duplex(16);
        let os_args = args.iter().map(|s| s.to_string()).collect();
        let task = tokio::spawn(session.run(stream, os_args, PathBuf::from("/work")));
        (peer, task)
    }

    #[tokio::test]
    async fn test_echo_session_writes_stdout() {
        let fx = fixture(b"");
        let (mut peer, task) = spawn_session(fx.session, &["echo", "hi"]);

        assert_eq!(
            peer.requests.recv().await,
            Some(RunCommandRequest::Command {
                os_args: vec!["echo".into(), "hi".into()],
                cwd: PathBuf::from("/work"),
            })
        );
        respond(&peer, RunCommandResponse::stdout("h")).await;
        respond(&peer, RunCommandResponse::stdout("i\n")).await;
        respond(&peer, RunCommandResponse::success()).await;

        assert_eq!(task.await.unwrap().unwrap(), Termination::Completed);
        assert_eq!(fx.stdout.bytes(), b"hi\n");
        assert!(fx.stderr.bytes().is_empty());

        // The request side was closed when the session ended.
        assert_eq!(next_request(&mut peer).await, None);
    }

    #[tokio::test]
    async fn test_stderr_routing_by_category() {
        let fx = fixture(b"");
        let (mut peer, task) = spawn_session(fx.session, &["make"]);
        peer.requests.recv().await.unwrap();

        respond(&peer, RunCommandResponse::stdout("building\n")).await;
        respond(&peer, RunCommandResponse::stderr("warning\n")).await;
        respond(
            &peer,
            RunCommandResponse::Data {
                data: b"config\n".to_vec(),
                error_category: ErrorCategory::Config,
            },
        )
        .await;
        drop(peer.responses);

        assert_eq!(task.await.unwrap().unwrap(), Termination::Completed);
        assert_eq!(fx.stdout.bytes(), b"building\n");
        assert_eq!(fx.stderr.bytes(), b"warning\nconfig\n");
    }

    #[tokio::test]
    async fn test_final_error_ends_session_without_reading_further() {
        let fx = fixture(b"");
        let (mut peer, task) = spawn_session(fx.session, &["false"]);
        peer.requests.recv().await.unwrap();

        respond(
            &peer,
            RunCommandResponse::failure(ErrorCategory::User, "command exit status: 1"),
        )
        .await;
        respond(&peer, RunCommandResponse::stdout("late")).await;

        let err = task.await.unwrap().unwrap_err();
        let SessionError::Remote(remote) = err else {
            panic!("expected a remote error");
        };
        assert_eq!(remote.category, ErrorCategory::User);
        assert_eq!(remote.message, "command exit status: 1");
        assert!(fx.stdout.bytes().is_empty());
    }

    #[tokio::test]
    async fn test_empty_final_result_is_success() {
        let fx = fixture(b"");
        let (mut peer, task) = spawn_session(fx.session, &["true"]);
        peer.requests.recv().await.unwrap();
        respond(
            &peer,
            RunCommandResponse::Final {
                result: Some(CommandResult::default()),
            },
        )
        .await;
        assert_eq!(task.await.unwrap().unwrap(), Termination::Completed);
    }

    #[tokio::test]
    async fn test_stdin_is_chunked_into_data_frames() {
        let fx = fixture(b"abcde");
        let session = fx.session.with_chunk_size(2);
        let (mut peer, task) = spawn_session(session, &["cat"]);
        peer.requests.recv().await.unwrap();

        let mut forwarded: Vec<Vec<u8>> = Vec::new();
        while forwarded.concat().len() < 5 {
            match peer.requests.recv().await.unwrap() {
                RunCommandRequest::Data { data } => forwarded.push(data),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(forwarded, vec![b"ab".to_vec(), b"cd".to_vec(), b"e".to_vec()]);

        respond(&peer, RunCommandResponse::success()).await;
        assert_eq!(task.await.unwrap().unwrap(), Termination::Completed);
    }

    #[tokio::test]
    async fn test_end_of_input_keeps_request_side_open() {
        let fx = fixture(b"last line\n");
        let (signals, interrupts) = broadcast::channel(4);
        let session = fx.session.with_interrupts(interrupts);
        let (mut peer, task) = spawn_session(session, &["cat"]);
        peer.requests.recv().await.unwrap();

        assert_eq!(
            peer.requests.recv().await,
            Some(RunCommandRequest::Data {
                data: b"last line\n".to_vec()
            })
        );
        assert_eq!(
            peer.requests.recv().await,
            Some(RunCommandRequest::end_of_input())
        );

        // A soft cancel can still be sent after input has ended.
        signals.send(Signal::SIGINT).unwrap();
        assert_eq!(
            peer.requests.recv().await,
            Some(RunCommandRequest::SoftCancel)
        );

        respond(&peer, RunCommandResponse::success()).await;
        assert_eq!(task.await.unwrap().unwrap(), Termination::Completed);
        assert_eq!(peer.requests.recv().await, None);
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let fx = fixture(b"");
        let (mut peer, task) = spawn_session(fx.session, &["ls"]);
        peer.requests.recv().await.unwrap();
        peer.responses
            .send(Err(StreamError::Transport("connection reset".into())))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Receive(StreamError::Transport(_))));
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let fx = fixture(b"");
        let (stream, peer) = duplex(1);
        drop(peer);
        let err = fx
            .session
            .run(stream, vec!["ls".into()], PathBuf::from("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Send(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_signal_sends_one_soft_cancel_and_remote_finishes() {
        let fx = fixture(b"");
        let (signals, interrupts) = broadcast::channel(4);
        let session = fx.session.with_interrupts(interrupts);
        let (mut peer, task) = spawn_session(session, &["sleep", "30"]);
        peer.requests.recv().await.unwrap();

        signals.send(Signal::SIGINT).unwrap();
        assert_eq!(
            next_request(&mut peer).await,
            Some(RunCommandRequest::SoftCancel)
        );

        respond(&peer, RunCommandResponse::stderr("terminated\n")).await;
        respond(
            &peer,
            RunCommandResponse::failure(ErrorCategory::User, "command signal: 15 (SIGTERM)"),
        )
        .await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Remote(_)));
        assert_eq!(fx.stderr.bytes(), b"terminated\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_soft_cancel_escalates_after_grace_period() {
        let fx = fixture(b"");
        let (signals, interrupts) = broadcast::channel(4);
        let session = fx.session.with_interrupts(interrupts);
        let (mut peer, task) = spawn_session(session, &["sleep", "30"]);
        peer.requests.recv().await.unwrap();

        signals.send(Signal::SIGTERM).unwrap();
        assert_eq!(
            next_request(&mut peer).await,
            Some(RunCommandRequest::SoftCancel)
        );
        let cancelled_at = Instant::now();
        signals.send(Signal::SIGTERM).unwrap();

        // The peer stays silent but keeps the stream open.
        let termination = task.await.unwrap().unwrap();
        assert_eq!(termination, Termination::HardCancelled);
        assert!(cancelled_at.elapsed() >= DEFAULT_GRACE_PERIOD);

        let mut soft_cancels = 0;
        while let Some(frame) = peer.requests.recv().await {
            if frame == RunCommandRequest::SoftCancel {
                soft_cancels += 1;
            }
        }
        assert_eq!(soft_cancels, 0, "only one soft cancel is ever sent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_grace_period() {
        let fx = fixture(b"");
        let (signals, interrupts) = broadcast::channel(4);
        let session = fx
            .session
            .with_interrupts(interrupts)
            .with_grace_period(Duration::from_secs(1));
        let (mut peer, task) = spawn_session(session, &["sleep", "30"]);
        peer.requests.recv().await.unwrap();

        signals.send(Signal::SIGHUP).unwrap();
        assert_eq!(
            next_request(&mut peer).await,
            Some(RunCommandRequest::SoftCancel)
        );
        let start = Instant::now();

        assert_eq!(task.await.unwrap().unwrap(), Termination::HardCancelled);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < DEFAULT_GRACE_PERIOD);
    }

    #[tokio::test]
    async fn test_parent_cancellation_ends_session() {
        let fx = fixture(b"");
        let parent = CancellationToken::new();
        let session = fx.session.with_cancellation(&parent);
        let (mut peer, task) = spawn_session(session, &["sleep", "30"]);
        peer.requests.recv().await.unwrap();

        parent.cancel();
        assert_eq!(task.await.unwrap().unwrap(), Termination::Cancelled);
        assert_eq!(next_request(&mut peer).await, None);
    }
}
