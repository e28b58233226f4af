//! Daemon side of `run-command`: runs the requested program and streams its
//! output back as response frames.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ipc::stream::{CommandPeer, StreamError};
use crate::ipc::types::{ErrorCategory, RunCommandRequest, RunCommandResponse};
use crate::supervisor::Shutdown;

const OUTPUT_CHUNK: usize = 8192;

/// How long output may keep flowing after the command has exited. Pipes
/// inherited by a background process it started can stay open indefinitely.
pub const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

type Responses = mpsc::Sender<Result<RunCommandResponse, StreamError>>;

/// Execute one command session to completion.
///
/// Sends exactly one final frame unless the initiating side went away first,
/// in which case the child is killed. Daemon shutdown delivers `SIGTERM` to
/// the child and still waits for it so its remaining output is delivered.
/// Output still open [`OUTPUT_DRAIN`] after the child exits is dropped.
pub async fn execute(peer: CommandPeer, shutdown: Shutdown) {
    let CommandPeer {
        mut requests,
        responses,
    } = peer;

    let (os_args, cwd) = match requests.recv().await {
        Some(RunCommandRequest::Command { os_args, cwd }) => (os_args, cwd),
        Some(_) => {
            finish(
                &responses,
                RunCommandResponse::failure(
                    ErrorCategory::User,
                    "expected a command frame before any other frame",
                ),
            )
            .await;
            return;
        }
        None => {
            debug!("run-command stream closed before a command arrived");
            return;
        }
    };

    let Some((program, args)) = os_args.split_first() else {
        finish(
            &responses,
            RunCommandResponse::failure(ErrorCategory::User, "no command given"),
        )
        .await;
        return;
    };

    info!(program = %program, cwd = %cwd.display(), "Running remote command");

    let mut child = match Command::new(program)
        .args(args)
        .current_dir(&cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %program, error = %e, "failed to start remote command");
            finish(
                &responses,
                RunCommandResponse::failure(
                    ErrorCategory::User,
                    format!("failed to start {program}: {e}"),
                ),
            )
            .await;
            return;
        }
    };

    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump_output(out, responses.clone(), ErrorCategory::Ok)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump_output(err, responses.clone(), ErrorCategory::Unknown)));
    let soft_cancel = Arc::new(Notify::new());
    let input = tokio::spawn(pump_input(
        requests,
        child.stdin.take(),
        soft_cancel.clone(),
    ));

    // Signals are only sent from this loop, before `wait` has reaped the
    // child, so the pid cannot have been reused.
    let mut terminating = false;
    let exited = loop {
        tokio::select! {
            status = child.wait() => break Some(status),
            _ = responses.closed() => break None,
            _ = soft_cancel.notified() => {
                info!(program = %program, "Soft cancel received; terminating remote command");
                terminate(pid);
            }
            _ = shutdown.wait(), if !terminating => {
                terminating = true;
                info!(program = %program, "Daemon shutting down; terminating remote command");
                terminate(pid);
            }
        }
    };
    input.abort();

    let Some(status) = exited else {
        warn!(program = %program, "client went away; killing remote command");
        if let Err(e) = child.kill().await {
            debug!(error = %e, "failed to kill remote command");
        }
        return;
    };

    let mut pumps: Vec<JoinHandle<()>> = [stdout, stderr].into_iter().flatten().collect();
    let drained = tokio::time::timeout(OUTPUT_DRAIN, async {
        for pump in pumps.iter_mut() {
            let _ = pump.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            program = %program,
            "output still open after the command exited; dropping it"
        );
        for pump in &pumps {
            pump.abort();
        }
        // Nothing may be sent after the final frame.
        for pump in pumps {
            let _ = pump.await;
        }
    }

    finish(&responses, final_frame(status)).await;
}

fn final_frame(status: std::io::Result<ExitStatus>) -> RunCommandResponse {
    match status {
        Ok(status) if status.success() => RunCommandResponse::success(),
        Ok(status) => {
            debug!(%status, "remote command failed");
            RunCommandResponse::failure(ErrorCategory::User, format!("command {status}"))
        }
        Err(e) => RunCommandResponse::failure(
            ErrorCategory::Unknown,
            format!("failed to wait for command: {e}"),
        ),
    }
}

async fn finish(responses: &Responses, frame: RunCommandResponse) {
    if responses.send(Ok(frame)).await.is_err() {
        debug!("client closed the stream before the final frame");
    }
}

async fn pump_output<R>(mut reader: R, responses: Responses, category: ErrorCategory)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "remote command output closed");
                return;
            }
        };
        let frame = RunCommandResponse::Data {
            data: buf[..n].to_vec(),
            error_category: category,
        };
        if responses.send(Ok(frame)).await.is_err() {
            return;
        }
    }
}

async fn pump_input(
    mut requests: mpsc::Receiver<RunCommandRequest>,
    mut stdin: Option<ChildStdin>,
    soft_cancel: Arc<Notify>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            request if request.is_end_of_input() => {
                if stdin.take().is_some() {
                    debug!("end of input; closing remote command stdin");
                }
            }
            RunCommandRequest::Data { data } => {
                let Some(pipe) = stdin.as_mut() else {
                    continue;
                };
                if let Err(e) = pipe.write_all(&data).await {
                    debug!(error = %e, "remote command stdin closed");
                    stdin = None;
                }
            }
            RunCommandRequest::SoftCancel => soft_cancel.notify_one(),
            RunCommandRequest::Command { .. } => {
                warn!("ignoring repeated command frame");
            }
        }
    }
    // End of the request stream closes the child's stdin.
    drop(stdin);
}

fn terminate(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "failed to signal remote command");
    }
}
