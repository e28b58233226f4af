//! Newline-delimited framing for streamed IPC bodies.

use std::fmt;

use futures::{Stream, StreamExt};
use hyper::body::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors from encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("stream transport failed: {0}")]
    Transport(String),
}

/// Serialize one frame as a JSON line.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, FrameError> {
    let mut buf = serde_json::to_vec(frame).map_err(FrameError::Encode)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

/// Parse one JSON line (without its terminator).
pub fn decode<T: DeserializeOwned>(line: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(line).map_err(FrameError::Decode)
}

/// Accumulates body chunks and yields complete lines.
///
/// Lines are returned without the trailing `\n` (or `\r\n`).
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete line, if one has arrived.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        strip_cr(&mut line);
        Some(line)
    }

    /// Take whatever is left once the input has ended. Returns `None` if
    /// nothing but a line terminator was pending.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let mut rest = std::mem::take(&mut self.buf);
        strip_cr(&mut rest);
        (!rest.is_empty()).then_some(rest)
    }
}

fn strip_cr(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
}

/// Decode a chunked byte stream into typed frames.
///
/// Blank lines are skipped. The stream ends after the first transport error.
pub fn decode_frames<T, S, E>(body: S) -> impl Stream<Item = Result<T, FrameError>> + Send
where
    T: DeserializeOwned + Send,
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display,
{
    let state = (Box::pin(body), LineBuffer::new(), false);
    futures::stream::unfold(state, |(mut body, mut lines, mut ended)| async move {
        loop {
            if let Some(line) = lines.next_line() {
                if line.is_empty() {
                    continue;
                }
                return Some((decode(&line), (body, lines, ended)));
            }
            if ended {
                let rest = lines.finish()?;
                return Some((decode(&rest), (body, lines, ended)));
            }
            match body.next().await {
                Some(Ok(chunk)) => lines.push(&chunk),
                Some(Err(e)) => {
                    let err = FrameError::Transport(e.to_string());
                    return Some((Err(err), (body, LineBuffer::new(), true)));
                }
                None => ended = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::types::RunCommandRequest;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut lines = LineBuffer::new();
        lines.push(b"first li");
        assert_eq!(lines.next_line(), None);

        lines.push(b"ne\r\nsecond\n\nthi");
        assert_eq!(lines.next_line().unwrap(), b"first line");
        assert_eq!(lines.next_line().unwrap(), b"second");
        assert_eq!(lines.next_line().unwrap(), b"");
        assert_eq!(lines.next_line(), None);

        lines.push(b"rd");
        assert_eq!(lines.finish().unwrap(), b"third");
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_encode_is_one_line() {
        let bytes = encode(&RunCommandRequest::Data {
            data: b"a\nb".to_vec(),
        })
        .unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert!(bytes.ends_with(b"\n"));
    }

    #[tokio::test]
    async fn test_decode_frames_from_chunks() {
        let wire = [
            encode(&RunCommandRequest::Command {
                os_args: vec!["true".into()],
                cwd: "/".into(),
            })
            .unwrap(),
            encode(&RunCommandRequest::SoftCancel).unwrap(),
        ]
        .concat();

        // Split at awkward boundaries.
        let chunks: Vec<Result<Bytes, std::io::Error>> = wire
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let frames: Vec<_> = decode_frames::<RunCommandRequest, _, _>(futures::stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Ok(RunCommandRequest::SoftCancel)));
    }

    #[tokio::test]
    async fn test_decode_frames_unterminated_tail_and_errors() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"soft_cancel\"}")),
        ];
        let frames: Vec<_> = decode_frames::<RunCommandRequest, _, _>(futures::stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());

        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"not json\n")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"{\"type\":\"soft_cancel\"}\n")),
        ];
        let frames: Vec<_> = decode_frames::<RunCommandRequest, _, _>(futures::stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FrameError::Decode(_))));
        assert!(matches!(frames[1], Err(FrameError::Transport(_))));
    }
}
