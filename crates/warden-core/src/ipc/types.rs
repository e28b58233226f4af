//! Shared request/response types for daemon IPC.
//!
//! These types are serialized as JSON over the Unix domain socket
//! transport. Both the IPC server (daemon) and client (CLI) use
//! these types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Response to the `version` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub api_version: u32,
    pub version: String,
}

/// Health of the daemon's network override, derived on every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    /// An override is installed and healthy.
    Ok,
    /// No override is installed.
    Paused,
    /// An override is installed but reports it is not working.
    NoNetwork,
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Paused => "paused",
            Self::NoNetwork => "no network",
        })
    }
}

/// Response to the `status` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: DaemonStatus,
}

/// Reasons a `pause` request is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum PauseError {
    #[error("network overrides are already paused")]
    AlreadyPaused,

    #[error("network overrides cannot be paused while connected to a cluster")]
    ConnectedToCluster,

    #[error("unexpected error while pausing: {0}")]
    Unexpected(String),
}

/// Response to the `pause` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseResponse {
    pub error: Option<PauseError>,
}

impl PauseResponse {
    pub fn into_result(self) -> Result<(), PauseError> {
        self.error.map_or(Ok(()), Err)
    }
}

impl From<Result<(), PauseError>> for PauseResponse {
    fn from(result: Result<(), PauseError>) -> Self {
        Self {
            error: result.err(),
        }
    }
}

/// Reasons a `resume` request is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum ResumeError {
    #[error("network overrides are not paused")]
    NotPaused,

    #[error("network overrides are being re-established")]
    ReEstablishing,

    #[error("unexpected error while resuming: {0}")]
    Unexpected(String),
}

/// Response to the `resume` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeResponse {
    pub error: Option<ResumeError>,
}

impl ResumeResponse {
    pub fn into_result(self) -> Result<(), ResumeError> {
        self.error.map_or(Ok(()), Err)
    }
}

impl From<Result<(), ResumeError>> for ResumeResponse {
    fn from(result: Result<(), ResumeError>) -> Self {
        Self {
            error: result.err(),
        }
    }
}

/// Response to the `quit` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuitResponse {
    pub acknowledged: bool,
    pub message: String,
}

/// Response to the `logger` call once the client closes its stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerResponse {
    pub lines: u64,
}

/// Generic error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ── Remote command frames ───────────────────────────────────────────────

/// Category attached to command output and results.
///
/// Output tagged [`ErrorCategory::Ok`] (code 0) is standard output; any other
/// category marks standard error or a failed result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    #[default]
    Ok,
    /// The user asked for something that cannot be done.
    User,
    /// The environment or configuration is broken.
    Config,
    Unknown,
}

impl ErrorCategory {
    /// Numeric code; `0` means no error.
    pub fn code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::User => 1,
            Self::Config => 2,
            Self::Unknown => 3,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Frames sent by the party that starts a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunCommandRequest {
    /// The command line and working directory. Always the first frame.
    Command { os_args: Vec<String>, cwd: PathBuf },
    /// A chunk of standard input.
    Data { data: Vec<u8> },
    /// Ask the running command to terminate gracefully.
    SoftCancel,
}

impl RunCommandRequest {
    /// An empty `Data` frame: local input has ended and the command's stdin
    /// should be closed. The request stream itself stays open.
    pub fn end_of_input() -> Self {
        Self::Data { data: Vec::new() }
    }

    pub fn is_end_of_input(&self) -> bool {
        matches!(self, Self::Data { data } if data.is_empty())
    }
}

/// Frames sent back by the party executing a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunCommandResponse {
    /// A chunk of output: stdout when the category is `Ok`, stderr otherwise.
    Data {
        data: Vec<u8>,
        error_category: ErrorCategory,
    },
    /// Terminal frame; nothing follows it.
    Final { result: Option<CommandResult> },
}

impl RunCommandResponse {
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            data: data.into(),
            error_category: ErrorCategory::Ok,
        }
    }

    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            data: data.into(),
            error_category: ErrorCategory::Unknown,
        }
    }

    pub fn success() -> Self {
        Self::Final { result: None }
    }

    pub fn failure(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Final {
            result: Some(CommandResult {
                data: message.into().into_bytes(),
                error_category: category,
            }),
        }
    }
}

/// Structured outcome carried by a final frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub data: Vec<u8>,
    pub error_category: ErrorCategory,
}

impl CommandResult {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.error_category.is_ok()
    }

    /// The error this result describes, if any.
    ///
    /// A result with a message but no category is still a failure and is
    /// reported as [`ErrorCategory::Unknown`].
    pub fn into_error(self) -> Option<CommandError> {
        if self.is_empty() {
            return None;
        }
        let category = match self.error_category {
            ErrorCategory::Ok => ErrorCategory::Unknown,
            other => other,
        };
        Some(CommandError {
            category,
            message: String::from_utf8_lossy(&self.data).into_owned(),
        })
    }
}

/// A categorized error reported by the remote side of a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CommandError {
    pub category: ErrorCategory,
    pub message: String,
}
