//! Error taxonomy for the harness.
//!
//! Setup and connection failures are fatal to a run and are grouped under
//! [`HarnessError`]. Build, transfer and execution failures are scoped to a
//! single test and end up in a [`crate::runner::TestResult`] instead of
//! propagating.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while preparing the run or bringing the emulator up.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to create run working directory: {0}")]
    WorkDir(#[source] std::io::Error),

    #[error("{label} not found at {}", path.display())]
    MissingImage { label: &'static str, path: PathBuf },

    #[error("failed to copy {} to {}: {source}", src.display(), dst.display())]
    Copy {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create emulator runtime directory: {0}")]
    RuntimeDir(#[source] std::io::Error),

    #[error("failed to launch emulator `{}`: {source}", binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("console marker {marker:?} not seen within {timeout:?}")]
    ConsoleTimeout {
        marker: String,
        timeout: Duration,
        transcript: String,
    },

    #[error("console closed before marker {marker:?} appeared")]
    ConsoleClosed { marker: String, transcript: String },

    #[error("failed to read emulator console: {source}")]
    ConsoleRead {
        #[source]
        source: std::io::Error,
        transcript: String,
    },
}

impl SetupError {
    /// Console text captured up to the failure, if this error carries any.
    pub fn transcript(&self) -> Option<&str> {
        match self {
            SetupError::ConsoleTimeout { transcript, .. }
            | SetupError::ConsoleClosed { transcript, .. }
            | SetupError::ConsoleRead { transcript, .. } => Some(transcript),
            _ => None,
        }
    }

    /// Replace the captured transcript with a later, more complete one.
    pub(crate) fn refresh_transcript(&mut self, text: String) {
        match self {
            SetupError::ConsoleTimeout { transcript, .. }
            | SetupError::ConsoleClosed { transcript, .. }
            | SetupError::ConsoleRead { transcript, .. } => *transcript = text,
            _ => {}
        }
    }
}

/// Failures while opening the remote session into the guest.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to allocate a local port for guest ssh: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("failed to spawn ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ssh connection to {addr} failed: {detail}")]
    Dial { addr: String, detail: String },

    #[error("ssh connection to {addr} not established within {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("guest session is closed")]
    Closed,
}

/// Failures on the QMP control socket.
#[derive(Error, Debug)]
pub enum QmpError {
    #[error("QMP socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed QMP frame {line:?}: {source}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode QMP command: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("QMP connection closed by peer")]
    Closed,

    #[error("QMP error: {0}")]
    Command(String),
}

/// Run-fatal failures: anything that prevents guest interaction at all.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Failure to produce the test artifact on the host.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot derive an artifact name from {}", .0.display())]
    InvalidSource(PathBuf),

    #[error("build command template is empty")]
    EmptyCommand,

    #[error("failed to spawn build command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build did not finish within {0:?}")]
    Timeout(Duration),

    #[error("build failed (exit {code:?}):\n{output}")]
    Failed { code: Option<i32>, output: String },
}

/// Failure to place an artifact inside the guest.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("guest session is closed")]
    Closed,

    #[error("failed to spawn scp: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("transfer of {} did not finish within {timeout:?}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("scp of {} failed (exit {code:?}): {stderr}", path.display())]
    Failed {
        path: PathBuf,
        code: Option<i32>,
        stderr: String,
    },
}

/// Failure of a command run inside the guest. Always carries whatever
/// combined output was captured.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("guest session is closed")]
    Closed,

    #[error("failed to spawn ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("remote command did not finish within {timeout:?}")]
    Timeout { timeout: Duration, output: String },

    #[error("remote command exited with status {code}")]
    NonZeroExit { code: i32, output: String },

    #[error("remote channel failed: {detail}")]
    Channel { detail: String, output: String },
}

impl ExecutionError {
    /// Combined stdout/stderr captured before the failure.
    pub fn output(&self) -> &str {
        match self {
            ExecutionError::Closed | ExecutionError::Spawn(_) => "",
            ExecutionError::Timeout { output, .. }
            | ExecutionError::NonZeroExit { output, .. }
            | ExecutionError::Channel { output, .. } => output,
        }
    }
}
