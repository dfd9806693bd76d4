//! Agent-local error type. Per-connection errors are always caught and
//! reported back to that connection's host as a terminal `result`; the
//! agent itself never exits because of them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("archive entry escapes the working directory: {0}")]
    PathTraversal(String),

    #[error("archive extraction failed: {0}")]
    Archive(String),

    #[error("neither code nor code_archive was provided")]
    MissingPayload,

    #[error("process spawn failed: {0}")]
    Spawn(std::io::Error),

    #[error("child process did not inherit a piped {0}")]
    MissingPipe(&'static str),

    #[error("framing error: {0}")]
    Framing(#[from] vulcan_core::protocol::FramingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
