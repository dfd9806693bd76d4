//! Crate-local error type. Every variant maps onto one `VulcanError` kind so
//! the engine never needs to know about Firecracker-specific failure modes.

use thiserror::Error;
use vulcan_core::error::VulcanError;

#[derive(Debug, Error)]
pub enum FirecrackerError {
    #[error("unsupported runtime for microvm isolation: {0}")]
    UnsupportedRuntime(String),

    #[error("no free CID in pool (scanned {scanned} slots from cursor {cursor})")]
    CidPoolExhausted { scanned: u32, cursor: u32 },

    #[error("CNI plugin {plugin} failed: {message}")]
    Cni { plugin: String, message: String },

    #[error("missing required CNI plugin binary: {0}")]
    MissingCniPlugin(String),

    #[error("rootfs provisioning failed: {0}")]
    Rootfs(String),

    #[error("VMM control error: {0}")]
    Vmm(#[from] crate::vmm::VmmError),

    #[error("vsock handshake or framing error: {0}")]
    Vsock(String),

    #[error("firecracker process did not expose its API socket within {0}s")]
    VmmStartup(u64),

    #[error("workload execution timed out after {0}s")]
    Timeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FirecrackerError> for VulcanError {
    fn from(err: FirecrackerError) -> Self {
        match err {
            FirecrackerError::UnsupportedRuntime(msg) => VulcanError::Validation(msg),
            FirecrackerError::CidPoolExhausted { .. } => {
                VulcanError::ResourceExhaustion(err.to_string())
            }
            FirecrackerError::Cni { .. }
            | FirecrackerError::MissingCniPlugin(_)
            | FirecrackerError::Rootfs(_)
            | FirecrackerError::Vmm(_)
            | FirecrackerError::VmmStartup(_)
            | FirecrackerError::Io(_) => VulcanError::Provisioning(err.to_string()),
            FirecrackerError::Vsock(_) => VulcanError::Protocol(err.to_string()),
            FirecrackerError::Timeout(s) => VulcanError::Timeout(s),
        }
    }
}

pub type Result<T> = std::result::Result<T, FirecrackerError>;
