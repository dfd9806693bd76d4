//! The isolation backend contract: the capability set every isolation
//! mechanism (microVM, language isolate, syscall-interception sandbox)
//! implements, plus the `Registry` that auto-routes workloads to one.

mod registry;

pub use registry::Registry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Isolation, Runtime};
use crate::error::Result;

/// A side-effecting callback invoked once per logical log line a backend
/// produces during execution. Must be safe to call concurrently from
/// backend-internal tasks.
pub type LogWriter = Arc<dyn Fn(String) + Send + Sync>;

/// Everything a backend needs to execute one workload to completion.
pub struct WorkloadSpec {
    pub id: String,
    pub runtime: Runtime,
    pub isolation: Isolation,
    pub code: Option<String>,
    pub code_archive: Option<Vec<u8>>,
    pub input: Option<Vec<u8>>,
    pub cpu_limit: Option<f64>,
    pub mem_limit_mb: Option<u32>,
    pub timeout_s: u64,
    pub log_writer: LogWriter,
}

/// The outcome of a single backend execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,
    pub error: Option<String>,
    /// Backend-reported wall time, if the backend can measure it more
    /// precisely than the engine's own start/end timestamps.
    pub duration_ms: Option<i64>,
    pub log_lines: Vec<String>,
}

/// What a backend supports and how much of it can run at once.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub name: String,
    pub supported_runtimes: Vec<Runtime>,
    pub supported_isolations: Vec<Isolation>,
    pub max_concurrency: u32,
}

/// An isolation mechanism capable of running exactly one workload to
/// completion or failure. Implementations are expected to be `Arc`-shared
/// across concurrently executing workloads.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run `spec` to completion or failure. `log_writer` is invoked once per
    /// logical log line produced.
    async fn execute(&self, spec: WorkloadSpec) -> Result<ExecutionResult>;

    /// What this backend supports.
    fn capabilities(&self) -> Capabilities;

    /// Release any resources still held for `workload_id`. Idempotent;
    /// a no-op if the backend has no record of the id.
    async fn cleanup(&self, workload_id: &str) -> Result<()>;
}
