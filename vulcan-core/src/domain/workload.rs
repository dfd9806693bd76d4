//! Workload, log line, and classification types.
//!
//! Pure data, no I/O. The transient payload (`code`/`code_archive`) is
//! intentionally never part of any persisted row type; see `crate::store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default execution timeout applied when a workload omits `timeout_s`.
pub const DEFAULT_TIMEOUT_S: u64 = 30;

/// The language runtime a workload's code executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Go,
    Node,
    Python,
    Wasm,
    Oci,
}

impl Runtime {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Node => "node",
            Self::Python => "python",
            Self::Wasm => "wasm",
            Self::Oci => "oci",
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The isolation mechanism a workload runs under, or `Auto` to let the
/// `Registry` resolve one from the runtime via the fixed routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    Microvm,
    Isolate,
    Gvisor,
    Auto,
}

impl Isolation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Microvm => "microvm",
            Self::Isolate => "isolate",
            Self::Gvisor => "gvisor",
            Self::Auto => "auto",
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload lifecycle status. See `crate::domain::validate_transition` for
/// the allowed-transitions relation this type's values participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
}

impl WorkloadStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transient payload a workload was submitted with. Never persisted;
/// the Store only ever sees the fields in `Workload`.
#[derive(Debug, Clone)]
pub enum Payload {
    Code(String),
    Archive(Vec<u8>),
}

/// The unit of execution. `created_at`/`started_at`/`finished_at` obey
/// `created_at <= started_at <= finished_at` whenever the later fields are
/// set; `started_at` is set iff the workload ever entered `running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub runtime: Runtime,
    pub isolation: Isolation,
    pub status: WorkloadStatus,

    pub cpu_limit: Option<f64>,
    pub mem_limit_mb: Option<u32>,
    pub timeout_s: Option<u64>,

    pub output: Option<Vec<u8>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workload {
    /// Effective timeout: the workload's own value, or the 30s default.
    #[must_use]
    pub fn effective_timeout_s(&self) -> u64 {
        self.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S)
    }

    /// Build a new `pending` workload. `code`/`code_archive` mutual
    /// exclusivity is the admission layer's job (see `crate::engine`); this
    /// constructor just stamps identity and defaults.
    #[must_use]
    pub fn new_pending(runtime: Runtime, isolation: Isolation) -> Self {
        let now = Utc::now();
        Self {
            id: crate::domain::generate_workload_id(),
            runtime,
            isolation,
            status: WorkloadStatus::Pending,
            cpu_limit: None,
            mem_limit_mb: None,
            timeout_s: None,
            output: None,
            exit_code: None,
            error: None,
            duration_ms: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A single ordered log utterance for a workload, keyed by `(workload_id, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub workload_id: String,
    pub seq: i64,
    pub line: String,
    pub created_at: DateTime<Utc>,
}
