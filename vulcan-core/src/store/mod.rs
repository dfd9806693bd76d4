//! The persistence port: `Store` is implemented by `MemoryStore` (tests) and
//! `SqliteStore` (production). All operations are context-scoped and return
//! well-typed `VulcanError`s; see §4.1 for the per-operation guarantees this
//! trait is required to uphold.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::domain::{LogLine, Workload, WorkloadStatus};
use crate::error::Result;

/// A page of workloads plus the total matching count, both derived from a
/// single read-consistent snapshot.
#[derive(Debug, Clone)]
pub struct WorkloadPage {
    pub items: Vec<Workload>,
    pub total: u64,
}

/// Mutable fields a caller may update via `Store::update_workload`. Identity,
/// classification, and timestamps are managed by the Store itself.
#[derive(Debug, Clone, Default)]
pub struct WorkloadUpdate {
    pub status: Option<WorkloadStatus>,
    pub output: Option<Vec<u8>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Aggregate counters over all persisted workloads, read from one snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkloadStats {
    pub total: u64,
    pub by_status: std::collections::BTreeMap<String, u64>,
    pub by_isolation: std::collections::BTreeMap<String, u64>,
    pub avg_duration_ms_completed: Option<f64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new workload. Fails if `workload.id` already exists.
    async fn create_workload(&self, workload: &Workload) -> Result<()>;

    /// Fetch a workload by id, or `VulcanError::NotFound`.
    async fn get_workload(&self, id: &str) -> Result<Workload>;

    /// A paginated, `created_at DESC`-ordered slice plus the total count.
    async fn list_workloads(&self, limit: u32, offset: u32) -> Result<WorkloadPage>;

    /// Transition `id` to `new_status`, validating the move and stamping
    /// `started_at`/`finished_at` as appropriate, all in one atomic write.
    async fn update_workload_status(&self, id: &str, new_status: WorkloadStatus) -> Result<()>;

    /// Apply a partial update to the mutable result/status fields. When
    /// `update.status` is set, the same transition validation and timestamp
    /// stamping as `update_workload_status` applies.
    async fn update_workload(&self, id: &str, update: WorkloadUpdate) -> Result<()>;

    /// Append a log line. Fails on a duplicate `(workload_id, seq)` pair.
    async fn insert_log_line(&self, workload_id: &str, seq: i64, line: &str) -> Result<()>;

    /// All log lines for a workload, ordered by `seq`. Never returns an
    /// error for "no lines". An empty `Vec` means none were written.
    async fn get_log_lines(&self, workload_id: &str) -> Result<Vec<LogLine>>;

    /// A single consistent snapshot of aggregate statistics.
    async fn get_workload_stats(&self) -> Result<WorkloadStats>;
}
