//! In-memory `Store`, used by engine/broker tests that shouldn't need a real
//! SQLite file. Writes are serialized behind a single `tokio::sync::Mutex`,
//! matching the "a single writer is acceptable" guidance in §4.1.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::{validate_transition, LogLine, Workload, WorkloadStatus};
use crate::error::{Result, VulcanError};

use super::{Store, WorkloadPage, WorkloadStats, WorkloadUpdate};

#[derive(Default)]
struct Inner {
    /// Keyed by `created_at` then `id` so iteration in reverse yields
    /// `created_at DESC` order without re-sorting on every read.
    workloads: BTreeMap<String, Workload>,
    log_lines: BTreeMap<(String, i64), LogLine>,
}

/// A `Store` backed entirely by process memory. Not durable across restarts.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_workload(&self, workload: &Workload) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.workloads.contains_key(&workload.id) {
            return Err(VulcanError::Validation(format!(
                "workload {} already exists",
                workload.id
            )));
        }
        inner.workloads.insert(workload.id.clone(), workload.clone());
        Ok(())
    }

    async fn get_workload(&self, id: &str) -> Result<Workload> {
        let inner = self.inner.lock().await;
        inner
            .workloads
            .get(id)
            .cloned()
            .ok_or_else(|| VulcanError::NotFound(id.to_string()))
    }

    async fn list_workloads(&self, limit: u32, offset: u32) -> Result<WorkloadPage> {
        let inner = self.inner.lock().await;
        let mut all: Vec<&Workload> = inner.workloads.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(WorkloadPage { items, total })
    }

    async fn update_workload_status(&self, id: &str, new_status: WorkloadStatus) -> Result<()> {
        self.update_workload(
            id,
            WorkloadUpdate {
                status: Some(new_status),
                ..Default::default()
            },
        )
        .await
    }

    async fn update_workload(&self, id: &str, update: WorkloadUpdate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let workload = inner
            .workloads
            .get_mut(id)
            .ok_or_else(|| VulcanError::NotFound(id.to_string()))?;

        if let Some(new_status) = update.status {
            validate_transition(workload.status, new_status)?;
            let now = Utc::now();
            if new_status == WorkloadStatus::Running {
                workload.started_at = Some(now);
            }
            if new_status.is_terminal() {
                workload.finished_at = Some(now);
            }
            workload.status = new_status;
        }
        if update.output.is_some() {
            workload.output = update.output;
        }
        if update.exit_code.is_some() {
            workload.exit_code = update.exit_code;
        }
        if update.error.is_some() {
            workload.error = update.error;
        }
        if update.duration_ms.is_some() {
            workload.duration_ms = update.duration_ms;
        }
        Ok(())
    }

    async fn insert_log_line(&self, workload_id: &str, seq: i64, line: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = (workload_id.to_string(), seq);
        if inner.log_lines.contains_key(&key) {
            return Err(VulcanError::Persistence(format!(
                "duplicate log line ({workload_id}, {seq})"
            )));
        }
        inner.log_lines.insert(
            key,
            LogLine {
                workload_id: workload_id.to_string(),
                seq,
                line: line.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_log_lines(&self, workload_id: &str) -> Result<Vec<LogLine>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .log_lines
            .range((workload_id.to_string(), i64::MIN)..(workload_id.to_string(), i64::MAX))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn get_workload_stats(&self) -> Result<WorkloadStats> {
        let inner = self.inner.lock().await;
        let mut stats = WorkloadStats {
            total: inner.workloads.len() as u64,
            ..Default::default()
        };
        let mut completed_total_ms: i64 = 0;
        let mut completed_count: u64 = 0;
        for w in inner.workloads.values() {
            *stats.by_status.entry(w.status.as_str().to_string()).or_insert(0) += 1;
            *stats
                .by_isolation
                .entry(w.isolation.as_str().to_string())
                .or_insert(0) += 1;
            if w.status == WorkloadStatus::Completed {
                if let Some(ms) = w.duration_ms {
                    completed_total_ms += ms;
                    completed_count += 1;
                }
            }
        }
        if completed_count > 0 {
            stats.avg_duration_ms_completed =
                Some(completed_total_ms as f64 / completed_count as f64);
        }
        Ok(stats)
    }
}
