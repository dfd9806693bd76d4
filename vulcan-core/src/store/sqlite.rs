//! SQLite-backed `Store`, the production persistence implementation.
//!
//! Writes run against a pool capped at a single connection, so SQLite's own
//! file locking becomes the serialization point (a single writer is
//! acceptable here) instead of an additional in-process mutex duplicating
//! that guarantee. Multi-row reads (`list_workloads`,
//! `get_workload_stats`) run inside a `BEGIN DEFERRED` transaction so the
//! slice and the count/aggregate come from one snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::{validate_transition, LogLine, Workload, WorkloadStatus};
use crate::error::{Result, VulcanError};

use super::{Store, WorkloadPage, WorkloadStats, WorkloadUpdate};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to (creating if absent) the SQLite database at `url` and run
    /// embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns `VulcanError::Persistence` if the connection or migration
    /// fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| VulcanError::Persistence(e.to_string()))?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_workload(row: &sqlx::sqlite::SqliteRow) -> Result<Workload> {
    let status_str: String = row.try_get("status")?;
    let isolation_str: String = row.try_get("isolation")?;
    let runtime_str: String = row.try_get("runtime")?;

    Ok(Workload {
        id: row.try_get("id")?,
        runtime: parse_runtime(&runtime_str)?,
        isolation: parse_isolation(&isolation_str)?,
        status: parse_status(&status_str)?,
        cpu_limit: row.try_get("cpu_limit")?,
        mem_limit_mb: row
            .try_get::<Option<i64>, _>("mem_limit")?
            .map(|v| v as u32),
        timeout_s: row
            .try_get::<Option<i64>, _>("timeout_s")?
            .map(|v| v as u64),
        output: row.try_get("output")?,
        exit_code: row
            .try_get::<Option<i64>, _>("exit_code")?
            .map(|v| v as i32),
        error: row.try_get("error")?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn parse_status(s: &str) -> Result<WorkloadStatus> {
    match s {
        "pending" => Ok(WorkloadStatus::Pending),
        "running" => Ok(WorkloadStatus::Running),
        "completed" => Ok(WorkloadStatus::Completed),
        "failed" => Ok(WorkloadStatus::Failed),
        "killed" => Ok(WorkloadStatus::Killed),
        other => Err(VulcanError::Internal(format!("unknown status {other:?}"))),
    }
}

fn parse_isolation(s: &str) -> Result<crate::domain::Isolation> {
    use crate::domain::Isolation::{Auto, Gvisor, Isolate, Microvm};
    match s {
        "microvm" => Ok(Microvm),
        "isolate" => Ok(Isolate),
        "gvisor" => Ok(Gvisor),
        "auto" => Ok(Auto),
        other => Err(VulcanError::Internal(format!("unknown isolation {other:?}"))),
    }
}

fn parse_runtime(s: &str) -> Result<crate::domain::Runtime> {
    use crate::domain::Runtime::{Go, Node, Oci, Python, Wasm};
    match s {
        "go" => Ok(Go),
        "node" => Ok(Node),
        "python" => Ok(Python),
        "wasm" => Ok(Wasm),
        "oci" => Ok(Oci),
        other => Err(VulcanError::Internal(format!("unknown runtime {other:?}"))),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_workload(&self, workload: &Workload) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO workloads \
             (id, status, isolation, runtime, cpu_limit, mem_limit, timeout_s, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workload.id)
        .bind(workload.status.as_str())
        .bind(workload.isolation.as_str())
        .bind(workload.runtime.as_str())
        .bind(workload.cpu_limit)
        .bind(workload.mem_limit_mb.map(i64::from))
        .bind(workload.timeout_s.map(|v| v as i64))
        .bind(workload.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                VulcanError::Validation(format!("workload {} already exists", workload.id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_workload(&self, id: &str) -> Result<Workload> {
        let row = sqlx::query("SELECT * FROM workloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| VulcanError::NotFound(id.to_string()))?;
        row_to_workload(&row)
    }

    async fn list_workloads(&self, limit: u32, offset: u32) -> Result<WorkloadPage> {
        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workloads")
            .fetch_one(&mut *tx)
            .await?;

        let rows = sqlx::query(
            "SELECT * FROM workloads ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let items = rows
            .iter()
            .map(row_to_workload)
            .collect::<Result<Vec<_>>>()?;

        Ok(WorkloadPage {
            items,
            total: total as u64,
        })
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
        let mut tx = self.pool.begin().await?;

        let current_status: String =
            sqlx::query_scalar("SELECT status FROM workloads WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| VulcanError::NotFound(id.to_string()))?;
        let current_status = parse_status(&current_status)?;

        let now: DateTime<Utc> = Utc::now();
        let mut new_status_str: Option<&'static str> = None;
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut finished_at: Option<DateTime<Utc>> = None;

        if let Some(new_status) = update.status {
            validate_transition(current_status, new_status)?;
            new_status_str = Some(new_status.as_str());
            if new_status == WorkloadStatus::Running {
                started_at = Some(now);
            }
            if new_status.is_terminal() {
                finished_at = Some(now);
            }
        }

        sqlx::query(
            "UPDATE workloads SET \
             status = COALESCE(?, status), \
             output = COALESCE(?, output), \
             exit_code = COALESCE(?, exit_code), \
             error = COALESCE(?, error), \
             duration_ms = COALESCE(?, duration_ms), \
             started_at = COALESCE(?, started_at), \
             finished_at = COALESCE(?, finished_at) \
             WHERE id = ?",
        )
        .bind(new_status_str)
        .bind(update.output)
        .bind(update.exit_code.map(i64::from))
        .bind(update.error)
        .bind(update.duration_ms)
        .bind(started_at)
        .bind(finished_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_log_line(&self, workload_id: &str, seq: i64, line: &str) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO log_lines (workload_id, seq, line, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(workload_id)
        .bind(seq)
        .bind(line)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(VulcanError::Persistence(format!(
                    "duplicate log line ({workload_id}, {seq})"
                )))
            }
            Err(e) => Err(VulcanError::Persistence(e.to_string())),
        }
    }

    async fn get_log_lines(&self, workload_id: &str) -> Result<Vec<LogLine>> {
        let rows =
            sqlx::query("SELECT workload_id, seq, line, created_at FROM log_lines WHERE workload_id = ? ORDER BY seq ASC")
                .bind(workload_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                Ok(LogLine {
                    workload_id: row.try_get("workload_id")?,
                    seq: row.try_get("seq")?,
                    line: row.try_get("line")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn get_workload_stats(&self) -> Result<WorkloadStats> {
        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workloads")
            .fetch_one(&mut *tx)
            .await?;

        let status_rows = sqlx::query("SELECT status, COUNT(*) as n FROM workloads GROUP BY status")
            .fetch_all(&mut *tx)
            .await?;
        let isolation_rows =
            sqlx::query("SELECT isolation, COUNT(*) as n FROM workloads GROUP BY isolation")
                .fetch_all(&mut *tx)
                .await?;
        let avg_duration: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(duration_ms) FROM workloads WHERE status = 'completed'",
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut by_status = std::collections::BTreeMap::new();
        for row in &status_rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            by_status.insert(status, n as u64);
        }
        let mut by_isolation = std::collections::BTreeMap::new();
        for row in &isolation_rows {
            let isolation: String = row.try_get("isolation")?;
            let n: i64 = row.try_get("n")?;
            by_isolation.insert(isolation, n as u64);
        }

        Ok(WorkloadStats {
            total: total as u64,
            by_status,
            by_isolation,
            avg_duration_ms_completed: avg_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Isolation, Runtime};

    async fn new_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = new_store().await;
        let w = Workload::new_pending(Runtime::Go, Isolation::Microvm);
        store.create_workload(&w).await.unwrap();
        let fetched = store.get_workload(&w.id).await.unwrap();
        assert_eq!(fetched.id, w.id);
        assert_eq!(fetched.runtime, Runtime::Go);
    }

    #[tokio::test]
    async fn duplicate_create_is_validation_error() {
        let store = new_store().await;
        let w = Workload::new_pending(Runtime::Go, Isolation::Microvm);
        store.create_workload(&w).await.unwrap();
        let err = store.create_workload(&w).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let store = new_store().await;
        let w = Workload::new_pending(Runtime::Go, Isolation::Microvm);
        store.create_workload(&w).await.unwrap();
        let err = store
            .update_workload_status(&w.id, WorkloadStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[tokio::test]
    async fn log_lines_ordered_and_empty_when_absent() {
        let store = new_store().await;
        let w = Workload::new_pending(Runtime::Go, Isolation::Microvm);
        store.create_workload(&w).await.unwrap();
        assert!(store.get_log_lines(&w.id).await.unwrap().is_empty());
        store.insert_log_line(&w.id, 0, "a\nb\nc").await.unwrap();
        let lines = store.get_log_lines(&w.id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "a\nb\nc");
    }

    #[tokio::test]
    async fn duplicate_seq_is_rejected() {
        let store = new_store().await;
        let w = Workload::new_pending(Runtime::Go, Isolation::Microvm);
        store.create_workload(&w).await.unwrap();
        store.insert_log_line(&w.id, 0, "a").await.unwrap();
        let err = store.insert_log_line(&w.id, 0, "b").await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
        let lines = store.get_log_lines(&w.id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "a");
    }

    #[tokio::test]
    async fn stats_average_only_over_completed() {
        let store = new_store().await;
        let w1 = Workload::new_pending(Runtime::Go, Isolation::Microvm);
        store.create_workload(&w1).await.unwrap();
        store
            .update_workload_status(&w1.id, WorkloadStatus::Running)
            .await
            .unwrap();
        store
            .update_workload(
                &w1.id,
                WorkloadUpdate {
                    status: Some(WorkloadStatus::Completed),
                    duration_ms: Some(250),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = store.get_workload_stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.avg_duration_ms_completed, Some(250.0));
    }
}
