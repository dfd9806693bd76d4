//! The asynchronous execution engine: drives each workload through
//! `pending -> running -> {completed, failed, killed}`, enforcing timeouts
//! and fanning log output out to the Store and the `LogBroker`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::backend::{ExecutionResult, LogWriter, Registry, WorkloadSpec};
use crate::broker::LogBroker;
use crate::domain::{Isolation, Runtime, Workload, WorkloadStatus, DEFAULT_TIMEOUT_S};
use crate::error::{Result, VulcanError};
use crate::store::{Store, WorkloadUpdate};

/// Submission parameters the HTTP surface (or any other caller) assembles
/// before calling `Engine::submit`. Mirrors the `WorkloadSpec` fields that
/// are caller-supplied rather than engine- or backend-derived.
pub struct SubmitRequest {
    pub runtime: Runtime,
    pub isolation: Isolation,
    pub code: Option<String>,
    pub code_archive: Option<Vec<u8>>,
    pub input: Option<Vec<u8>>,
    pub cpu_limit: Option<f64>,
    pub mem_limit_mb: Option<u32>,
    pub timeout_s: Option<u64>,
}

/// Owns the Store, Registry, and Broker handles and drives submitted
/// workloads through execution on detached tasks.
pub struct Engine {
    store: Arc<dyn Store>,
    registry: Registry,
    broker: Arc<LogBroker>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, registry: Registry) -> Self {
        Self {
            store,
            registry,
            broker: Arc::new(LogBroker::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn broker(&self) -> Arc<LogBroker> {
        self.broker.clone()
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Validate admission rules (code XOR code_archive), persist a new
    /// `pending` workload, spawn its detached execution task, and return
    /// immediately. No error is returned unless persistence itself failed.
    ///
    /// # Errors
    ///
    /// `VulcanError::Validation` if both or neither of `code`/`code_archive`
    /// are present. `VulcanError::Persistence` if the initial write fails.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Workload> {
        match (&req.code, &req.code_archive) {
            (Some(_), Some(_)) => {
                return Err(VulcanError::Validation(
                    "code and code_archive are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(VulcanError::Validation(
                    "one of code or code_archive is required".to_string(),
                ))
            }
            _ => {}
        }

        let mut workload = Workload::new_pending(req.runtime, req.isolation);
        workload.cpu_limit = req.cpu_limit;
        workload.mem_limit_mb = req.mem_limit_mb;
        workload.timeout_s = req.timeout_s;

        self.store.create_workload(&workload).await?;

        let store = self.store.clone();
        let registry = self.registry.clone();
        let broker = self.broker.clone();
        let id = workload.id.clone();
        let code = req.code;
        let code_archive = req.code_archive;
        let input = req.input;

        let handle = tokio::spawn(async move {
            run_workload(store, registry, broker, id, code, code_archive, input).await;
        });

        self.tasks.lock().await.push(handle);
        Ok(workload)
    }

    /// Block until every in-flight execution task has finished. Intended
    /// for graceful shutdown.
    pub async fn wait(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_workload(
    store: Arc<dyn Store>,
    registry: Registry,
    broker: Arc<LogBroker>,
    id: String,
    code: Option<String>,
    code_archive: Option<Vec<u8>>,
    input: Option<Vec<u8>>,
) {
    let start = std::time::Instant::now();
    let pending_logs: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));

    if let Err(e) = store
        .update_workload_status(&id, WorkloadStatus::Running)
        .await
    {
        tracing::error!(workload_id = %id, error = %e, "failed to transition to running");
        let _ = store
            .update_workload(
                &id,
                WorkloadUpdate {
                    status: Some(WorkloadStatus::Failed),
                    error: Some(format!("failed to start: {e}")),
                    ..Default::default()
                },
            )
            .await;
        close_workload_topic(&broker, &pending_logs, &id).await;
        return;
    }

    let workload = match store.get_workload(&id).await {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(workload_id = %id, error = %e, "workload vanished after start");
            close_workload_topic(&broker, &pending_logs, &id).await;
            return;
        }
    };

    let timeout_s = workload.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S);
    let log_writer = make_log_writer(store.clone(), broker.clone(), id.clone(), pending_logs.clone());

    let backend = match registry.resolve(workload.isolation, workload.runtime) {
        Ok(backend) => backend,
        Err(e) => {
            finish_failed(&store, &id, e.to_string(), start).await;
            close_workload_topic(&broker, &pending_logs, &id).await;
            return;
        }
    };

    let spec = WorkloadSpec {
        id: id.clone(),
        runtime: workload.runtime,
        isolation: workload.isolation,
        code,
        code_archive,
        input,
        cpu_limit: workload.cpu_limit,
        mem_limit_mb: workload.mem_limit_mb,
        timeout_s,
        log_writer,
    };

    let execution = tokio::time::timeout(
        std::time::Duration::from_secs(timeout_s),
        backend.execute(spec),
    )
    .await;

    match execution {
        Err(_elapsed) => {
            finish_failed(
                &store,
                &id,
                format!("workload timed out after {timeout_s}s"),
                start,
            )
            .await;
        }
        Ok(Err(e)) => {
            finish_failed(&store, &id, e.to_string(), start).await;
        }
        Ok(Ok(result)) => {
            finish_completed(&store, &id, result, start).await;
        }
    }

    close_workload_topic(&broker, &pending_logs, &id).await;
}

fn make_log_writer(
    store: Arc<dyn Store>,
    broker: Arc<LogBroker>,
    workload_id: String,
    pending: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
) -> LogWriter {
    let seq = Arc::new(AtomicI64::new(0));
    Arc::new(move |line: String| {
        let store = store.clone();
        let broker = broker.clone();
        let workload_id = workload_id.clone();
        let seq = seq.clone();
        let this_seq = seq.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            if let Err(e) = store.insert_log_line(&workload_id, this_seq, &line).await {
                tracing::warn!(workload_id = %workload_id, error = %e, "log persistence failed");
            }
            broker.publish(&workload_id, &line);
        });
        pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    })
}

/// Awaits every log-writer task spawned so far (there can be none in
/// flight once the backend's execution future has resolved, since nothing
/// calls `log_writer` after that point) before closing the broker topic, so
/// a line whose persist+publish task is still scheduled can never be
/// dropped by a `publish` landing after `close`.
async fn close_workload_topic(
    broker: &LogBroker,
    pending: &std::sync::Mutex<Vec<JoinHandle<()>>>,
    id: &str,
) {
    let handles: Vec<_> =
        std::mem::take(&mut *pending.lock().unwrap_or_else(PoisonError::into_inner));
    for handle in handles {
        let _ = handle.await;
    }
    broker.close(id);
}

async fn finish_failed(store: &Arc<dyn Store>, id: &str, message: String, start: std::time::Instant) {
    let duration_ms = start.elapsed().as_millis() as i64;
    let _ = store
        .update_workload(
            id,
            WorkloadUpdate {
                status: Some(WorkloadStatus::Failed),
                error: Some(message),
                duration_ms: Some(duration_ms),
                ..Default::default()
            },
        )
        .await;
}

async fn finish_completed(
    store: &Arc<dyn Store>,
    id: &str,
    result: ExecutionResult,
    start: std::time::Instant,
) {
    let wall_clock_ms = start.elapsed().as_millis() as i64;
    let duration_ms = match result.duration_ms {
        Some(ms) if ms > 0 => ms,
        _ => wall_clock_ms,
    };
    let _ = store
        .update_workload(
            id,
            WorkloadUpdate {
                status: Some(WorkloadStatus::Completed),
                output: Some(result.output),
                exit_code: result.exit_code,
                error: result.error,
                duration_ms: Some(duration_ms),
            },
        )
        .await;
}
