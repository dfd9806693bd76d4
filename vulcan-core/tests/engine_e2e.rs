//! End-to-end engine scenarios against `MemoryStore` and scripted backends.
//! Mirrors the scenario list the engine's design notes call out as the
//! concrete proof that submission, execution, timeout, and log delivery
//! compose correctly end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use vulcan_core::backend::{Backend, Capabilities, ExecutionResult, Registry, WorkloadSpec};
use vulcan_core::domain::{Isolation, Runtime, WorkloadStatus};
use vulcan_core::engine::{Engine, SubmitRequest};
use vulcan_core::error::Result;
use vulcan_core::store::{MemoryStore, Store};

struct EchoBackend {
    isolation: Isolation,
}

#[async_trait]
impl Backend for EchoBackend {
    async fn execute(&self, spec: WorkloadSpec) -> Result<ExecutionResult> {
        (spec.log_writer)(format!("running {}", spec.id));
        Ok(ExecutionResult {
            exit_code: Some(0),
            output: spec.code.unwrap_or_default().into_bytes(),
            error: None,
            duration_ms: None,
            log_lines: vec![],
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: format!("{}-echo", self.isolation),
            supported_runtimes: vec![Runtime::Node, Runtime::Go, Runtime::Python],
            supported_isolations: vec![self.isolation],
            max_concurrency: 10,
        }
    }

    async fn cleanup(&self, _workload_id: &str) -> Result<()> {
        Ok(())
    }
}

struct HangingBackend;

#[async_trait]
impl Backend for HangingBackend {
    async fn execute(&self, _spec: WorkloadSpec) -> Result<ExecutionResult> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(ExecutionResult::default())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "hanging".to_string(),
            supported_runtimes: vec![Runtime::Node],
            supported_isolations: vec![Isolation::Isolate],
            max_concurrency: 1,
        }
    }

    async fn cleanup(&self, _workload_id: &str) -> Result<()> {
        Ok(())
    }
}

struct MultiLineBackend {
    lines: Vec<&'static str>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Backend for MultiLineBackend {
    async fn execute(&self, spec: WorkloadSpec) -> Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for line in &self.lines {
            (spec.log_writer)((*line).to_string());
        }
        Ok(ExecutionResult {
            exit_code: Some(0),
            output: b"ok".to_vec(),
            error: None,
            duration_ms: None,
            log_lines: vec![],
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "multiline".to_string(),
            supported_runtimes: vec![Runtime::Node],
            supported_isolations: vec![Isolation::Isolate],
            max_concurrency: 1,
        }
    }

    async fn cleanup(&self, _workload_id: &str) -> Result<()> {
        Ok(())
    }
}

fn base_request(code: &str) -> SubmitRequest {
    SubmitRequest {
        runtime: Runtime::Node,
        isolation: Isolation::Isolate,
        code: Some(code.to_string()),
        code_archive: None,
        input: None,
        cpu_limit: None,
        mem_limit_mb: None,
        timeout_s: None,
    }
}

#[tokio::test]
async fn happy_path_submission_runs_to_completion() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = Registry::new();
    registry.register(
        Isolation::Isolate,
        Arc::new(EchoBackend {
            isolation: Isolation::Isolate,
        }),
    );
    let engine = Engine::new(store.clone(), registry);

    let workload = engine.submit(base_request("return 1 + 1")).await.unwrap();
    assert_eq!(workload.status, WorkloadStatus::Pending);

    engine.wait().await;

    let finished = store.get_workload(&workload.id).await.unwrap();
    assert_eq!(finished.status, WorkloadStatus::Completed);
    assert_eq!(finished.exit_code, Some(0));
    assert_eq!(finished.output.as_deref(), Some(b"return 1 + 1".as_slice()));
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());
}

#[tokio::test]
async fn timeout_marks_workload_failed_without_killing_the_process() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = Registry::new();
    registry.register(Isolation::Isolate, Arc::new(HangingBackend));
    let engine = Engine::new(store.clone(), registry);

    let mut req = base_request("while true {}");
    req.timeout_s = Some(1);
    let workload = engine.submit(req).await.unwrap();

    engine.wait().await;

    let finished = store.get_workload(&workload.id).await.unwrap();
    assert_eq!(finished.status, WorkloadStatus::Failed);
    assert!(finished.error.unwrap().contains("timed out after 1s"));
}

#[tokio::test]
async fn auto_isolation_routes_go_to_microvm_backend() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = Registry::new();
    registry.register(
        Isolation::Microvm,
        Arc::new(EchoBackend {
            isolation: Isolation::Microvm,
        }),
    );
    let engine = Engine::new(store.clone(), registry);

    let mut req = base_request("package main");
    req.runtime = Runtime::Go;
    req.isolation = Isolation::Auto;
    let workload = engine.submit(req).await.unwrap();

    engine.wait().await;

    let finished = store.get_workload(&workload.id).await.unwrap();
    assert_eq!(finished.status, WorkloadStatus::Completed);
    // The persisted isolation field stays `auto`; only routing resolved it.
    assert_eq!(finished.isolation, Isolation::Auto);
}

#[tokio::test]
async fn missing_backend_for_requested_isolation_fails_the_workload() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(); // nothing registered
    let engine = Engine::new(store.clone(), registry);

    let workload = engine.submit(base_request("noop")).await.unwrap();
    engine.wait().await;

    let finished = store.get_workload(&workload.id).await.unwrap();
    assert_eq!(finished.status, WorkloadStatus::Failed);
    assert!(finished.error.is_some());
}

#[tokio::test]
async fn multi_line_log_output_is_persisted_in_order_and_published_live() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = Registry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.register(
        Isolation::Isolate,
        Arc::new(MultiLineBackend {
            lines: vec!["line a", "line b", "line c"],
            calls: calls.clone(),
        }),
    );
    let engine = Engine::new(store.clone(), registry);

    let workload = engine.submit(base_request("print thrice")).await.unwrap();
    // Subscribe promptly; the broker never blocks producers so this may miss
    // lines published before the subscribe call lands, which is expected.
    let mut rx = engine.broker().subscribe(&workload.id);

    // engine.wait() awaits the run_workload task, which itself awaits every
    // spawned log-writer task before closing the broker topic, so no extra
    // sleep is needed for either the store or the live subscriber to settle.
    engine.wait().await;

    let lines = store.get_log_lines(&workload.id).await.unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].seq, 0);
    assert_eq!(lines[0].line, "line a");
    assert_eq!(lines[2].seq, 2);
    assert_eq!(lines[2].line, "line c");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut received = Vec::new();
    while let Some(line) = rx.recv().await {
        received.push(line);
    }
    // Whatever the live subscriber received (it may have missed lines
    // published before its subscribe call landed) must be an ordered,
    // contiguous suffix of the persisted log: the broker never reorders or
    // duplicates what it does deliver, and it must have delivered
    // everything published after the subscription, since close only runs
    // once every publish task has finished.
    let full: Vec<&str> = lines.iter().map(|l| l.line.as_str()).collect();
    let received_refs: Vec<&str> = received.iter().map(String::as_str).collect();
    assert!(full.ends_with(&received_refs[..]));
}

#[tokio::test]
async fn double_kill_is_rejected_by_the_state_machine() {
    let store = Arc::new(MemoryStore::new());
    let workload = vulcan_core::domain::Workload::new_pending(Runtime::Node, Isolation::Isolate);
    store.create_workload(&workload).await.unwrap();

    store
        .update_workload_status(&workload.id, WorkloadStatus::Running)
        .await
        .unwrap();
    store
        .update_workload_status(&workload.id, WorkloadStatus::Killed)
        .await
        .unwrap();

    let err = store
        .update_workload_status(&workload.id, WorkloadStatus::Killed)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
}
