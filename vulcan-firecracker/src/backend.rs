//! The `Backend` implementation: provisions one Firecracker microVM per
//! workload, drives it through boot / execute / teardown, and guarantees
//! cleanup runs on every exit path (including host task cancellation).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use vulcan_core::backend::{Backend, Capabilities, ExecutionResult, WorkloadSpec};
use vulcan_core::domain::{Isolation, Runtime};
use vulcan_core::error::{Result as CoreResult, VulcanError};

use crate::cid::CidPool;
use crate::config::FirecrackerConfig;
use crate::error::{FirecrackerError, Result};
use crate::net::NetworkManager;
use crate::rootfs;
use crate::vmm::{self, BootSource, Drive, FirecrackerClient, MachineConfig, NetworkInterface, VsockDevice};
use crate::vsock;

const VSOCK_GUEST_PORT: u32 = 52;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn runtime_name(runtime: Runtime) -> Option<&'static str> {
    match runtime {
        Runtime::Go => Some("go"),
        Runtime::Node => Some("node"),
        Runtime::Python => Some("python"),
        Runtime::Wasm | Runtime::Oci => None,
    }
}

/// Bookkeeping for one live VM, held only while it is running so
/// `cleanup(id)` and `shutdown()` can tear down VMs the normal exit path
/// never reached.
struct LiveVm {
    vm_scratch_dir: std::path::PathBuf,
    cid: u32,
    started: bool,
    vmm_process: Option<Child>,
}

/// Shared backend state. Held behind `Arc` so `FirecrackerBackend` is
/// cheaply cloned into the detached task that actually runs a workload,
/// keeping cleanup reachable even if the caller stops polling `execute`.
struct Inner {
    config: FirecrackerConfig,
    cid_pool: CidPool,
    network: Arc<NetworkManager>,
    live: Mutex<HashMap<String, LiveVm>>,
}

impl Inner {
    async fn run_one(&self, spec: WorkloadSpec) -> Result<ExecutionResult> {
        let runtime = runtime_name(spec.runtime)
            .ok_or_else(|| FirecrackerError::UnsupportedRuntime(spec.runtime.to_string()))?;

        let cid = self.cid_pool.allocate()?;
        let vm_scratch_dir = std::path::Path::new(&self.config.vm_scratch_dir).join(&spec.id);
        tokio::fs::create_dir_all(&vm_scratch_dir).await?;

        self.live.lock().await.insert(
            spec.id.clone(),
            LiveVm {
                vm_scratch_dir: vm_scratch_dir.clone(),
                cid,
                started: false,
                vmm_process: None,
            },
        );

        let outcome = self.run_vm(&spec, runtime, cid, &vm_scratch_dir).await;

        self.teardown(&spec.id).await;

        outcome
    }

    /// Spawn `firecracker` bound to its own API socket and wait for that
    /// socket to appear, bounded by `boot_timeout_s`. The child is killed if
    /// the socket never shows up.
    async fn spawn_vmm(&self, api_socket: &std::path::Path) -> Result<Child> {
        let mut child = Command::new(&self.config.firecracker_binary)
            .arg("--api-sock")
            .arg(api_socket)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + Duration::from_secs(self.config.boot_timeout_s);
        loop {
            if tokio::fs::metadata(api_socket).await.is_ok() {
                return Ok(child);
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(FirecrackerError::VmmStartup(self.config.boot_timeout_s)).inspect_err(|_| {
                    tracing::warn!(%status, "firecracker process exited before exposing its API socket");
                });
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(FirecrackerError::VmmStartup(self.config.boot_timeout_s));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn run_vm(
        &self,
        spec: &WorkloadSpec,
        runtime: &str,
        cid: u32,
        vm_scratch_dir: &std::path::Path,
    ) -> Result<ExecutionResult> {
        let network = self.network.setup(&spec.id).await?;

        let base_image = rootfs::base_image_path(&self.config.rootfs_dir, runtime);
        let rootfs_copy = vm_scratch_dir.join("rootfs.ext4");
        rootfs::provision_writable_copy(&base_image, &rootfs_copy).await?;

        let api_socket = vmm::api_socket_path(vm_scratch_dir);
        let vmm_process = self.spawn_vmm(&api_socket).await?;
        if let Some(live) = self.live.lock().await.get_mut(&spec.id) {
            live.vmm_process = Some(vmm_process);
        }

        let client = FirecrackerClient::new(api_socket);

        client
            .set_machine_config(&MachineConfig {
                vcpu_count: self.config.default_vcpu_count,
                mem_size_mib: spec.mem_limit_mb.unwrap_or(self.config.default_mem_mb),
            })
            .await?;
        client
            .set_boot_source(&BootSource {
                kernel_image_path: self.config.kernel_path.clone().into(),
                boot_args: vmm::default_boot_args(),
            })
            .await?;
        client
            .set_drive(&Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: rootfs_copy,
                is_root_device: true,
                is_read_only: false,
            })
            .await?;
        client
            .set_network_interface(&NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: network.mac_address.clone(),
                host_dev_name: network.tap_device.clone(),
            })
            .await?;
        let vsock_uds = vm_scratch_dir.join("vsock.sock");
        client
            .set_vsock(&VsockDevice {
                guest_cid: cid,
                uds_path: vsock_uds.clone(),
                vsock_id: "vsock0".to_string(),
            })
            .await?;

        client.instance_start().await?;
        if let Some(live) = self.live.lock().await.get_mut(&spec.id) {
            live.started = true;
        }

        let boot_start = Instant::now();
        let connection = vsock::dial(
            &vsock_uds,
            VSOCK_GUEST_PORT,
            Some(Duration::from_secs(self.config.boot_timeout_s)),
        )
        .await?;
        tracing::debug!(workload_id = %spec.id, boot_ms = boot_start.elapsed().as_millis(), "guest dialed");

        let request = vulcan_core::protocol::GuestRequest {
            runtime: runtime.to_string(),
            code: spec.code.clone(),
            code_archive: spec.code_archive.clone(),
            input: spec.input.clone(),
            env: HashMap::new(),
            entrypoint: None,
            timeout_s: spec.timeout_s,
        };

        let log_writer = spec.log_writer.clone();
        let response = connection
            .run(&request, |line| (log_writer)(line))
            .await?;

        Ok(ExecutionResult {
            exit_code: response.exit_code,
            output: response.output,
            error: response.error,
            duration_ms: None,
            log_lines: response.log_lines.unwrap_or_default(),
        })
    }

    /// Best-effort graceful shutdown, falling back to a forced stop, then
    /// release of CID/network/scratch resources. Runs with contexts
    /// independent of the workload's own cancellation so it always
    /// completes.
    async fn teardown(&self, vm_id: &str) {
        let live = self.live.lock().await.remove(vm_id);
        let Some(mut live) = live else { return };

        if live.started {
            let api_socket = vmm::api_socket_path(&live.vm_scratch_dir);
            let client = FirecrackerClient::new(api_socket);
            let graceful = tokio::time::timeout(
                Duration::from_secs(self.config.shutdown_timeout_s),
                client.send_ctrl_alt_del(),
            )
            .await;
            if !matches!(graceful, Ok(Ok(()))) {
                tracing::debug!(workload_id = %vm_id, "graceful shutdown failed, falling back to forced VMM stop");
            }
        }

        if let Some(mut child) = live.vmm_process.take() {
            match tokio::time::timeout(
                Duration::from_secs(self.config.shutdown_timeout_s),
                child.wait(),
            )
            .await
            {
                Ok(Ok(_)) => {}
                _ => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(workload_id = %vm_id, error = %e, "failed to force-kill VMM process");
                    }
                    if let Err(e) = child.wait().await {
                        tracing::warn!(workload_id = %vm_id, error = %e, "failed to reap VMM process after kill");
                    }
                }
            }
        }

        self.cid_pool.release(live.cid);
        if let Err(e) = self.network.teardown(vm_id).await {
            tracing::warn!(workload_id = %vm_id, error = %e, "network teardown failed");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&live.vm_scratch_dir).await {
            tracing::warn!(workload_id = %vm_id, error = %e, "scratch dir cleanup failed");
        }
    }
}

/// Firecracker-backed `Backend`. Cheaply `Clone`: every instance shares the
/// same `Inner` state, which is what lets `execute` hand the actual work off
/// to a detached task that outlives the caller's own cancellation.
#[derive(Clone)]
pub struct FirecrackerBackend {
    inner: Arc<Inner>,
}

impl FirecrackerBackend {
    /// Construct the backend and verify host prerequisites (CNI plugin
    /// binaries, IPv4 forwarding), generating the shared conflist if absent.
    ///
    /// # Errors
    ///
    /// Propagates `FirecrackerError::MissingCniPlugin` if a required binary
    /// is absent.
    pub async fn new(config: FirecrackerConfig) -> Result<Self> {
        crate::net::check_prerequisites(&config).await?;
        crate::net::ensure_conflist(&config).await?;
        let cid_pool = CidPool::new(config.min_cid, config.max_concurrency);
        let network = Arc::new(NetworkManager::new(config.clone()));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cid_pool,
                network,
                live: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[async_trait]
impl Backend for FirecrackerBackend {
    /// Runs the workload on a detached task and only awaits its completion
    /// signal here, so a caller-side cancellation (the engine wraps this
    /// future in a `tokio::time::timeout`) drops the act of *waiting*, not
    /// the VM lifecycle or its teardown.
    async fn execute(&self, spec: WorkloadSpec) -> CoreResult<ExecutionResult> {
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let result = inner.run_one(spec).await;
            let _ = tx.send(result);
        });

        match rx.await {
            Ok(result) => result.map_err(VulcanError::from),
            Err(_) => Err(VulcanError::Internal(
                "firecracker workload task ended without reporting a result".to_string(),
            )),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "firecracker".to_string(),
            supported_runtimes: vec![Runtime::Go, Runtime::Node, Runtime::Python],
            supported_isolations: vec![Isolation::Microvm],
            max_concurrency: self.inner.config.max_concurrency,
        }
    }

    async fn cleanup(&self, workload_id: &str) -> CoreResult<()> {
        self.inner.teardown(workload_id).await;
        Ok(())
    }
}

impl FirecrackerBackend {
    /// Snapshot every still-tracked VM and tear each down. Intended for
    /// process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.live.lock().await.keys().cloned().collect();
        for id in ids {
            self.inner.teardown(&id).await;
        }
    }
}
