//! CNI-driven per-VM networking: network namespace lifecycle and the
//! `bridge` + `tc-redirect-tap` + `host-local` plugin chain against the
//! process-wide `fcbr0` conflist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::config::FirecrackerConfig;
use crate::error::{FirecrackerError, Result};

/// What `configure` returns after a successful CNI ADD: enough to wire up
/// the VM's network interface.
#[derive(Debug, Clone)]
pub struct VmNetwork {
    pub namespace: String,
    pub namespace_path: PathBuf,
    pub tap_device: String,
    pub mac_address: String,
    pub ip_address: String,
}

/// Required binaries checked for at backend init.
const REQUIRED_PLUGINS: &[&str] = &["bridge", "host-local", "tc-redirect-tap"];

/// Verify the CNI plugin binaries required by the conflist are present and
/// enable IPv4 forwarding if it is currently disabled.
///
/// # Errors
///
/// `FirecrackerError::MissingCniPlugin` if a required binary is absent from
/// `cni_bin_dir`.
pub async fn check_prerequisites(config: &FirecrackerConfig) -> Result<()> {
    for plugin in REQUIRED_PLUGINS {
        let path = Path::new(&config.cni_bin_dir).join(plugin);
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(FirecrackerError::MissingCniPlugin(
                path.display().to_string(),
            ));
        }
    }
    enable_ipv4_forwarding().await?;
    Ok(())
}

async fn enable_ipv4_forwarding() -> Result<()> {
    const PROC_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
    let current = tokio::fs::read_to_string(PROC_PATH).await.unwrap_or_default();
    if current.trim() == "1" {
        return Ok(());
    }
    tokio::fs::write(PROC_PATH, b"1\n").await?;
    Ok(())
}

const BRIDGE_NAME: &str = "fcbr0";
const BRIDGE_SUBNET: &str = "10.168.0.0/24";
const BRIDGE_GATEWAY: &str = "10.168.0.1";

/// The two-plugin conflist every VM's networking runs against: `bridge`
/// (with embedded `host-local` IPAM) then `tc-redirect-tap`, fixed to the
/// shared `fcbr0`/`10.168.0.0/24` network.
fn default_conflist() -> serde_json::Value {
    serde_json::json!({
        "cniVersion": "1.0.0",
        "name": "vulcan-fcbr0",
        "plugins": [
            {
                "type": "bridge",
                "bridge": BRIDGE_NAME,
                "isGateway": true,
                "ipMasq": true,
                "ipam": {
                    "type": "host-local",
                    "subnet": BRIDGE_SUBNET,
                    "gateway": BRIDGE_GATEWAY,
                },
            },
            {
                "type": "tc-redirect-tap",
            },
        ],
    })
}

/// Write the process-wide conflist to `config.conflist_path` if nothing is
/// there yet. Idempotent: a conflist already present (from this process's
/// own earlier call, or supplied externally) is left untouched.
///
/// # Errors
///
/// `FirecrackerError::Io` if the parent directory cannot be created or the
/// file cannot be written.
pub async fn ensure_conflist(config: &FirecrackerConfig) -> Result<()> {
    let path = Path::new(&config.conflist_path);
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(&default_conflist()).map_err(|e| FirecrackerError::Cni {
        plugin: "conflist".to_string(),
        message: e.to_string(),
    })?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Tracks `vm_id -> network namespace path` for teardown, and serializes CNI
/// invocations (the plugins are not guaranteed concurrency-safe against a
/// shared conflist/IPAM store).
pub struct NetworkManager {
    config: FirecrackerConfig,
    namespaces: Mutex<HashMap<String, PathBuf>>,
}

impl NetworkManager {
    #[must_use]
    pub fn new(config: FirecrackerConfig) -> Self {
        Self {
            config,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Create `vulcan-<vm_id>`'s namespace and run the CNI ADD chain inside
    /// it, returning the allocated TAP device, MAC, and IP.
    ///
    /// # Errors
    ///
    /// `FirecrackerError::Cni` on a non-zero-exit or unparseable plugin
    /// invocation; `FirecrackerError::Io` on namespace-command failures.
    pub async fn setup(&self, vm_id: &str) -> Result<VmNetwork> {
        let namespace = format!("vulcan-{vm_id}");
        run_ip(&["netns", "add", &namespace]).await?;
        let namespace_path = PathBuf::from("/var/run/netns").join(&namespace);

        let conflist = tokio::fs::read_to_string(&self.config.conflist_path).await?;
        let result = match self.cni_add(vm_id, &namespace, &conflist).await {
            Ok(result) => result,
            Err(e) => {
                // Best-effort rollback of the namespace we just created.
                let _ = run_ip(&["netns", "del", &namespace]).await;
                return Err(e);
            }
        };

        self.namespaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(vm_id.to_string(), namespace_path.clone());

        let tap_device = pick_tap_device(&result)?;
        let interface = result
            .interfaces
            .iter()
            .find(|i| i.name == tap_device)
            .ok_or_else(|| FirecrackerError::Cni {
                plugin: "tc-redirect-tap".to_string(),
                message: format!("no interface record for {tap_device}"),
            })?;
        let ip_address = result
            .ips
            .iter()
            .find(|ip| ip.interface == Some(tap_device.clone()))
            .or_else(|| result.ips.first())
            .map(|ip| ip.address.clone())
            .ok_or_else(|| FirecrackerError::Cni {
                plugin: "host-local".to_string(),
                message: "no IP assigned".to_string(),
            })?;

        Ok(VmNetwork {
            namespace,
            namespace_path,
            tap_device,
            mac_address: interface.mac.clone().unwrap_or_default(),
            ip_address,
        })
    }

    async fn cni_add(&self, vm_id: &str, namespace: &str, conflist: &str) -> Result<CniResult> {
        invoke_cni(
            "ADD",
            &self.config.cni_bin_dir,
            vm_id,
            namespace,
            "eth0",
            conflist,
        )
        .await
    }

    /// Tear down `vm_id`'s networking: CNI DEL (idempotent), then remove the
    /// namespace (also idempotent; a missing namespace is not an error).
    pub async fn teardown(&self, vm_id: &str) -> Result<()> {
        let namespace = format!("vulcan-{vm_id}");
        let conflist = tokio::fs::read_to_string(&self.config.conflist_path)
            .await
            .unwrap_or_default();
        if !conflist.is_empty() {
            let _ = invoke_cni(
                "DEL",
                &self.config.cni_bin_dir,
                vm_id,
                &namespace,
                "eth0",
                &conflist,
            )
            .await;
        }
        let _ = run_ip(&["netns", "del", &namespace]).await;
        self.namespaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(vm_id);
        Ok(())
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip")
        .args(args)
        .kill_on_drop(true)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(FirecrackerError::Cni {
            plugin: "ip".to_string(),
            message: format!("`ip {}` exited with {status}", args.join(" ")),
        })
    }
}

/// Run one CNI plugin invocation following the CNI calling convention: the
/// conflist's `plugins` array is invoked in order over stdin, each plugin
/// binary resolved from `cni_bin_dir` via `CNI_PATH`.
async fn invoke_cni(
    command: &str,
    cni_bin_dir: &str,
    container_id: &str,
    netns: &str,
    ifname: &str,
    conflist: &str,
) -> Result<CniResult> {
    let conf: ConfList = serde_json::from_str(conflist)
        .map_err(|e| FirecrackerError::Cni {
            plugin: "conflist".to_string(),
            message: e.to_string(),
        })?;

    let mut prev_result: Option<serde_json::Value> = None;
    for plugin in &conf.plugins {
        let binary = Path::new(cni_bin_dir).join(&plugin.plugin_type);
        let mut stdin_payload = plugin.raw.clone();
        if let Some(prev) = &prev_result {
            if let serde_json::Value::Object(ref mut map) = stdin_payload {
                map.insert("prevResult".to_string(), prev.clone());
            }
        }

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", container_id)
            .env("CNI_NETNS", netns)
            .env("CNI_IFNAME", ifname)
            .env("CNI_PATH", cni_bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&stdin_payload).unwrap_or_default();
            stdin.write_all(&payload).await?;
        }

        let mut stdout = Vec::new();
        if let Some(mut handle) = child.stdout.take() {
            handle.read_to_end(&mut stdout).await?;
        }
        let mut stderr = Vec::new();
        if let Some(mut handle) = child.stderr.take() {
            handle.read_to_end(&mut stderr).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(FirecrackerError::Cni {
                plugin: plugin.plugin_type.clone(),
                message: String::from_utf8_lossy(&stderr).to_string(),
            });
        }
        if command == "ADD" && !stdout.is_empty() {
            prev_result = serde_json::from_slice(&stdout).ok();
        }
    }

    let Some(result) = prev_result else {
        return Ok(CniResult::default());
    };
    Ok(serde_json::from_value(result).unwrap_or_default())
}

/// Find the sandbox-side interface that `tc-redirect-tap` added: the one
/// whose name differs from the logical `eth0` veth name. Falls back to the
/// first sandboxed interface if no such mismatch exists.
fn pick_tap_device(result: &CniResult) -> Result<String> {
    let sandboxed: Vec<&CniInterface> = result
        .interfaces
        .iter()
        .filter(|i| i.sandbox.as_deref().is_some_and(|s| !s.is_empty()))
        .collect();

    if let Some(tap) = sandboxed.iter().find(|i| i.name != "eth0") {
        return Ok(tap.name.clone());
    }
    if let Some(first) = sandboxed.first() {
        return Ok(first.name.clone());
    }
    Err(FirecrackerError::Cni {
        plugin: "tc-redirect-tap".to_string(),
        message: "no sandboxed interface in CNI result".to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct ConfList {
    plugins: Vec<PluginConf>,
}

#[derive(Debug, Deserialize)]
struct PluginConf {
    #[serde(rename = "type")]
    plugin_type: String,
    #[serde(flatten)]
    raw: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct CniResult {
    #[serde(default)]
    interfaces: Vec<CniInterface>,
    #[serde(default)]
    ips: Vec<CniIp>,
}

#[derive(Debug, Deserialize)]
struct CniInterface {
    name: String,
    #[serde(default)]
    mac: Option<String>,
    #[serde(default)]
    sandbox: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CniIp {
    address: String,
    #[serde(default)]
    interface: Option<String>,
}
