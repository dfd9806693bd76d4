//! Firecracker VMM control: a minimal HTTP-over-Unix-socket client against
//! the subset of the Firecracker API this backend needs (boot-source,
//! drives, network-interfaces, vsock, actions).

use std::path::{Path, PathBuf};

use hyper::body::Buf;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("transport error talking to {0}: {1}")]
    Transport(String, hyper::Error),

    #[error("malformed JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("malformed request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),

    #[error("firecracker returned {status} for {path}: {fault_message}")]
    ApiError {
        status: StatusCode,
        path: String,
        fault_message: String,
    },
}

#[derive(Debug, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Serialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
    pub vsock_id: String,
}

#[derive(Debug, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum Action {
    InstanceStart,
    SendCtrlAltDel,
}

#[derive(Debug, Serialize)]
struct ActionBody {
    action_type: Action,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    fault_message: String,
}

/// Control-plane client for one Firecracker instance's API socket.
pub struct FirecrackerClient {
    socket_path: PathBuf,
    inner: Client<UnixConnector>,
}

impl FirecrackerClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            inner: Client::unix(),
        }
    }

    pub async fn set_machine_config(&self, config: &MachineConfig) -> Result<(), VmmError> {
        self.put("/machine-config", config).await
    }

    pub async fn set_boot_source(&self, source: &BootSource) -> Result<(), VmmError> {
        self.put("/boot-source", source).await
    }

    pub async fn set_drive(&self, drive: &Drive) -> Result<(), VmmError> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    pub async fn set_network_interface(&self, iface: &NetworkInterface) -> Result<(), VmmError> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    pub async fn set_vsock(&self, vsock: &VsockDevice) -> Result<(), VmmError> {
        self.put("/vsock", vsock).await
    }

    pub async fn instance_start(&self) -> Result<(), VmmError> {
        self.action(Action::InstanceStart).await
    }

    pub async fn send_ctrl_alt_del(&self) -> Result<(), VmmError> {
        self.action(Action::SendCtrlAltDel).await
    }

    async fn action(&self, action: Action) -> Result<(), VmmError> {
        self.put("/actions", &ActionBody { action_type: action }).await
    }

    async fn put<S: Serialize>(&self, path: &str, body: &S) -> Result<(), VmmError> {
        let json = serde_json::to_vec(body)?;
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .header(hyper::header::ACCEPT, "application/json")
            .body(Body::from(json))?;

        let response = self
            .inner
            .request(request)
            .await
            .map_err(|e| VmmError::Transport(path.to_string(), e))?;

        if response.status() == StatusCode::NO_CONTENT || response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = hyper::body::aggregate(response)
            .await
            .map_err(|e| VmmError::Transport(path.to_string(), e))?;
        let fault_message = serde_json::from_reader::<_, ApiErrorBody>(body.reader())
            .map(|e| e.fault_message)
            .unwrap_or_else(|_| "unknown error".to_string());

        Err(VmmError::ApiError {
            status,
            path: path.to_string(),
            fault_message,
        })
    }
}

/// Standard kernel boot args for the Vulcan guest image.
#[must_use]
pub fn default_boot_args() -> String {
    "console=ttyS0 reboot=k panic=1 pci=off init=/usr/local/bin/vulcan-guest".to_string()
}

/// Path to a VM's firecracker API socket inside its scratch directory.
#[must_use]
pub fn api_socket_path(vm_scratch_dir: &Path) -> PathBuf {
    vm_scratch_dir.join("firecracker.socket")
}
