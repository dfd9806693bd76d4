//! Backend tunables, loaded from environment variables prefixed `VULCAN_FC_`
//! via `envy`. This is library-internal configuration, not the excluded
//! user-facing HTTP config surface.

use serde::Deserialize;

fn default_rootfs_dir() -> String {
    "/var/lib/vulcan/rootfs".to_string()
}

fn default_kernel_path() -> String {
    "/var/lib/vulcan/vmlinux".to_string()
}

fn default_conflist_path() -> String {
    "/etc/cni/vulcan/fcbr0.conflist".to_string()
}

fn default_cni_bin_dir() -> String {
    "/opt/cni/bin".to_string()
}

fn default_vm_scratch_dir() -> String {
    "/var/lib/vulcan/vms".to_string()
}

fn default_firecracker_binary() -> String {
    "/usr/bin/firecracker".to_string()
}

const fn default_min_cid() -> u32 {
    3
}

const fn default_max_concurrency() -> u32 {
    16
}

const fn default_vcpu_count() -> u8 {
    1
}

const fn default_mem_mb() -> u32 {
    128
}

const fn default_boot_timeout_s() -> u64 {
    5
}

const fn default_shutdown_timeout_s() -> u64 {
    2
}

/// Configuration for the Firecracker backend. One instance is shared (via
/// `Arc`) across all VMs the backend provisions.
#[derive(Debug, Clone, Deserialize)]
pub struct FirecrackerConfig {
    /// Directory containing pre-built `<runtime>.ext4` rootfs images.
    #[serde(default = "default_rootfs_dir")]
    pub rootfs_dir: String,

    /// Host path to the shared kernel image.
    #[serde(default = "default_kernel_path")]
    pub kernel_path: String,

    /// Pre-generated CNI conflist describing the `fcbr0` bridge network.
    #[serde(default = "default_conflist_path")]
    pub conflist_path: String,

    /// Directory containing the `bridge`/`host-local`/`tc-redirect-tap`
    /// plugin binaries.
    #[serde(default = "default_cni_bin_dir")]
    pub cni_bin_dir: String,

    /// Root of each VM's scratch directory (control socket, rootfs copy).
    #[serde(default = "default_vm_scratch_dir")]
    pub vm_scratch_dir: String,

    /// Path to the `firecracker` binary spawned once per VM, bound to that
    /// VM's own API socket.
    #[serde(default = "default_firecracker_binary")]
    pub firecracker_binary: String,

    /// Lowest CID ever allocated; CIDs 0-2 are reserved by the vsock
    /// convention (hypervisor, host, reserved).
    #[serde(default = "default_min_cid")]
    pub min_cid: u32,

    /// Ceiling on concurrently running VMs, and the CID scan window size
    /// beyond `min_cid` is `max_concurrency + 10`.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    #[serde(default = "default_vcpu_count")]
    pub default_vcpu_count: u8,

    #[serde(default = "default_mem_mb")]
    pub default_mem_mb: u32,

    /// How long to wait for the guest to accept a vsock connection before
    /// treating the boot as failed.
    #[serde(default = "default_boot_timeout_s")]
    pub boot_timeout_s: u64,

    /// Grace period for a cooperative shutdown before a forced VMM stop.
    #[serde(default = "default_shutdown_timeout_s")]
    pub shutdown_timeout_s: u64,
}

impl FirecrackerConfig {
    /// Load from `VULCAN_FC_*` environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns `envy::Error` if a set variable fails to parse into its
    /// target type.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("VULCAN_FC_").from_env()
    }
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            rootfs_dir: default_rootfs_dir(),
            kernel_path: default_kernel_path(),
            conflist_path: default_conflist_path(),
            cni_bin_dir: default_cni_bin_dir(),
            vm_scratch_dir: default_vm_scratch_dir(),
            firecracker_binary: default_firecracker_binary(),
            min_cid: default_min_cid(),
            max_concurrency: default_max_concurrency(),
            default_vcpu_count: default_vcpu_count(),
            default_mem_mb: default_mem_mb(),
            boot_timeout_s: default_boot_timeout_s(),
            shutdown_timeout_s: default_shutdown_timeout_s(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = FirecrackerConfig::default();
        assert_eq!(cfg.min_cid, 3);
        assert!(cfg.max_concurrency > 0);
    }
}
