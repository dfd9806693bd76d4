//! Per-VM writable rootfs provisioning: a reflink-preferring copy-on-write
//! clone of the runtime's read-only base image, falling back to a full copy
//! on filesystems that don't support reflinks.

use std::path::{Path, PathBuf};

use crate::error::{FirecrackerError, Result};

/// Map a runtime name to its pre-built base image under `rootfs_dir`.
#[must_use]
pub fn base_image_path(rootfs_dir: &str, runtime: &str) -> PathBuf {
    Path::new(rootfs_dir).join(format!("{runtime}.ext4"))
}

/// Clone `base_image` into `dest` via reflink where the filesystem supports
/// it, falling back to a full byte-for-byte copy otherwise.
///
/// # Errors
///
/// `FirecrackerError::Rootfs` if the base image does not exist, or if both
/// the reflink and fallback copy fail.
pub async fn provision_writable_copy(base_image: &Path, dest: &Path) -> Result<()> {
    if tokio::fs::metadata(base_image).await.is_err() {
        return Err(FirecrackerError::Rootfs(format!(
            "base image not found: {}",
            base_image.display()
        )));
    }

    let base_image = base_image.to_path_buf();
    let dest_owned = dest.to_path_buf();
    let reflink_result = tokio::task::spawn_blocking(move || {
        reflink_copy::reflink(&base_image, &dest_owned)
    })
    .await;

    match reflink_result {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "reflink copy unsupported, falling back to full copy");
        }
        Err(e) => {
            tracing::debug!(error = %e, "reflink copy task panicked, falling back to full copy");
        }
    }

    tokio::fs::copy(&base_image, dest)
        .await
        .map(|_| ())
        .map_err(|e| FirecrackerError::Rootfs(format!("fallback copy failed: {e}")))
}
