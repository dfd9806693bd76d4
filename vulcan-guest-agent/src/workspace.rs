//! Materializes a workload's code into a per-workload working directory:
//! either a single inline source file, or a gzip tarball extracted entry by
//! entry with path-traversal rejection.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use vulcan_core::protocol::GuestRequest;

use crate::error::{AgentError, Result};

/// Entry point filename used for inline `code`, named per-runtime so the
/// runtime's own interpreter/toolchain picks the right extension.
fn entrypoint_filename(runtime: &str) -> &'static str {
    match runtime {
        "node" => "index.js",
        "python" => "main.py",
        "go" => "main.go",
        _ => "entrypoint",
    }
}

/// Build `work_dir` (must not already exist) and populate it from the
/// request's payload.
///
/// # Errors
///
/// `AgentError::MissingPayload` if neither `code` nor `code_archive` is set.
/// `AgentError::PathTraversal` if any archive entry's path contains `..` or
/// is absolute. `AgentError::Archive` if the archive is not valid gzip+tar.
pub async fn materialize(work_dir: &Path, request: &GuestRequest) -> Result<()> {
    tokio::fs::create_dir_all(work_dir).await?;

    match (&request.code, &request.code_archive) {
        (Some(code), _) => {
            let path = work_dir.join(entrypoint_filename(&request.runtime));
            tokio::fs::write(path, code.as_bytes()).await?;
            Ok(())
        }
        (None, Some(archive)) => extract_archive(work_dir, archive),
        (None, None) => Err(AgentError::MissingPayload),
    }
}

fn extract_archive(work_dir: &Path, archive: &[u8]) -> Result<()> {
    let decoder = GzDecoder::new(archive);
    let mut tar = tar::Archive::new(decoder);

    let entries = tar
        .entries()
        .map_err(|e| AgentError::Archive(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| AgentError::Archive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| AgentError::Archive(e.to_string()))?
            .into_owned();

        reject_path_traversal(&path)?;

        let dest = work_dir.join(&path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| AgentError::Archive(e.to_string()))?;
    }
    Ok(())
}

fn reject_path_traversal(path: &Path) -> Result<()> {
    if path.is_absolute() || path.components().any(|c| c == std::path::Component::ParentDir) {
        return Err(AgentError::PathTraversal(path.display().to_string()));
    }
    Ok(())
}

/// Magic-byte check for a gzip-compressed archive (`1f 8b`), used by callers
/// that want to validate before calling `materialize`.
#[must_use]
pub fn looks_like_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

#[must_use]
pub fn per_workload_dir(base: &Path, workload_id: &str) -> PathBuf {
    base.join(workload_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_components() {
        let err = reject_path_traversal(Path::new("../etc/passwd")).unwrap_err();
        assert!(matches!(err, AgentError::PathTraversal(_)));
    }

    #[test]
    fn rejects_absolute_paths() {
        let err = reject_path_traversal(Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(err, AgentError::PathTraversal(_)));
    }

    #[test]
    fn accepts_relative_nested_paths() {
        reject_path_traversal(Path::new("src/lib/helper.py")).unwrap();
    }

    #[test]
    fn gzip_magic_bytes_detected() {
        assert!(looks_like_gzip(&[0x1f, 0x8b, 0x08, 0x00]));
        assert!(!looks_like_gzip(b"plain text"));
        assert!(!looks_like_gzip(&[0x1f]));
    }
}
