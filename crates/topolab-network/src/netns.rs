//! Network namespace paths and named links.
//!
//! Containers started by an engine have no named namespace. Linking
//! `/proc/<pid>/ns/net` into the netns directory gives tools like
//! `ip netns exec` a stable handle on it.

use std::path::{Path, PathBuf};

use topolab_common::TopoResult;

/// Network namespace path of a process.
#[must_use]
pub fn ns_path_for_pid(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// Link `ns_path` as `link`, replacing any previous link.
///
/// # Errors
///
/// Returns an I/O error if the directory or link cannot be created.
pub async fn link_container_ns(ns_path: &Path, link: &Path) -> TopoResult<()> {
    if let Some(dir) = link.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    remove_link(link).await?;
    tokio::fs::symlink(ns_path, link).await?;
    tracing::debug!(link = %link.display(), target = %ns_path.display(), "linked network namespace");
    Ok(())
}

/// Remove the namespace link. A missing link is not an error.
///
/// # Errors
///
/// Returns an I/O error if the link exists but cannot be removed.
pub async fn unlink_container_ns(link: &Path) -> TopoResult<()> {
    remove_link(link).await?;
    tracing::debug!(link = %link.display(), "unlinked network namespace");
    Ok(())
}

async fn remove_link(link: &Path) -> TopoResult<()> {
    match tokio::fs::remove_file(link).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
