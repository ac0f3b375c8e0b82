//! Well-known filesystem paths used by the drivers.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Directory searched for network plugin binaries.
///
/// Overridable through the `CNI_BIN` environment variable.
pub static CNI_BIN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CNI_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/opt/cni/bin"))
});

/// Directory holding cached plugin results.
pub static CNI_CACHE_DIR: Lazy<PathBuf> = Lazy::new(|| PathBuf::from("/opt/cni/cache"));

/// Directory receiving container console logs.
pub static LOG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("TOPOLAB_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/clab"))
});

/// Directory where named network namespace links live.
pub static NETNS_DIR: Lazy<PathBuf> = Lazy::new(|| PathBuf::from("/run/netns"));

/// Paths used by the runtime drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePaths {
    /// Directories searched for network plugin binaries, in order.
    pub cni_bin: Vec<PathBuf>,
    /// Plugin result cache directory.
    pub cni_cache: PathBuf,
    /// Container log directory.
    pub log_dir: PathBuf,
    /// Named network namespace directory.
    pub netns_dir: PathBuf,
}

impl RuntimePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Relocate every writable directory under `root`.
    ///
    /// The plugin search path is left untouched.
    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            cni_bin: vec![CNI_BIN_DIR.clone()],
            cni_cache: root.join("cni-cache"),
            log_dir: root.join("logs"),
            netns_dir: root.join("netns"),
        }
    }

    /// Console log file for a container.
    #[must_use]
    pub fn container_log(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}.log"))
    }

    /// Named namespace link for a container.
    #[must_use]
    pub fn netns_link(&self, name: &str) -> PathBuf {
        self.netns_dir.join(name)
    }

    /// Cached plugin result for one attachment.
    #[must_use]
    pub fn cni_result(&self, network: &str, container_id: &str, ifname: &str) -> PathBuf {
        self.cni_cache
            .join("results")
            .join(format!("{network}-{container_id}-{ifname}"))
    }

    /// Plugin search path in `CNI_PATH` form.
    #[must_use]
    pub fn cni_path_env(&self) -> String {
        self.cni_bin
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self {
            cni_bin: vec![CNI_BIN_DIR.clone()],
            cni_cache: CNI_CACHE_DIR.clone(),
            log_dir: LOG_DIR.clone(),
            netns_dir: NETNS_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        let paths = RuntimePaths::new();
        assert_eq!(paths.cni_cache, PathBuf::from("/opt/cni/cache"));
        assert_eq!(
            paths.netns_link("clab-lab-srl1"),
            PathBuf::from("/run/netns/clab-lab-srl1")
        );
    }

    #[test]
    fn custom_root() {
        let paths = RuntimePaths::with_root("/tmp/topolab-test");
        assert_eq!(
            paths.container_log("clab-lab-srl1"),
            PathBuf::from("/tmp/topolab-test/logs/clab-lab-srl1.log")
        );
        assert_eq!(paths.netns_dir, PathBuf::from("/tmp/topolab-test/netns"));
    }

    #[test]
    fn cni_result_path() {
        let paths = RuntimePaths::with_root("/tmp/t");
        assert_eq!(
            paths.cni_result("clabmgmt", "clab-lab-srl1", "eth0"),
            PathBuf::from("/tmp/t/cni-cache/results/clabmgmt-clab-lab-srl1-eth0")
        );
    }

    #[test]
    fn cni_path_joins_dirs() {
        let paths = RuntimePaths {
            cni_bin: vec!["/opt/cni/bin".into(), "/usr/lib/cni".into()],
            ..RuntimePaths::with_root("/tmp/t")
        };
        assert_eq!(paths.cni_path_env(), "/opt/cni/bin:/usr/lib/cni");
    }
}
