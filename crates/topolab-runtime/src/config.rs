//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use topolab_common::{RuntimePaths, TopoError, TopoResult};

/// Default containerd socket.
pub const DEFAULT_CONTAINERD_ADDRESS: &str = "/run/containerd/containerd.sock";

/// containerd namespace holding lab containers.
pub const DEFAULT_CONTAINERD_NAMESPACE: &str = "clab";

/// containerd driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ContainerdConfig {
    /// `ctr` binary.
    pub binary: String,
    /// containerd socket.
    pub address: String,
    /// containerd namespace.
    pub namespace: String,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            binary: "ctr".to_string(),
            address: DEFAULT_CONTAINERD_ADDRESS.to_string(),
            namespace: DEFAULT_CONTAINERD_NAMESPACE.to_string(),
        }
    }
}

/// podman driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PodmanConfig {
    /// `podman` binary.
    pub binary: String,
    /// Remote service URL; local when unset.
    pub url: Option<String>,
}

impl Default for PodmanConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            url: None,
        }
    }
}

/// Runtime configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: RuntimePaths,
    /// containerd settings.
    pub containerd: ContainerdConfig,
    /// podman settings.
    pub podman: PodmanConfig,
    /// Default bound on a stop's exit wait, in seconds. 0 waits forever.
    pub timeout: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: RuntimePaths::new(),
            containerd: ContainerdConfig::default(),
            podman: PodmanConfig::default(),
            timeout: 120,
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::Config`] describing the parse failure.
    pub fn from_toml_str(raw: &str) -> TopoResult<Self> {
        toml::from_str(raw).map_err(|e| TopoError::Config {
            message: format!("invalid runtime configuration: {e}"),
        })
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`TopoError::Config`] if it does not parse.
    pub fn load(path: impl AsRef<Path>) -> TopoResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loading runtime configuration");
        Self::from_toml_str(&raw)
    }

    /// Relocate writable runtime directories under `root`.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        let cni_bin = self.paths.cni_bin.clone();
        self.paths = RuntimePaths::with_root(root.into());
        self.paths.cni_bin = cni_bin;
        self
    }

    /// Set the default exit-wait bound in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the containerd settings.
    #[must_use]
    pub fn with_containerd(mut self, containerd: ContainerdConfig) -> Self {
        self.containerd = containerd;
        self
    }

    /// Set the podman settings.
    #[must_use]
    pub fn with_podman(mut self, podman: PodmanConfig) -> Self {
        self.podman = podman;
        self
    }

    /// Exit-wait bound for a stop, preferring the caller's.
    #[must_use]
    pub fn stop_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.or_else(|| (self.timeout > 0).then(|| Duration::from_secs(self.timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.containerd.namespace, "clab");
        assert_eq!(config.podman.binary, "podman");
        assert_eq!(config.timeout, 120);
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_timeout(0);
        assert_eq!(config.paths.log_dir, PathBuf::from("/custom/root/logs"));
        assert_eq!(config.stop_timeout(None), None);
        assert_eq!(
            config.stop_timeout(Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn toml_sections() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            timeout = 30

            [containerd]
            namespace = "lab"

            [podman]
            url = "unix:///run/podman/podman.sock"

            [paths]
            cni_bin = ["/usr/lib/cni"]
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout, 30);
        assert_eq!(config.containerd.namespace, "lab");
        assert_eq!(config.containerd.binary, "ctr");
        assert_eq!(config.podman.url.as_deref(), Some("unix:///run/podman/podman.sock"));
        assert_eq!(config.paths.cni_bin, [PathBuf::from("/usr/lib/cni")]);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = RuntimeConfig::from_toml_str("timeout = \"soon\"").unwrap_err();
        assert!(matches!(err, TopoError::Config { .. }));
    }
}
