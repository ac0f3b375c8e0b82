//! OCI Runtime Specification types.
//!
//! The subset of the OCI Runtime Specification v1.2.0 that node containers
//! need: process, hostname, bind mounts, namespaces, sysctls and resource
//! limits.
//! <https://github.com/opencontainers/runtime-spec/blob/main/config.md>

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// OCI Runtime Specification (config.json).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// OCI version.
    #[serde(default = "default_oci_version")]
    pub oci_version: String,

    /// Container process configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    /// Container hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Additional mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Annotations (key-value pairs).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Linux-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

fn default_oci_version() -> String {
    "1.2.0".to_string()
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            oci_version: default_oci_version(),
            process: None,
            hostname: None,
            mounts: Vec::new(),
            annotations: BTreeMap::new(),
            linux: None,
        }
    }
}

impl Spec {
    /// Linux section, created on first use.
    pub fn linux_mut(&mut self) -> &mut Linux {
        self.linux.get_or_insert_with(Linux::default)
    }

    /// Process section, created on first use.
    pub fn process_mut(&mut self) -> &mut Process {
        self.process.get_or_insert_with(Process::default)
    }

    /// The network namespace entry, if the container gets one.
    ///
    /// `None` means the container shares the host network namespace.
    #[must_use]
    pub fn network_namespace(&self) -> Option<&Namespace> {
        self.linux
            .as_ref()?
            .namespaces
            .iter()
            .find(|ns| ns.ns_type == NamespaceType::Network)
    }

    /// Returns true if the container shares the host network namespace.
    #[must_use]
    pub fn uses_host_network(&self) -> bool {
        self.network_namespace().is_none()
    }
}

/// Process configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Whether to run with a terminal.
    #[serde(default)]
    pub terminal: bool,

    /// User to run as.
    #[serde(default)]
    pub user: User,

    /// Command arguments. Empty keeps the image default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables (`KEY=value`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Working directory.
    #[serde(default)]
    pub cwd: PathBuf,
}

/// User and group IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
    /// Unresolved user name (`name`, `uid`, or `uid:gid`) left for the
    /// engine to look up in the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount destination path (inside container).
    pub destination: PathBuf,
    /// Mount type (e.g., "bind", "tmpfs", "proc").
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Mount source path (outside container).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    /// A bind mount from `source` to `destination`.
    pub fn bind(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            mount_type: Some("bind".to_string()),
            source: Some(source.into()),
            options: Vec::new(),
        }
    }
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// Namespaces to create/join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    /// Kernel parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, String>,
    /// Resource limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

impl Linux {
    /// Replace the namespace entry of the same type, or append it.
    pub fn set_namespace(&mut self, ns: Namespace) {
        self.namespaces.retain(|n| n.ns_type != ns.ns_type);
        self.namespaces.push(ns);
    }

    /// Drop a namespace so the host one is shared.
    pub fn remove_namespace(&mut self, ns_type: NamespaceType) {
        self.namespaces.retain(|n| n.ns_type != ns_type);
    }
}

/// Namespace configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path to existing namespace (to join instead of create).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Namespace {
    /// A fresh namespace of the given type.
    #[must_use]
    pub const fn new(ns_type: NamespaceType) -> Self {
        Self {
            ns_type,
            path: None,
        }
    }

    /// Join the namespace at `path`.
    pub fn join(ns_type: NamespaceType, path: impl Into<PathBuf>) -> Self {
        Self {
            ns_type,
            path: Some(path.into()),
        }
    }
}

/// Namespace types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// Cgroup namespace.
    Cgroup,
}

impl NamespaceType {
    /// Namespace types every node container gets by default.
    pub const DEFAULTS: [Self; 6] = [
        Self::Pid,
        Self::Network,
        Self::Mount,
        Self::Ipc,
        Self::Uts,
        Self::Cgroup,
    ];
}

/// Resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    /// Memory resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
}

/// CPU resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuResources {
    /// CPU quota (in microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// CPU period (in microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// CPUs to use (e.g., "0-2,4").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
}

/// Memory resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryResources {
    /// Hard memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_serializes_minimal() {
        let json = serde_json::to_value(Spec::default()).unwrap();
        assert_eq!(json, serde_json::json!({ "ociVersion": "1.2.0" }));
    }

    #[test]
    fn host_network_without_netns_entry() {
        let mut spec = Spec::default();
        spec.linux_mut().namespaces = NamespaceType::DEFAULTS
            .iter()
            .copied()
            .map(Namespace::new)
            .collect();
        assert!(!spec.uses_host_network());

        spec.linux_mut().remove_namespace(NamespaceType::Network);
        assert!(spec.uses_host_network());
    }

    #[test]
    fn set_namespace_replaces_same_type() {
        let mut linux = Linux::default();
        linux.set_namespace(Namespace::new(NamespaceType::Network));
        linux.set_namespace(Namespace::join(
            NamespaceType::Network,
            "/proc/42/ns/net",
        ));
        assert_eq!(linux.namespaces.len(), 1);
        assert_eq!(
            linux.namespaces[0].path,
            Some(PathBuf::from("/proc/42/ns/net"))
        );
    }

    #[test]
    fn sysctl_and_resources_serialize() {
        let mut spec = Spec::default();
        let linux = spec.linux_mut();
        linux
            .sysctl
            .insert("net.ipv4.ip_forward".into(), "1".into());
        linux.resources = Some(Resources {
            cpu: Some(CpuResources {
                quota: Some(150_000),
                period: Some(100_000),
                cpus: None,
            }),
            memory: Some(MemoryResources {
                limit: Some(1 << 30),
            }),
        });

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["linux"]["sysctl"]["net.ipv4.ip_forward"], "1");
        assert_eq!(json["linux"]["resources"]["cpu"]["quota"], 150_000);
        assert_eq!(json["linux"]["resources"]["memory"]["limit"], 1 << 30);
    }
}
