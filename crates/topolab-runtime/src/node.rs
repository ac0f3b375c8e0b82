//! Node description handed to the drivers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use topolab_common::{ResourceQuantity, TopoError, TopoResult};
use topolab_network::{ContainerPort, HostBinding, PortMapping};

use crate::model::GenericMgmtIPs;

/// How a container gets its network namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkMode {
    /// Own namespace attached to the management network.
    #[default]
    Bridge,
    /// Host network namespace.
    Host,
    /// Own namespace with no management attachment.
    None,
    /// Namespace of another node, named by its short name.
    Container(String),
}

impl NetworkMode {
    /// Returns true if the container is attached to the management network.
    #[must_use]
    pub const fn provisions_network(&self) -> bool {
        matches!(self, Self::Bridge)
    }
}

impl FromStr for NetworkMode {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("container", name)) => {
                if name.is_empty() {
                    return Err(TopoError::Config {
                        message: format!(
                            "container network mode {s:?} names no container"
                        ),
                    });
                }
                Ok(Self::Container(name.to_string()))
            }
            Some(_) => Err(TopoError::UnsupportedNetworkMode {
                mode: s.to_string(),
            }),
            None => match s {
                "" | "bridge" => Ok(Self::Bridge),
                "host" => Ok(Self::Host),
                "none" => Ok(Self::None),
                "container" => Err(TopoError::Config {
                    message: "container network mode names no container".to_string(),
                }),
                _ => Err(TopoError::UnsupportedNetworkMode {
                    mode: s.to_string(),
                }),
            },
        }
    }
}

impl TryFrom<String> for NetworkMode {
    type Error = TopoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkMode> for String {
    fn from(value: NetworkMode) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => f.write_str("bridge"),
            Self::Host => f.write_str("host"),
            Self::None => f.write_str("none"),
            Self::Container(name) => write!(f, "container:{name}"),
        }
    }
}

/// Progress of a node's deployment, written back by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Not created yet.
    #[default]
    Pending,
    /// Container created and running.
    Created,
}

/// A container to launch for one topology node.
///
/// Built by the orchestrator; drivers only fill in the write-back fields
/// at the end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeSpec {
    /// Node name within the topology.
    pub short_name: String,
    /// Container name, usually `<prefix><short name>`.
    pub long_name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint, shell-tokenized.
    pub entrypoint: String,
    /// Command, shell-tokenized.
    pub cmd: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Bind mounts as `source:destination[:options]`.
    pub binds: Vec<String>,
    /// User to run as.
    pub user: String,
    /// Memory limit, human-readable.
    pub memory: String,
    /// CPU limit in cores, e.g. `1.5` or `500m`.
    pub cpu: String,
    /// CPUs the container may run on, e.g. `0-2,4`.
    pub cpu_set: String,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// Kernel parameters.
    pub sysctls: BTreeMap<String, String>,
    /// Network mode.
    pub network_mode: NetworkMode,
    /// Static MAC address of the management interface.
    pub mac_address: String,
    /// Static management IPv4 address.
    pub mgmt_ipv4_address: String,
    /// Static management IPv6 address.
    pub mgmt_ipv6_address: String,
    /// Extra `/etc/hosts` entries as `host:ip`.
    pub extra_hosts: Vec<String>,
    /// Published ports.
    pub port_bindings: BTreeMap<ContainerPort, Vec<HostBinding>>,
    /// Exposed ports.
    pub port_set: BTreeSet<ContainerPort>,

    /// Network namespace path, set once the container runs.
    #[serde(skip)]
    pub ns_path: Option<PathBuf>,
    /// Engine container ID.
    #[serde(skip)]
    pub container_id: Option<String>,
    /// Deployment progress.
    #[serde(skip)]
    pub deployment_status: DeploymentStatus,
    /// Management addresses assigned at attach.
    #[serde(skip)]
    pub mgmt_ips: GenericMgmtIPs,
}

impl NodeSpec {
    /// Create a node spec.
    pub fn new(
        short_name: impl Into<String>,
        long_name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            short_name: short_name.into(),
            long_name: long_name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    /// Set the command.
    #[must_use]
    pub fn with_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = cmd.into();
        self
    }

    /// Set the entrypoint.
    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a bind mount.
    #[must_use]
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a sysctl.
    #[must_use]
    pub fn with_sysctl(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sysctls.insert(key.into(), value.into());
        self
    }

    /// Set the network mode.
    #[must_use]
    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    /// Set the memory limit.
    #[must_use]
    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    /// Set the CPU limit.
    #[must_use]
    pub fn with_cpu(mut self, cpu: impl Into<String>) -> Self {
        self.cpu = cpu.into();
        self
    }

    /// Set the static MAC address.
    #[must_use]
    pub fn with_mac_address(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = mac.into();
        self
    }

    /// Set the static management addresses.
    #[must_use]
    pub fn with_mgmt_addresses(mut self, ipv4: impl Into<String>, ipv6: impl Into<String>) -> Self {
        self.mgmt_ipv4_address = ipv4.into();
        self.mgmt_ipv6_address = ipv6.into();
        self
    }

    /// Publish `container` on the host.
    #[must_use]
    pub fn with_port_binding(mut self, container: ContainerPort, binding: HostBinding) -> Self {
        self.port_bindings.entry(container).or_default().push(binding);
        self
    }

    /// Tokenized command.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidCommand`] for unbalanced quoting.
    pub fn command_args(&self) -> TopoResult<Vec<String>> {
        split_command(&self.cmd)
    }

    /// Tokenized entrypoint.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidCommand`] for unbalanced quoting.
    pub fn entrypoint_args(&self) -> TopoResult<Vec<String>> {
        split_command(&self.entrypoint)
    }

    /// Environment as `KEY=value` entries.
    #[must_use]
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Memory limit in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidResourceQuantity`] naming the value.
    pub fn memory_limit(&self) -> TopoResult<Option<u64>> {
        if self.memory.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(ResourceQuantity::parse_memory(&self.memory)?.as_bytes()))
    }

    /// CFS quota and period for the CPU limit.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidResourceQuantity`] naming the value.
    pub fn cpu_quota(&self) -> TopoResult<Option<(i64, u64)>> {
        if self.cpu.trim().is_empty() {
            return Ok(None);
        }
        let cpu = ResourceQuantity::parse_cpu(&self.cpu)?;
        if cpu.value() == 0 {
            return Ok(None);
        }
        cpu.cfs_quota()
            .map(Some)
            .ok_or_else(|| TopoError::InvalidResourceQuantity {
                value: self.cpu.clone(),
            })
    }

    /// Port bindings as port-mapping entries.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming an invalid host port.
    pub fn port_mappings(&self) -> TopoResult<Vec<PortMapping>> {
        let mut mappings = Vec::new();
        for (port, bindings) in &self.port_bindings {
            for binding in bindings {
                mappings.push(PortMapping::from_binding(*port, binding)?);
            }
        }
        Ok(mappings)
    }

    /// Topology prefix of the long name.
    ///
    /// The part of the long name before the short name, so `clab-lab-srl1`
    /// with short name `srl1` has the prefix `clab-lab-`.
    #[must_use]
    pub fn name_prefix(&self) -> &str {
        if self.short_name.is_empty() {
            return "";
        }
        self.long_name
            .split_once(self.short_name.as_str())
            .map_or("", |(prefix, _)| prefix)
    }

    /// Long name of the container whose namespace `container:<name>`
    /// mode joins.
    #[must_use]
    pub fn peer_container_name(&self, peer: &str) -> String {
        format!("{}{peer}", self.name_prefix())
    }
}

fn split_command(raw: &str) -> TopoResult<Vec<String>> {
    shlex::split(raw).ok_or_else(|| TopoError::InvalidCommand {
        value: raw.to_string(),
    })
}
