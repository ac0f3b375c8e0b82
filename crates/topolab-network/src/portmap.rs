//! Port publishing for containers.
//!
//! Node port bindings become the `portMappings` capability argument of the
//! `portmap` plugin, or `--publish` flags for engines that publish ports
//! themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use topolab_common::{TopoError, TopoResult};

/// Protocol for port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    #[default]
    Tcp,
    /// UDP protocol.
    Udp,
    /// SCTP protocol.
    Sctp,
}

impl Protocol {
    /// Lowercase protocol name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "sctp" => Ok(Self::Sctp),
            _ => Err(TopoError::Config {
                message: format!("unsupported port protocol {s:?}"),
            }),
        }
    }
}

/// A container port with its protocol, written `80/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerPort {
    /// Port number.
    pub port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl ContainerPort {
    /// A TCP port.
    #[must_use]
    pub const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// A UDP port.
    #[must_use]
    pub const fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl FromStr for ContainerPort {
    type Err = TopoError;

    /// Parse `port[/proto]`; the protocol defaults to TCP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = s.split_once('/').unwrap_or((s, "tcp"));
        let port = port.trim().parse().map_err(|_| TopoError::Config {
            message: format!("invalid container port {s:?}"),
        })?;
        Ok(Self {
            port,
            protocol: proto.parse()?,
        })
    }
}

impl TryFrom<String> for ContainerPort {
    type Error = TopoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContainerPort> for String {
    fn from(value: ContainerPort) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Host side of a published port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBinding {
    /// Host IP to bind to, empty for all addresses.
    #[serde(default)]
    pub host_ip: String,
    /// Host port as written in the topology.
    pub host_port: String,
}

impl HostBinding {
    /// Bind `port` on all host addresses.
    pub fn port(port: impl Into<String>) -> Self {
        Self {
            host_ip: String::new(),
            host_port: port.into(),
        }
    }
}

/// One `portMappings` capability entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Host port.
    pub host_port: u16,
    /// Host IP to bind to.
    #[serde(rename = "hostIP", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Container port.
    pub container_port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl PortMapping {
    /// Create a TCP port mapping.
    #[must_use]
    pub const fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            host_ip: None,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Set the host IP to bind to.
    #[must_use]
    pub fn with_host_ip(mut self, ip: &str) -> Self {
        self.host_ip = Some(ip.to_string());
        self
    }

    /// Build a mapping from a container port and one of its host bindings.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::Config`] naming the host port if it is not a
    /// valid port number.
    pub fn from_binding(container: ContainerPort, binding: &HostBinding) -> TopoResult<Self> {
        let host_port = binding
            .host_port
            .trim()
            .parse()
            .map_err(|_| TopoError::Config {
                message: format!(
                    "invalid host port {:?} for {container}",
                    binding.host_port
                ),
            })?;
        Ok(Self {
            host_port,
            host_ip: (!binding.host_ip.is_empty()).then(|| binding.host_ip.clone()),
            container_port: container.port,
            protocol: container.protocol,
        })
    }

    /// `[ip:]host:container/proto` publish form.
    #[must_use]
    pub fn publish_arg(&self) -> String {
        match &self.host_ip {
            Some(ip) => format!(
                "{ip}:{}:{}/{}",
                self.host_port, self.container_port, self.protocol
            ),
            None => format!(
                "{}:{}/{}",
                self.host_port, self.container_port, self.protocol
            ),
        }
    }
}
