//! Plugin-chain configuration and results.
//!
//! The management chain is `bridge` (with `host-local` IPAM), then `tuning`,
//! then `portmap`, expressed in the CNI network configuration list format.
//! <https://github.com/containernetworking/cni/blob/main/SPEC.md>

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use topolab_common::{TopoError, TopoResult};

use crate::mgmt::MgmtNet;

/// CNI specification version spoken to the plugins.
pub const CNI_VERSION: &str = "0.4.0";

/// Name of the management network configuration.
pub const MGMT_NETWORK_NAME: &str = "clabmgmt";

/// A CNI network configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfList {
    /// CNI version.
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Plugin configurations, in ADD order.
    pub plugins: Vec<Value>,
}

impl NetworkConfList {
    /// Build the management chain for `mgmt`.
    ///
    /// IPAM gets one range set per configured address family.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending subnet, gateway or
    /// MTU, or when neither family is configured.
    pub fn mgmt_chain(mgmt: &MgmtNet) -> TopoResult<Self> {
        let mut ranges = Vec::new();
        if let Some(subnet) = mgmt.ipv4()? {
            ranges.push(json!([ip_range(subnet, mgmt.ipv4_gateway()?)]));
        }
        if let Some(subnet) = mgmt.ipv6()? {
            ranges.push(json!([ip_range(subnet, mgmt.ipv6_gateway()?)]));
        }
        if ranges.is_empty() {
            return Err(TopoError::Config {
                message: format!(
                    "management network {:?} has neither an IPv4 nor an IPv6 subnet",
                    mgmt.network
                ),
            });
        }

        let bridge = json!({
            "type": "bridge",
            "bridge": mgmt.bridge,
            "isDefaultGateway": true,
            "forceAddress": false,
            "ipMasq": true,
            "hairpinMode": true,
            "ipam": {
                "type": "host-local",
                "ranges": ranges,
            },
        });

        let mut tuning = json!({
            "type": "tuning",
            "capabilities": { "mac": true },
        });
        if let Some(mtu) = mgmt.mtu()? {
            tuning["mtu"] = json!(mtu);
        }

        let portmap = json!({
            "type": "portmap",
            "capabilities": { "portMappings": true },
        });

        Ok(Self {
            cni_version: CNI_VERSION.to_string(),
            name: MGMT_NETWORK_NAME.to_string(),
            plugins: vec![bridge, tuning, portmap],
        })
    }
}

fn ip_range(subnet: IpNetwork, gateway: Option<IpAddr>) -> Value {
    let mut range = json!({ "subnet": subnet.to_string() });
    if let Some(gw) = gateway {
        range["gateway"] = json!(gw.to_string());
    }
    range
}

/// The `type` of a plugin configuration.
///
/// # Errors
///
/// Returns [`TopoError::Config`] if the plugin has no type.
pub fn plugin_type(plugin: &Value) -> TopoResult<&str> {
    plugin
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| TopoError::Config {
            message: format!("plugin configuration without a type: {plugin}"),
        })
}

/// Capabilities a plugin configuration declares as enabled.
#[must_use]
pub fn declared_capabilities(plugin: &Value) -> Vec<&str> {
    plugin
        .get("capabilities")
        .and_then(Value::as_object)
        .map(|caps| {
            caps.iter()
                .filter(|(_, enabled)| enabled.as_bool() == Some(true))
                .map(|(name, _)| name.as_str())
                .collect()
        })
        .unwrap_or_default()
}

/// Error object a plugin prints on failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginError {
    /// Error code.
    #[serde(default)]
    pub code: u32,
    /// Error message.
    #[serde(default)]
    pub msg: String,
    /// Extra detail.
    #[serde(default)]
    pub details: String,
}

impl PluginError {
    /// Message and details joined for display.
    #[must_use]
    pub fn message(&self) -> String {
        if self.details.is_empty() {
            self.msg.clone()
        } else {
            format!("{}; {}", self.msg, self.details)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultIp {
    #[serde(default)]
    version: Option<String>,
    address: String,
    #[serde(default)]
    gateway: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultIps {
    #[serde(default)]
    ips: Vec<ResultIp>,
}

/// An address assigned by IPAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedAddress {
    /// Interface address.
    pub address: IpAddr,
    /// Prefix length of the subnet.
    pub prefix_len: u8,
    /// Default gateway, when IPAM reported one.
    pub gateway: Option<IpAddr>,
}

/// Addresses assigned per family by a successful attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachResult {
    /// IPv4 address, if the chain assigned one.
    pub ipv4: Option<AssignedAddress>,
    /// IPv6 address, if the chain assigned one.
    pub ipv6: Option<AssignedAddress>,
}

impl AttachResult {
    /// Extract the first address of each family from a chain result.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::IpExtraction`] if the result cannot be read.
    pub fn from_result(container_id: &str, result: &Value) -> TopoResult<Self> {
        let extraction = |message: String| TopoError::IpExtraction {
            id: container_id.to_string(),
            message,
        };

        let parsed: ResultIps = serde_json::from_value(result.clone())
            .map_err(|e| extraction(format!("malformed plugin result: {e}")))?;

        let mut out = Self::default();
        for ip in parsed.ips {
            let net: IpNetwork = ip
                .address
                .parse()
                .map_err(|_| extraction(format!("invalid address {:?}", ip.address)))?;
            let gateway = match ip.gateway.as_deref() {
                Some(gw) if !gw.is_empty() => Some(
                    gw.parse()
                        .map_err(|_| extraction(format!("invalid gateway {gw:?}")))?,
                ),
                _ => None,
            };
            let assigned = AssignedAddress {
                address: net.ip(),
                prefix_len: net.prefix(),
                gateway,
            };

            // versions 0.4.0 and earlier also say it; the address decides
            if let Some(version) = ip.version.as_deref() {
                let expected = if net.is_ipv4() { "4" } else { "6" };
                if version != expected {
                    tracing::warn!(
                        container = container_id,
                        address = %ip.address,
                        version,
                        "plugin result version does not match address family"
                    );
                }
            }

            let slot = if net.is_ipv4() {
                &mut out.ipv4
            } else {
                &mut out.ipv6
            };
            if slot.is_none() {
                *slot = Some(assigned);
            }
        }
        Ok(out)
    }
}

/// Validate and normalize a MAC address to lowercase colon form.
///
/// # Errors
///
/// Returns [`TopoError::InvalidMac`] naming the input.
pub fn parse_mac(raw: &str) -> TopoResult<String> {
    let invalid = || TopoError::InvalidMac {
        value: raw.to_string(),
    };
    let octets: Vec<&str> = raw.trim().split([':', '-']).collect();
    if octets.len() != 6 {
        return Err(invalid());
    }
    let mut normalized = Vec::with_capacity(6);
    for octet in octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        normalized.push(octet.to_ascii_lowercase());
    }
    Ok(normalized.join(":"))
}
