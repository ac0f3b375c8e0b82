//! Management network descriptor.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use topolab_common::{TopoError, TopoResult};

/// Network name used when the topology names none.
pub const DEFAULT_NETWORK: &str = "clab";

/// The management network shared by every node of a topology.
///
/// Fields hold the literal values from the topology so parse errors can
/// name them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MgmtNet {
    /// Network name.
    pub network: String,
    /// Host bridge interface.
    pub bridge: String,
    /// IPv4 subnet in CIDR form, empty when disabled.
    pub ipv4_subnet: String,
    /// IPv4 gateway, empty for the IPAM default.
    pub ipv4_gw: String,
    /// IPv6 subnet in CIDR form, empty when disabled.
    pub ipv6_subnet: String,
    /// IPv6 gateway, empty for the IPAM default.
    pub ipv6_gw: String,
    /// Interface MTU, empty for the kernel default.
    pub mtu: String,
}

impl MgmtNet {
    /// Create a descriptor for `network` with the given subnets.
    pub fn new(
        network: impl Into<String>,
        ipv4_subnet: impl Into<String>,
        ipv6_subnet: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            ipv4_subnet: ipv4_subnet.into(),
            ipv6_subnet: ipv6_subnet.into(),
            ..Self::default()
        }
    }

    /// Set the MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: impl Into<String>) -> Self {
        self.mtu = mtu.into();
        self
    }

    /// Set the bridge name.
    #[must_use]
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    /// Fill in the bridge name as `br-<network>` when none was given.
    #[must_use]
    pub fn with_default_bridge(mut self) -> Self {
        if self.bridge.is_empty() {
            let network = if self.network.is_empty() {
                DEFAULT_NETWORK
            } else {
                &self.network
            };
            self.bridge = format!("br-{network}");
        }
        self
    }

    /// Parsed IPv4 subnet, `None` when not configured.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidSubnet`] if the subnet is malformed or
    /// not IPv4.
    pub fn ipv4(&self) -> TopoResult<Option<IpNetwork>> {
        parse_subnet(&self.ipv4_subnet, true)
    }

    /// Parsed IPv6 subnet, `None` when not configured.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidSubnet`] if the subnet is malformed or
    /// not IPv6.
    pub fn ipv6(&self) -> TopoResult<Option<IpNetwork>> {
        parse_subnet(&self.ipv6_subnet, false)
    }

    /// Explicit IPv4 gateway. Empty and `0.0.0.0` mean none.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidAddress`] if the gateway is malformed.
    pub fn ipv4_gateway(&self) -> TopoResult<Option<IpAddr>> {
        parse_gateway(&self.ipv4_gw)
    }

    /// Explicit IPv6 gateway. Empty and `::` mean none.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidAddress`] if the gateway is malformed.
    pub fn ipv6_gateway(&self) -> TopoResult<Option<IpAddr>> {
        parse_gateway(&self.ipv6_gw)
    }

    /// Parsed MTU, `None` when not configured.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidMtu`] if the MTU is not a positive integer.
    pub fn mtu(&self) -> TopoResult<Option<u32>> {
        let raw = self.mtu.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        match raw.parse::<u32>() {
            Ok(mtu) if mtu > 0 => Ok(Some(mtu)),
            _ => Err(TopoError::InvalidMtu {
                value: self.mtu.clone(),
            }),
        }
    }
}

fn parse_subnet(raw: &str, v4: bool) -> TopoResult<Option<IpNetwork>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let invalid = || TopoError::InvalidSubnet {
        value: raw.to_string(),
    };
    let net: IpNetwork = trimmed.parse().map_err(|_| invalid())?;
    if net.is_ipv4() != v4 {
        return Err(invalid());
    }
    Ok(Some(net))
}

fn parse_gateway(raw: &str) -> TopoResult<Option<IpAddr>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let addr: IpAddr = trimmed.parse().map_err(|_| TopoError::InvalidAddress {
        value: raw.to_string(),
    })?;
    if addr.is_unspecified() {
        return Ok(None);
    }
    Ok(Some(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bridge_from_network() {
        let net = MgmtNet::new("lab-mgmt", "172.20.20.0/24", "").with_default_bridge();
        assert_eq!(net.bridge, "br-lab-mgmt");

        let unnamed = MgmtNet::default().with_default_bridge();
        assert_eq!(unnamed.bridge, "br-clab");

        let explicit = MgmtNet::new("lab", "", "")
            .with_bridge("mybr0")
            .with_default_bridge();
        assert_eq!(explicit.bridge, "mybr0");
    }

    #[test]
    fn subnets_by_family() {
        let net = MgmtNet::new("clab", "172.20.20.0/24", "3fff:172:20:20::/64");
        assert_eq!(net.ipv4().unwrap().unwrap().prefix(), 24);
        assert_eq!(net.ipv6().unwrap().unwrap().prefix(), 64);

        let v4_only = MgmtNet::new("clab", "172.20.20.0/24", "");
        assert!(v4_only.ipv6().unwrap().is_none());
    }

    #[test]
    fn bad_subnet_names_value() {
        let net = MgmtNet::new("clab", "172.20.20.0/33", "");
        let err = net.ipv4().unwrap_err();
        assert!(err.to_string().contains("172.20.20.0/33"));

        let swapped = MgmtNet::new("clab", "3fff::/64", "");
        assert!(swapped.ipv4().is_err());
    }

    #[test]
    fn mtu_parsing() {
        assert_eq!(MgmtNet::default().mtu().unwrap(), None);
        assert_eq!(
            MgmtNet::default().with_mtu("1500").mtu().unwrap(),
            Some(1500)
        );
        let err = MgmtNet::default().with_mtu("jumbo").mtu().unwrap_err();
        assert!(err.to_string().contains("jumbo"));
    }

    #[test]
    fn unspecified_gateways_are_ignored() {
        let mut net = MgmtNet::new("clab", "172.20.20.0/24", "3fff::/64");
        net.ipv4_gw = "0.0.0.0".into();
        net.ipv6_gw = "::".into();
        assert_eq!(net.ipv4_gateway().unwrap(), None);
        assert_eq!(net.ipv6_gateway().unwrap(), None);

        net.ipv4_gw = "172.20.20.1".into();
        assert_eq!(
            net.ipv4_gateway().unwrap(),
            Some("172.20.20.1".parse().unwrap())
        );
    }
}
