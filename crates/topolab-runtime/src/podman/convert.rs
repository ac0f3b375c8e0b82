//! Conversions between node specs, podman records and the generic model.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};

use topolab_common::{TopoError, TopoResult};
use topolab_network::MgmtNet;
use topolab_oci::{ContainerStatus, ExitStatus};

use crate::model::{FilterOperator, FilterType, GenericContainer, GenericFilter, GenericMgmtIPs, TaskSnapshot};
use crate::mounts::convert_mounts;
use crate::node::{NetworkMode, NodeSpec};
use crate::podman::client::InspectInfo;

/// Label naming the management network a container is attached to.
pub const LABEL_MGMT_NET: &str = "clab-net-mgmt";

/// Label marking networks created for labs.
pub const NETWORK_LABEL: &str = "containerlab";

/// One subnet of a network to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSpec {
    /// Subnet in CIDR form.
    pub subnet: String,
    /// Gateway, `None` for the IPAM default.
    pub gateway: Option<String>,
}

/// A podman network to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name.
    pub name: String,
    /// Network driver.
    pub driver: String,
    /// Labels.
    pub labels: Vec<String>,
    /// Subnets with their gateways.
    pub subnets: Vec<SubnetSpec>,
    /// Whether IPv6 is enabled.
    pub ipv6: bool,
    /// Driver options.
    pub options: BTreeMap<String, String>,
    /// Host bridge interface name.
    pub interface: String,
}

impl NetworkSpec {
    /// Network for the management descriptor.
    ///
    /// # Errors
    ///
    /// Returns configuration errors naming a malformed subnet, gateway
    /// or MTU.
    pub fn from_mgmt(mgmt: &MgmtNet) -> TopoResult<Self> {
        let mut subnets = Vec::new();
        if let Some(v4) = mgmt.ipv4()? {
            subnets.push(SubnetSpec {
                subnet: v4.to_string(),
                gateway: mgmt.ipv4_gateway()?.map(|gw| gw.to_string()),
            });
        }
        let v6 = mgmt.ipv6()?;
        if let Some(v6) = v6 {
            subnets.push(SubnetSpec {
                subnet: v6.to_string(),
                gateway: mgmt.ipv6_gateway()?.map(|gw| gw.to_string()),
            });
        }

        let mut options = BTreeMap::new();
        if let Some(mtu) = mgmt.mtu()? {
            options.insert("mtu".to_string(), mtu.to_string());
        }

        Ok(Self {
            name: mgmt.network.clone(),
            driver: "bridge".to_string(),
            labels: vec![NETWORK_LABEL.to_string()],
            subnets,
            ipv6: v6.is_some(),
            options,
            interface: mgmt.bridge.clone(),
        })
    }

    /// `podman network create` arguments.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            self.driver.clone(),
        ];
        for label in &self.labels {
            args.extend(["--label".to_string(), label.clone()]);
        }
        for subnet in &self.subnets {
            args.extend(["--subnet".to_string(), subnet.subnet.clone()]);
            if let Some(gw) = &subnet.gateway {
                args.extend(["--gateway".to_string(), gw.clone()]);
            }
        }
        if self.ipv6 {
            args.push("--ipv6".to_string());
        }
        for (k, v) in &self.options {
            args.extend(["--opt".to_string(), format!("{k}={v}")]);
        }
        if !self.interface.is_empty() {
            args.extend(["--interface-name".to_string(), self.interface.clone()]);
        }
        args.push(self.name.clone());
        args
    }
}

/// A podman container to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name.
    pub name: String,
    /// Canonical image reference.
    pub image: String,
    /// Hostname.
    pub hostname: String,
    /// Environment as `KEY=value`.
    pub env: Vec<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Kernel parameters.
    pub sysctls: BTreeMap<String, String>,
    /// Volumes as `src:dst[:opts]`.
    pub volumes: Vec<String>,
    /// User to run as.
    pub user: String,
    /// Memory limit in bytes.
    pub memory: Option<u64>,
    /// CFS quota and period.
    pub cpu_quota: Option<(i64, u64)>,
    /// Allowed CPUs.
    pub cpuset: String,
    /// `--network` value.
    pub network: String,
    /// `--publish` values.
    pub publish: Vec<String>,
    /// `--expose` values.
    pub expose: Vec<String>,
    /// `--add-host` values.
    pub add_hosts: Vec<String>,
    /// Entrypoint, empty for the image default.
    pub entrypoint: Vec<String>,
    /// Command, empty for the image default.
    pub command: Vec<String>,
}

impl CreateSpec {
    /// Build the create request for `node` on `mgmt`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for a malformed command, bind, MAC
    /// or resource limit.
    pub fn from_node(node: &NodeSpec, mgmt: &MgmtNet, image: &str) -> TopoResult<Self> {
        let volumes = convert_mounts(&node.binds, &[])?
            .into_iter()
            .map(|m| {
                let mut volume = format!(
                    "{}:{}",
                    m.source.unwrap_or_default().display(),
                    m.destination.display()
                );
                if !m.options.is_empty() {
                    volume.push(':');
                    volume.push_str(&m.options.join(","));
                }
                volume
            })
            .collect();

        let mut labels = node.labels.clone();
        labels.insert(LABEL_MGMT_NET.to_string(), mgmt.network.clone());

        let (publish, expose): (Vec<String>, Vec<String>) = if node.network_mode.provisions_network() {
            (
                node.port_mappings()?.iter().map(|p| p.publish_arg()).collect(),
                node.port_set.iter().map(ToString::to_string).collect(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        // shared namespaces also share /etc/hosts
        let add_hosts = match node.network_mode {
            NetworkMode::Host | NetworkMode::Bridge => node.extra_hosts.clone(),
            _ => {
                if !node.extra_hosts.is_empty() {
                    tracing::debug!(
                        container = %node.long_name,
                        mode = %node.network_mode,
                        "ignoring extra hosts outside host and bridge modes"
                    );
                }
                Vec::new()
            }
        };

        Ok(Self {
            name: node.long_name.clone(),
            image: image.to_string(),
            hostname: node.short_name.clone(),
            env: node.env_list(),
            labels,
            sysctls: node.sysctls.clone(),
            volumes,
            user: node.user.clone(),
            memory: node.memory_limit()?,
            cpu_quota: node.cpu_quota()?,
            cpuset: node.cpu_set.clone(),
            network: network_arg(node, mgmt)?,
            publish,
            expose,
            add_hosts,
            entrypoint: node.entrypoint_args()?,
            command: node.command_args()?,
        })
    }

    /// `podman create` arguments.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the entrypoint cannot be encoded.
    pub fn to_args(&self) -> TopoResult<Vec<String>> {
        // JSON array form keeps arguments with spaces intact
        let entrypoint = if self.entrypoint.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&self.entrypoint)?)
        };

        let mut args = vec!["create".to_string()];
        let mut flag = |name: &str, value: String| {
            args.push(name.to_string());
            args.push(value);
        };

        flag("--name", self.name.clone());
        flag("--hostname", self.hostname.clone());
        for env in &self.env {
            flag("--env", env.clone());
        }
        for (k, v) in &self.labels {
            flag("--label", format!("{k}={v}"));
        }
        for (k, v) in &self.sysctls {
            flag("--sysctl", format!("{k}={v}"));
        }
        for volume in &self.volumes {
            flag("--volume", volume.clone());
        }
        if !self.user.is_empty() {
            flag("--user", self.user.clone());
        }
        if let Some(bytes) = self.memory {
            flag("--memory", format!("{bytes}b"));
        }
        if let Some((quota, period)) = self.cpu_quota {
            flag("--cpu-quota", quota.to_string());
            flag("--cpu-period", period.to_string());
        }
        if !self.cpuset.is_empty() {
            flag("--cpuset-cpus", self.cpuset.clone());
        }
        flag("--network", self.network.clone());
        for publish in &self.publish {
            flag("--publish", publish.clone());
        }
        for expose in &self.expose {
            flag("--expose", expose.clone());
        }
        for host in &self.add_hosts {
            flag("--add-host", host.clone());
        }
        if let Some(entrypoint) = entrypoint {
            flag("--entrypoint", entrypoint);
        }

        args.push("--privileged".to_string());
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        Ok(args)
    }
}

fn network_arg(node: &NodeSpec, mgmt: &MgmtNet) -> TopoResult<String> {
    Ok(match &node.network_mode {
        NetworkMode::Host => "host".to_string(),
        NetworkMode::None => "none".to_string(),
        NetworkMode::Container(peer) => format!("container:{}", node.peer_container_name(peer)),
        NetworkMode::Bridge => {
            let mut opts = Vec::new();
            if !node.mgmt_ipv4_address.is_empty() {
                opts.push(format!("ip={}", node.mgmt_ipv4_address));
            }
            if !node.mgmt_ipv6_address.is_empty() {
                opts.push(format!("ip6={}", node.mgmt_ipv6_address));
            }
            if !node.mac_address.is_empty() {
                opts.push(format!("mac={}", topolab_network::parse_mac(&node.mac_address)?));
            }
            if opts.is_empty() {
                mgmt.network.clone()
            } else {
                format!("{}:{}", mgmt.network, opts.join(","))
            }
        }
    })
}

/// Translate generic filters into `podman ps --filter` values.
///
/// Unsupported combinations are skipped.
#[must_use]
pub fn filter_args(filters: &[GenericFilter]) -> Vec<String> {
    filters
        .iter()
        .filter_map(|filter| match (filter.filter_type, &filter.operator) {
            (FilterType::Name, FilterOperator::Equals) => Some(format!("name={}", filter.match_value)),
            (FilterType::Label, FilterOperator::Equals) => {
                Some(format!("label={}={}", filter.field, filter.match_value))
            }
            (FilterType::Label, FilterOperator::Exists) => Some(format!("label={}", filter.field)),
            (filter_type, operator) => {
                tracing::warn!(%filter_type, %operator, field = %filter.field, "unsupported podman filter, skipping");
                None
            }
        })
        .collect()
}

/// Management addresses from the attachment named by the container's
/// management network label.
#[must_use]
pub fn mgmt_ips(info: &InspectInfo) -> GenericMgmtIPs {
    let net = info
        .config
        .labels
        .as_ref()
        .and_then(|labels| labels.get(LABEL_MGMT_NET));
    let attachment = net.and_then(|net| info.network_settings.networks.as_ref()?.get(net));
    let Some(attachment) = attachment else {
        return GenericMgmtIPs::unset();
    };

    let mut ips = GenericMgmtIPs::assigned();
    if !attachment.ip_address.is_empty() {
        ips = ips.with_ipv4(&attachment.ip_address, attachment.ip_prefix_len);
        if !attachment.gateway.is_empty() {
            ips = ips.with_ipv4_gateway(&attachment.gateway);
        }
    }
    if !attachment.global_ipv6_address.is_empty() {
        ips = ips.with_ipv6(&attachment.global_ipv6_address, attachment.global_ipv6_prefix_len);
        if !attachment.ipv6_gateway.is_empty() {
            ips = ips.with_ipv6_gateway(&attachment.ipv6_gateway);
        }
    }
    ips
}

/// Task state of an inspected container.
#[must_use]
pub fn task_snapshot(info: &InspectInfo) -> TaskSnapshot {
    let status = match info.state.status.parse::<ContainerStatus>() {
        Ok(status) => status,
        Err(never) => match never {},
    };
    let exit = status.is_stopped().then(|| {
        let code = u32::try_from(info.state.exit_code).unwrap_or_default();
        match finished_at(&info.state.finished_at) {
            Some(at) => ExitStatus::new(code, at),
            None => ExitStatus::code_only(code),
        }
    });
    TaskSnapshot {
        status,
        pid: u32::try_from(info.state.pid).unwrap_or_default(),
        exit,
    }
}

fn finished_at(raw: &str) -> Option<DateTime<Utc>> {
    let at = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    // podman reports the zero time for containers that never ran
    (at.year() > 1).then_some(at)
}

/// Generic view of an inspected container.
#[must_use]
pub fn to_generic(info: &InspectInfo) -> GenericContainer {
    let labels = info.config.labels.clone().unwrap_or_default();
    let name = info.name.trim_start_matches('/').to_string();
    GenericContainer::new(&info.id, &info.image_name, labels, Some(task_snapshot(info)))
        .with_names(vec![name])
        .with_mgmt_ips(mgmt_ips(info))
}

/// Error for a container podman does not know.
pub(crate) fn not_found(name: &str) -> TopoError {
    TopoError::ContainerNotFound {
        id: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podman::client::{InspectConfig, InspectNetwork, InspectNetworkSettings, InspectState};
    use std::collections::HashMap;
    use topolab_network::{ContainerPort, HostBinding};

    fn mgmt() -> MgmtNet {
        MgmtNet::new("clab", "172.20.20.0/24", "3fff:172:20:20::/64")
            .with_mtu("1500")
            .with_default_bridge()
    }

    #[test]
    fn network_arguments() {
        let mut net = mgmt();
        net.ipv6_gw = "::".to_string();
        net.ipv4_gw = "172.20.20.1".to_string();
        let args = NetworkSpec::from_mgmt(&net).unwrap().to_args().join(" ");
        assert_eq!(
            args,
            "network create --driver bridge --label containerlab \
             --subnet 172.20.20.0/24 --gateway 172.20.20.1 \
             --subnet 3fff:172:20:20::/64 --ipv6 --opt mtu=1500 \
             --interface-name br-clab clab"
        );
    }

    #[test]
    fn bridge_create_arguments() {
        let node = NodeSpec::new("srl1", "clab-lab-srl1", "srlinux")
            .with_entrypoint("/tini --")
            .with_cmd("sr_linux")
            .with_bind("/lab/cfg:/etc/cfg:ro")
            .with_mgmt_addresses("172.20.20.5", "3fff:172:20:20::5")
            .with_mac_address("AA:C1:AB:00:00:01")
            .with_port_binding(ContainerPort::tcp(80), HostBinding::port("8080"));
        let spec = CreateSpec::from_node(&node, &mgmt(), "ghcr.io/nokia/srlinux:latest").unwrap();
        assert_eq!(
            spec.network,
            "clab:ip=172.20.20.5,ip6=3fff:172:20:20::5,mac=aa:c1:ab:00:00:01"
        );

        let args = spec.to_args().unwrap().join(" ");
        assert!(args.starts_with("create --name clab-lab-srl1 --hostname srl1"));
        assert!(args.contains("--label clab-net-mgmt=clab"));
        assert!(args.contains("--volume /lab/cfg:/etc/cfg:ro"));
        assert!(args.contains("--publish 8080:80/tcp"));
        assert!(args.contains(r#"--entrypoint ["/tini","--"]"#));
        assert!(args.ends_with("--privileged ghcr.io/nokia/srlinux:latest sr_linux"));
    }

    #[test]
    fn shared_namespace_modes() {
        let node = NodeSpec::new("srl2", "clab-lab-srl2", "srlinux")
            .with_network_mode(NetworkMode::Container("srl1".into()))
            .with_port_binding(ContainerPort::tcp(80), HostBinding::port("8080"));
        let spec = CreateSpec::from_node(&node, &mgmt(), "srlinux").unwrap();
        assert_eq!(spec.network, "container:clab-lab-srl1");
        assert!(spec.publish.is_empty());

        let host = NodeSpec::new("h", "clab-lab-h", "alpine").with_network_mode(NetworkMode::Host);
        assert_eq!(CreateSpec::from_node(&host, &mgmt(), "alpine").unwrap().network, "host");
    }

    #[test]
    fn extra_hosts_only_with_own_hosts_file() {
        let mut shared = NodeSpec::new("srl2", "clab-lab-srl2", "srlinux")
            .with_network_mode(NetworkMode::Container("srl1".into()));
        shared.extra_hosts = vec!["foo:1.2.3.4".into()];
        let args = CreateSpec::from_node(&shared, &mgmt(), "srlinux")
            .unwrap()
            .to_args()
            .unwrap();
        assert!(args.windows(2).any(|w| w == ["--network", "container:clab-lab-srl1"]));
        assert!(!args.iter().any(|a| a == "--add-host"), "{args:?}");

        let isolated = shared.clone().with_network_mode(NetworkMode::None);
        let spec = CreateSpec::from_node(&isolated, &mgmt(), "srlinux").unwrap();
        assert!(spec.add_hosts.is_empty());

        for mode in [NetworkMode::Host, NetworkMode::Bridge] {
            let node = shared.clone().with_network_mode(mode);
            let args = CreateSpec::from_node(&node, &mgmt(), "srlinux")
                .unwrap()
                .to_args()
                .unwrap();
            assert!(args.windows(2).any(|w| w == ["--add-host", "foo:1.2.3.4"]), "{args:?}");
        }
    }

    #[test]
    fn filter_dialect() {
        let args = filter_args(&[
            GenericFilter::label("containerlab", "lab"),
            GenericFilter::label_exists("clab-node-name"),
            GenericFilter::name("clab-lab-srl1"),
            GenericFilter::parse("label", "x", "!=", "y").unwrap(),
        ]);
        assert_eq!(
            args,
            ["label=containerlab=lab", "label=clab-node-name", "name=clab-lab-srl1"]
        );
    }

    fn inspected(status: &str) -> InspectInfo {
        InspectInfo {
            id: "3f2a9c1b7d6e5f40".into(),
            name: "clab-lab-srl1".into(),
            image_name: "ghcr.io/nokia/srlinux:latest".into(),
            state: InspectState {
                status: status.into(),
                pid: if status == "running" { 4242 } else { 0 },
                exit_code: 137,
                finished_at: "2024-05-01T10:00:00Z".into(),
            },
            config: InspectConfig {
                labels: Some(BTreeMap::from([(LABEL_MGMT_NET.to_string(), "clab".to_string())])),
            },
            network_settings: InspectNetworkSettings {
                networks: Some(HashMap::from([(
                    "clab".to_string(),
                    InspectNetwork {
                        ip_address: "172.20.20.2".into(),
                        ip_prefix_len: 24,
                        gateway: "172.20.20.1".into(),
                        ..InspectNetwork::default()
                    },
                )])),
            },
        }
    }

    #[test]
    fn generic_view_from_inspect() {
        let running = to_generic(&inspected("running"));
        assert_eq!(running.status(), "Up");
        assert_eq!(running.pid(), Some(4242));
        assert_eq!(running.names(), ["clab-lab-srl1"]);
        assert_eq!(running.short_id(), "3f2a9c1b7d6e");
        let ips = running.mgmt_ips();
        assert!(ips.is_set());
        assert_eq!(ips.ipv4_addr(), "172.20.20.2");
        assert_eq!(ips.ipv4_gateway(), "172.20.20.1");
        assert_eq!(ips.ipv6_addr(), "");

        let exited = to_generic(&inspected("exited"));
        assert_eq!(exited.state(), ContainerStatus::Stopped);
        assert!(exited.status().starts_with("Exited (137) "));
        assert!(exited.status().ends_with(" ago"));
    }

    #[test]
    fn zero_finish_time_is_ignored() {
        assert_eq!(finished_at("0001-01-01T00:00:00Z"), None);
        assert!(finished_at("2024-05-01T10:00:00.5+02:00").is_some());
    }
}
