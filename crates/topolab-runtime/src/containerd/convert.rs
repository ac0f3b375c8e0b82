//! Conversions between node specs, containerd records and the generic model.
//!
//! containerd has no notion of container networking, so management
//! addresses are kept as container labels. This module is the only place
//! that knows that convention.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use topolab_common::{RuntimePaths, TopoError, TopoResult};
use topolab_oci::Spec;
use topolab_oci::runtime::{CpuResources, MemoryResources, Mount, Namespace, NamespaceType, Resources};

use crate::containerd::client::ContainerInfo;
use crate::model::{FilterOperator, FilterType, GenericContainer, GenericFilter, GenericMgmtIPs, TaskSnapshot};
use crate::mounts::convert_mounts;
use crate::node::{NetworkMode, NodeSpec};

/// Label holding the management IPv4 address.
pub const LABEL_IPV4_ADDR: &str = "clab.ipv4.addr";
/// Label holding the management IPv4 prefix length.
pub const LABEL_IPV4_NETMASK: &str = "clab.ipv4.netmask";
/// Label holding the management IPv6 address.
pub const LABEL_IPV6_ADDR: &str = "clab.ipv6.addr";
/// Label holding the management IPv6 prefix length.
pub const LABEL_IPV6_NETMASK: &str = "clab.ipv6.netmask";

const BIND_OPTIONS: [&str; 2] = ["rbind", "rprivate"];

/// Build the runtime spec for `node`.
///
/// # Errors
///
/// Returns configuration errors for a malformed command, bind or
/// resource limit.
pub fn build_spec(node: &NodeSpec, paths: &RuntimePaths) -> TopoResult<Spec> {
    let mut spec = Spec::default();

    let mut args = node.entrypoint_args()?;
    args.extend(node.command_args()?);
    let process = spec.process_mut();
    process.args = args;
    process.env = node.env_list();
    if !node.user.is_empty() {
        process.user.username = Some(node.user.clone());
    }

    spec.hostname = Some(node.short_name.clone());
    spec.mounts = convert_mounts(&node.binds, &BIND_OPTIONS)?;

    let linux = spec.linux_mut();
    linux.namespaces = NamespaceType::DEFAULTS
        .iter()
        .copied()
        .map(Namespace::new)
        .collect();
    linux.sysctl.clone_from(&node.sysctls);
    linux.resources = resources(node)?;

    match &node.network_mode {
        NetworkMode::Host => {
            linux.remove_namespace(NamespaceType::Network);
            for file in ["/etc/hosts", "/etc/resolv.conf"] {
                let mut mount = Mount::bind(file, file);
                mount.options = vec!["rbind".to_string(), "ro".to_string()];
                spec.mounts.push(mount);
            }
        }
        NetworkMode::Container(peer) => {
            let peer = node.peer_container_name(peer);
            linux.set_namespace(Namespace::join(
                NamespaceType::Network,
                paths.netns_link(&peer),
            ));
        }
        NetworkMode::Bridge | NetworkMode::None => {}
    }

    if !node.extra_hosts.is_empty() {
        tracing::warn!(
            container = %node.long_name,
            hosts = ?node.extra_hosts,
            "extra hosts are not supported by the containerd driver"
        );
    }

    Ok(spec)
}

fn resources(node: &NodeSpec) -> TopoResult<Option<Resources>> {
    let memory = match node.memory_limit()? {
        Some(bytes) => Some(MemoryResources {
            limit: Some(i64::try_from(bytes).map_err(|_| TopoError::InvalidResourceQuantity {
                value: node.memory.clone(),
            })?),
        }),
        None => None,
    };

    let mut cpu = CpuResources::default();
    if let Some((quota, period)) = node.cpu_quota()? {
        cpu.quota = Some(quota);
        cpu.period = Some(period);
    }
    if !node.cpu_set.is_empty() {
        cpu.cpus = Some(node.cpu_set.clone());
    }
    let cpu = (cpu != CpuResources::default()).then_some(cpu);

    if memory.is_none() && cpu.is_none() {
        return Ok(None);
    }
    Ok(Some(Resources { cpu, memory }))
}

/// Translate generic filters into a containerd filter expression.
///
/// Entries are joined with `,`, which containerd reads as AND.
/// Unsupported combinations are skipped.
#[must_use]
pub fn filter_expr(filters: &[GenericFilter]) -> String {
    let mut exprs = Vec::with_capacity(filters.len());
    for filter in filters {
        let expr = match (filter.filter_type, &filter.operator) {
            (FilterType::Label, FilterOperator::Exists) => format!("labels.{}", quote(&filter.field)),
            (FilterType::Label, FilterOperator::Equals) => format!(
                "labels.{}=={}",
                quote(&filter.field),
                quote(&filter.match_value)
            ),
            (FilterType::Name, FilterOperator::Equals) => format!("id~={}", quote(&filter.match_value)),
            (filter_type, operator) => {
                tracing::warn!(%filter_type, %operator, field = %filter.field, "unsupported containerd filter, skipping");
                continue;
            }
        };
        exprs.push(expr);
    }
    exprs.join(",")
}

/// Filter expression matching exactly the container named `name`.
#[must_use]
pub fn exact_name_expr(name: &str) -> String {
    let mut pattern = String::with_capacity(name.len() + 2);
    pattern.push('^');
    for c in name.chars() {
        if matches!(c, '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('$');
    filter_expr(&[GenericFilter::name(pattern)])
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Labels recording management addresses.
///
/// Empty for an unset record.
#[must_use]
pub fn mgmt_labels(ips: &GenericMgmtIPs) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if !ips.is_set() {
        return labels;
    }
    if !ips.ipv4_addr().is_empty() {
        labels.insert(LABEL_IPV4_ADDR.to_string(), ips.ipv4_addr().to_string());
        labels.insert(LABEL_IPV4_NETMASK.to_string(), ips.ipv4_prefix_len().to_string());
    }
    if !ips.ipv6_addr().is_empty() {
        labels.insert(LABEL_IPV6_ADDR.to_string(), ips.ipv6_addr().to_string());
        labels.insert(LABEL_IPV6_NETMASK.to_string(), ips.ipv6_prefix_len().to_string());
    }
    labels
}

/// Management addresses recorded in `labels`.
///
/// The record is set when either netmask label is present.
///
/// # Errors
///
/// Returns [`TopoError::InvalidAddress`] for an address or prefix length
/// that does not parse.
pub fn ips_from_labels(labels: &BTreeMap<String, String>) -> TopoResult<GenericMgmtIPs> {
    let v4 = labels.get(LABEL_IPV4_NETMASK);
    let v6 = labels.get(LABEL_IPV6_NETMASK);
    if v4.is_none() && v6.is_none() {
        return Ok(GenericMgmtIPs::unset());
    }

    let mut ips = GenericMgmtIPs::assigned();
    if let Some(mask) = v4 {
        let addr = labels.get(LABEL_IPV4_ADDR).map_or("", String::as_str);
        ips = ips.with_ipv4(addr, prefix_len(addr, mask)?);
    }
    if let Some(mask) = v6 {
        let addr = labels.get(LABEL_IPV6_ADDR).map_or("", String::as_str);
        ips = ips.with_ipv6(addr, prefix_len(addr, mask)?);
    }
    Ok(ips)
}

fn prefix_len(addr: &str, mask: &str) -> TopoResult<u8> {
    let invalid = || TopoError::InvalidAddress {
        value: format!("{addr}/{mask}"),
    };
    let prefix: u8 = mask.trim().parse().map_err(|_| invalid())?;
    if !addr.is_empty() {
        let ip: IpAddr = addr.parse().map_err(|_| invalid())?;
        IpNetwork::new(ip, prefix).map_err(|_| invalid())?;
    }
    Ok(prefix)
}

/// Generic view of a containerd container and its task.
#[must_use]
pub fn to_generic(info: &ContainerInfo, task: Option<TaskSnapshot>) -> GenericContainer {
    let ips = ips_from_labels(&info.labels).unwrap_or_else(|e| {
        tracing::warn!(container = %info.id, error = %e, "ignoring malformed address labels");
        GenericMgmtIPs::unset()
    });
    GenericContainer::new(&info.id, &info.image, info.labels.clone(), task).with_mgmt_ips(ips)
}
