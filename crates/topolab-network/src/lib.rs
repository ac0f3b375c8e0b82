//! # topolab-network
//!
//! Management network provisioning for topolab containers.
//!
//! This crate builds the plugin chain that attaches a container to the
//! management bridge, runs it through the plugin binaries, and provides
//! the host-side helpers used around it.

#![warn(missing_docs)]

pub mod attach;
pub mod bridge;
pub mod cni;
pub mod exec;
pub mod mgmt;
pub mod netns;
pub mod portmap;

pub use attach::{MGMT_IFNAME, NetworkAttachment};
pub use bridge::{Ethtool, LinkTuning};
pub use cni::{AssignedAddress, AttachResult, NetworkConfList, parse_mac};
pub use exec::{PluginExec, RawExec};
pub use mgmt::MgmtNet;
pub use netns::{link_container_ns, ns_path_for_pid, unlink_container_ns};
pub use portmap::{ContainerPort, HostBinding, PortMapping, Protocol};
