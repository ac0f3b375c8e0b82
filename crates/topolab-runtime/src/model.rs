//! Generic container model.
//!
//! Every driver reports containers in these types so callers never see
//! engine-specific records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use topolab_common::humanize::time_since;
use topolab_common::id::short_id;
use topolab_common::{TopoError, TopoResult};
use topolab_network::AttachResult;
use topolab_oci::{ContainerStatus, ExitStatus};

/// Management addresses of a container.
///
/// A record is either unset, with every address field empty, or set by
/// one of the `with_*` builders. There is no way to mark a record set
/// without going through them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericMgmtIPs {
    set: bool,
    ipv4_addr: String,
    ipv4_prefix_len: u8,
    ipv4_gw: String,
    ipv6_addr: String,
    ipv6_prefix_len: u8,
    ipv6_gw: String,
}

impl GenericMgmtIPs {
    /// A record with no addresses.
    #[must_use]
    pub fn unset() -> Self {
        Self::default()
    }

    /// Mark the record as assigned without any address yet.
    ///
    /// Used when an engine confirms the attachment but reports a family
    /// as empty.
    #[must_use]
    pub fn assigned() -> Self {
        Self {
            set: true,
            ..Self::default()
        }
    }

    /// Set the IPv4 address and prefix length.
    #[must_use]
    pub fn with_ipv4(mut self, addr: impl Into<String>, prefix_len: u8) -> Self {
        self.set = true;
        self.ipv4_addr = addr.into();
        self.ipv4_prefix_len = prefix_len;
        self
    }

    /// Set the IPv4 gateway.
    #[must_use]
    pub fn with_ipv4_gateway(mut self, gw: impl Into<String>) -> Self {
        self.set = true;
        self.ipv4_gw = gw.into();
        self
    }

    /// Set the IPv6 address and prefix length.
    #[must_use]
    pub fn with_ipv6(mut self, addr: impl Into<String>, prefix_len: u8) -> Self {
        self.set = true;
        self.ipv6_addr = addr.into();
        self.ipv6_prefix_len = prefix_len;
        self
    }

    /// Set the IPv6 gateway.
    #[must_use]
    pub fn with_ipv6_gateway(mut self, gw: impl Into<String>) -> Self {
        self.set = true;
        self.ipv6_gw = gw.into();
        self
    }

    /// Addresses reported by a network attach.
    #[must_use]
    pub fn from_attach(result: &AttachResult) -> Self {
        let mut ips = Self::assigned();
        if let Some(v4) = result.ipv4 {
            ips = ips.with_ipv4(v4.address.to_string(), v4.prefix_len);
            if let Some(gw) = v4.gateway {
                ips = ips.with_ipv4_gateway(gw.to_string());
            }
        }
        if let Some(v6) = result.ipv6 {
            ips = ips.with_ipv6(v6.address.to_string(), v6.prefix_len);
            if let Some(gw) = v6.gateway {
                ips = ips.with_ipv6_gateway(gw.to_string());
            }
        }
        ips
    }

    /// Returns true if addresses were assigned.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.set
    }

    /// IPv4 address, empty when none.
    #[must_use]
    pub fn ipv4_addr(&self) -> &str {
        &self.ipv4_addr
    }

    /// IPv4 prefix length, 0 when none.
    #[must_use]
    pub const fn ipv4_prefix_len(&self) -> u8 {
        self.ipv4_prefix_len
    }

    /// IPv4 gateway, empty when none.
    #[must_use]
    pub fn ipv4_gateway(&self) -> &str {
        &self.ipv4_gw
    }

    /// IPv6 address, empty when none.
    #[must_use]
    pub fn ipv6_addr(&self) -> &str {
        &self.ipv6_addr
    }

    /// IPv6 prefix length, 0 when none.
    #[must_use]
    pub const fn ipv6_prefix_len(&self) -> u8 {
        self.ipv6_prefix_len
    }

    /// IPv6 gateway, empty when none.
    #[must_use]
    pub fn ipv6_gateway(&self) -> &str {
        &self.ipv6_gw
    }
}

/// Task details an engine reported for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSnapshot {
    /// Normalized task state.
    pub status: ContainerStatus,
    /// Process ID.
    pub pid: u32,
    /// Exit details, for exited tasks.
    pub exit: Option<ExitStatus>,
}

/// Normalized view of one container.
///
/// Built once per list or inspect call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericContainer {
    names: Vec<String>,
    id: String,
    short_id: String,
    image: String,
    state: ContainerStatus,
    status: String,
    labels: BTreeMap<String, String>,
    #[serde(serialize_with = "serialize_pid")]
    pid: Option<u32>,
    network_settings: GenericMgmtIPs,
}

fn serialize_pid<S: Serializer>(pid: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
    match pid {
        Some(pid) => serializer.serialize_i64(i64::from(*pid)),
        None => serializer.serialize_i64(-1),
    }
}

impl GenericContainer {
    /// Build the view of container `id`.
    ///
    /// Without a task the container has no process: its state is unknown,
    /// its status `"Unknown"` and its pid absent.
    pub fn new(
        id: impl Into<String>,
        image: impl Into<String>,
        labels: BTreeMap<String, String>,
        task: Option<TaskSnapshot>,
    ) -> Self {
        let id = id.into();
        let (state, status, pid) = match task {
            Some(task) => (
                task.status,
                status_line(task.status, task.exit.as_ref(), Utc::now()),
                Some(task.pid),
            ),
            None => (
                ContainerStatus::Unknown,
                ContainerStatus::Unknown.title().to_string(),
                None,
            ),
        };
        Self {
            names: vec![id.clone()],
            short_id: short_id(&id).to_string(),
            id,
            image: image.into(),
            state,
            status,
            labels,
            pid,
            network_settings: GenericMgmtIPs::unset(),
        }
    }

    /// Replace the reported names.
    #[must_use]
    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = names;
        self
    }

    /// Attach management addresses.
    #[must_use]
    pub fn with_mgmt_ips(mut self, ips: GenericMgmtIPs) -> Self {
        self.network_settings = ips;
        self
    }

    /// Container names.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Engine identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// First twelve characters of the identifier.
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    /// Image reference.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Normalized state.
    #[must_use]
    pub const fn state(&self) -> ContainerStatus {
        self.state
    }

    /// Human status line.
    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Raw engine labels.
    #[must_use]
    pub const fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Process ID, `None` when no process exists.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Management addresses.
    #[must_use]
    pub const fn mgmt_ips(&self) -> &GenericMgmtIPs {
        &self.network_settings
    }
}

/// Human status line for a task state.
#[must_use]
pub fn status_line(
    status: ContainerStatus,
    exit: Option<&ExitStatus>,
    now: DateTime<Utc>,
) -> String {
    match status {
        ContainerStatus::Stopped => match exit {
            Some(ExitStatus {
                code,
                exited_at: Some(at),
            }) => format!("Exited ({code}) {}", time_since(*at, now)),
            Some(ExitStatus {
                code,
                exited_at: None,
            }) => format!("Exited ({code})"),
            None => "Exited".to_string(),
        },
        ContainerStatus::Running => "Up".to_string(),
        other => other.title().to_string(),
    }
}

/// What a filter matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// Container name.
    Name,
    /// Container label.
    Label,
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name => f.write_str("name"),
            Self::Label => f.write_str("label"),
        }
    }
}

impl FromStr for FilterType {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Self::Name),
            "label" => Ok(Self::Label),
            _ => Err(TopoError::Config {
                message: format!("unknown filter type {s:?}"),
            }),
        }
    }
}

/// Filter comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    /// Field equals the match value.
    Equals,
    /// Field is present, whatever its value.
    Exists,
    /// Anything else, kept so drivers can report it.
    Other(String),
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals => f.write_str("="),
            Self::Exists => f.write_str("exists"),
            Self::Other(op) => f.write_str(op),
        }
    }
}

impl FromStr for FilterOperator {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "=" => Self::Equals,
            "exists" => Self::Exists,
            other => Self::Other(other.to_string()),
        })
    }
}

/// One query predicate. A slice of filters is ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenericFilter {
    /// What the filter matches on.
    pub filter_type: FilterType,
    /// Label key; unused for name filters.
    pub field: String,
    /// Comparison.
    pub operator: FilterOperator,
    /// Value to compare with; unused for `exists`.
    pub match_value: String,
}

impl GenericFilter {
    /// Match containers by name.
    pub fn name(value: impl Into<String>) -> Self {
        Self {
            filter_type: FilterType::Name,
            field: String::new(),
            operator: FilterOperator::Equals,
            match_value: value.into(),
        }
    }

    /// Match containers whose label `field` equals `value`.
    pub fn label(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            filter_type: FilterType::Label,
            field: field.into(),
            operator: FilterOperator::Equals,
            match_value: value.into(),
        }
    }

    /// Match containers carrying label `field`.
    pub fn label_exists(field: impl Into<String>) -> Self {
        Self {
            filter_type: FilterType::Label,
            field: field.into(),
            operator: FilterOperator::Exists,
            match_value: String::new(),
        }
    }

    /// Build a filter from its textual parts.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::Config`] for an unknown filter type.
    pub fn parse(filter_type: &str, field: &str, operator: &str, value: &str) -> TopoResult<Self> {
        let operator = match operator.parse::<FilterOperator>() {
            Ok(op) => op,
            Err(never) => match never {},
        };
        Ok(Self {
            filter_type: filter_type.parse()?,
            field: field.to_string(),
            operator,
            match_value: value.to_string(),
        })
    }
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Exit code of the command.
    pub exit_code: i32,
}

impl ExecResult {
    /// Standard output as text.
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as text.
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
