//! Driver selection by engine name.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use topolab_common::TopoError;

use crate::config::RuntimeConfig;
use crate::containerd::ContainerdRuntime;
use crate::podman::PodmanRuntime;
use crate::runtime::ContainerRuntime;

/// Supported container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// containerd through `ctr`.
    Containerd,
    /// podman.
    Podman,
}

impl RuntimeKind {
    /// Every supported engine.
    pub const ALL: [Self; 2] = [Self::Containerd, Self::Podman];

    /// Engine name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Containerd => "containerd",
            Self::Podman => "podman",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "containerd" => Ok(Self::Containerd),
            "podman" => Ok(Self::Podman),
            _ => Err(TopoError::Unsupported {
                feature: format!("container runtime {s:?}"),
            }),
        }
    }
}

/// Construct the driver for `kind`.
#[must_use]
pub fn new_runtime(kind: RuntimeKind, config: RuntimeConfig) -> Arc<dyn ContainerRuntime> {
    tracing::debug!(runtime = %kind, "initializing container runtime");
    match kind {
        RuntimeKind::Containerd => Arc::new(ContainerdRuntime::new(config)),
        RuntimeKind::Podman => Arc::new(PodmanRuntime::new(config)),
    }
}
