//! Task state vocabulary.
//!
//! Every engine reports its own spelling of a container process state.
//! [`ContainerStatus`] is the fixed vocabulary the rest of the system sees.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container task status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Task has been created but not started.
    Created,
    /// Task is running.
    Running,
    /// Task is paused.
    Paused,
    /// Task is being paused.
    Pausing,
    /// Task has exited.
    Stopped,
    /// No task, or a state the engine could not report.
    Unknown,
}

impl ContainerStatus {
    /// Returns true if a stop must signal the process.
    ///
    /// Created and stopped tasks have nothing to kill.
    #[must_use]
    pub const fn needs_kill(&self) -> bool {
        !matches!(self, Self::Created | Self::Stopped)
    }

    /// Returns true if the task must be resumed before it can act on a signal.
    #[must_use]
    pub const fn needs_resume(&self) -> bool {
        matches!(self, Self::Paused | Self::Pausing)
    }

    /// Returns true if the container is in a running state.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container has exited.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Pausing => "pausing",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Capitalized name, as shown in status lines.
    #[must_use]
    pub const fn title(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Pausing => "Pausing",
            Self::Stopped => "Stopped",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = std::convert::Infallible;

    /// Map an engine's state spelling. Unrecognized states are `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => Self::Created,
            // still has a live process to signal
            "running" | "stopping" => Self::Running,
            "paused" => Self::Paused,
            "pausing" => Self::Pausing,
            "stopped" | "exited" => Self::Stopped,
            _ => Self::Unknown,
        })
    }
}

/// How and when a task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Process exit code.
    pub code: u32,
    /// Exit time, when the engine reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

impl ExitStatus {
    /// An exit status with an exit time.
    #[must_use]
    pub const fn new(code: u32, exited_at: DateTime<Utc>) -> Self {
        Self {
            code,
            exited_at: Some(exited_at),
        }
    }

    /// An exit code without a known exit time.
    #[must_use]
    pub const fn code_only(code: u32) -> Self {
        Self {
            code,
            exited_at: None,
        }
    }
}
