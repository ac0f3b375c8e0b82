//! Resource quantity parsing and representation.
//!
//! Node definitions carry human-readable limits:
//! - CPU: "1.5" (cores), "500m" (millicores)
//! - Memory: "512MB", "1GiB", "2g", "1.5 GB", "1048576" (bytes)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TopoError, TopoResult};

/// CFS scheduler period used for CPU quotas, in microseconds.
pub const CFS_PERIOD_US: u64 = 100_000;

/// A resource quantity with a value and unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    /// The raw value in the smallest unit (millicores for CPU, bytes for memory).
    value: u64,
    /// The type of resource.
    kind: ResourceKind,
}

/// The type of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// CPU in millicores.
    Cpu,
    /// Memory in bytes.
    Memory,
}

impl ResourceQuantity {
    /// Create a CPU quantity from millicores.
    #[must_use]
    pub const fn cpu_millicores(millicores: u64) -> Self {
        Self {
            value: millicores,
            kind: ResourceKind::Cpu,
        }
    }

    /// Create a memory quantity from bytes.
    #[must_use]
    pub const fn memory_bytes(bytes: u64) -> Self {
        Self {
            value: bytes,
            kind: ResourceKind::Memory,
        }
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Get the resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Convert memory to bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.value
    }

    /// CFS quota and period for a CPU quantity.
    ///
    /// One core maps to a full period, so `1.5` cores is a quota of
    /// 150000 over a period of 100000. `None` when the quota does not
    /// fit the kernel's signed quota field.
    #[must_use]
    pub fn cfs_quota(&self) -> Option<(i64, u64)> {
        let quota = self.value.checked_mul(CFS_PERIOD_US)? / 1000;
        Some((i64::try_from(quota).ok()?, CFS_PERIOD_US))
    }

    /// Parse a CPU quantity string.
    ///
    /// Formats:
    /// - "500m" -> 500 millicores
    /// - "2" -> 2000 millicores
    /// - "0.5" -> 500 millicores
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidResourceQuantity`] naming the input.
    pub fn parse_cpu(s: &str) -> TopoResult<Self> {
        let s = s.trim();
        let invalid = || TopoError::InvalidResourceQuantity {
            value: s.to_string(),
        };

        if let Some(stripped) = s.strip_suffix('m') {
            let millicores: u64 = stripped.parse().map_err(|_| invalid())?;
            return Ok(Self::cpu_millicores(millicores));
        }

        let cores: f64 = s.parse().map_err(|_| invalid())?;
        if !cores.is_finite() || cores < 0.0 {
            return Err(invalid());
        }

        Ok(Self::cpu_millicores((cores * 1000.0).round() as u64))
    }

    /// Parse a human-readable memory size.
    ///
    /// Units are case-insensitive and may be separated from the number by
    /// whitespace. Decimal units are powers of 1000 (`k`, `kb`, `m`, `mb`,
    /// `g`, `gb`, `t`, `tb`), binary units powers of 1024 (`ki`, `kib`,
    /// `mi`, `mib`, ...). A bare number is bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TopoError::InvalidResourceQuantity`] naming the input.
    pub fn parse_memory(s: &str) -> TopoResult<Self> {
        let raw = s.trim();
        let invalid = || TopoError::InvalidResourceQuantity {
            value: raw.to_string(),
        };

        let split = raw
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(raw.len());
        let (number, unit) = raw.split_at(split);
        if number.is_empty() {
            return Err(invalid());
        }

        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" => 1000,
            "ki" | "kib" => 1 << 10,
            "m" | "mb" => 1000 * 1000,
            "mi" | "mib" => 1 << 20,
            "g" | "gb" => 1000 * 1000 * 1000,
            "gi" | "gib" => 1 << 30,
            "t" | "tb" => 1000 * 1000 * 1000 * 1000,
            "ti" | "tib" => 1 << 40,
            _ => return Err(invalid()),
        };

        if let Ok(whole) = number.parse::<u64>() {
            let bytes = whole.checked_mul(multiplier).ok_or_else(invalid)?;
            return Ok(Self::memory_bytes(bytes));
        }

        let value: f64 = number.parse().map_err(|_| invalid())?;
        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes > u64::MAX as f64 {
            return Err(invalid());
        }
        Ok(Self::memory_bytes(bytes as u64))
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Cpu => {
                if self.value % 1000 == 0 {
                    write!(f, "{}", self.value / 1000)
                } else {
                    write!(f, "{}m", self.value)
                }
            }
            ResourceKind::Memory => {
                const GI: u64 = 1024 * 1024 * 1024;
                const MI: u64 = 1024 * 1024;
                const KI: u64 = 1024;

                if self.value >= GI && self.value % GI == 0 {
                    write!(f, "{}GiB", self.value / GI)
                } else if self.value >= MI && self.value % MI == 0 {
                    write!(f, "{}MiB", self.value / MI)
                } else if self.value >= KI && self.value % KI == 0 {
                    write!(f, "{}KiB", self.value / KI)
                } else {
                    write!(f, "{}", self.value)
                }
            }
        }
    }
}

impl FromStr for ResourceQuantity {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_memory(s)
    }
}
