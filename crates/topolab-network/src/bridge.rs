//! Host-side tuning of the management bridge.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use topolab_common::{Context, TopoError, TopoResult};

/// Adjusts host link settings after a container joins the bridge.
#[async_trait]
pub trait LinkTuning: Send + Sync {
    /// Turn off TX checksum offload on `link`.
    ///
    /// Offloaded checksums are left unfilled on frames crossing the bridge
    /// between namespaces, which some network OS images drop.
    async fn disable_tx_offload(&self, ctx: &Context, link: &str) -> TopoResult<()>;
}

/// Link tuning through the `ethtool` binary.
#[derive(Debug, Clone)]
pub struct Ethtool {
    binary: String,
}

impl Ethtool {
    /// Use `ethtool` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "ethtool".to_string(),
        }
    }

    /// Use a specific `ethtool` binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for Ethtool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkTuning for Ethtool {
    async fn disable_tx_offload(&self, ctx: &Context, link: &str) -> TopoResult<()> {
        tracing::debug!(link, "disabling tx checksum offload");

        let output = ctx
            .run("ethtool", async {
                Command::new(&self.binary)
                    .args(["--offload", link, "tx", "off"])
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| TopoError::engine(link, format!("failed to execute ethtool: {e}")))
            })
            .await?;

        if !output.status.success() {
            return Err(TopoError::engine(
                link,
                format!(
                    "ethtool --offload tx off failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}
