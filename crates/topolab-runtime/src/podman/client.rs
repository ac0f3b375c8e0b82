//! podman engine client.
//!
//! [`PodmanApi`] is the seam between the driver and podman. [`PodmanCli`]
//! implements it with the `podman` command line, locally or against a
//! remote service.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Deserialize;

use topolab_common::{Context, TopoError, TopoResult};
use topolab_oci::ExitStatus;

use crate::config::PodmanConfig;
use crate::engine::EngineCommand;
use crate::model::ExecResult;
use crate::podman::convert::{CreateSpec, NetworkSpec};
use crate::stop::ExitWatch;

/// One `podman ps` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PsEntry {
    /// Container ID.
    pub id: String,
    /// Container names.
    #[serde(default)]
    pub names: Vec<String>,
}

/// `podman container inspect` record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectInfo {
    /// Container ID.
    pub id: String,
    /// Container name.
    #[serde(default)]
    pub name: String,
    /// Image reference.
    #[serde(default)]
    pub image_name: String,
    /// Process state.
    #[serde(default)]
    pub state: InspectState,
    /// Container configuration.
    #[serde(default)]
    pub config: InspectConfig,
    /// Network attachments.
    #[serde(default)]
    pub network_settings: InspectNetworkSettings,
}

/// Process state of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    /// State name, e.g. `running` or `exited`.
    #[serde(default)]
    pub status: String,
    /// Process ID, 0 when none.
    #[serde(default)]
    pub pid: i64,
    /// Exit code of the last run.
    #[serde(default)]
    pub exit_code: i32,
    /// RFC 3339 time the last run ended.
    #[serde(default)]
    pub finished_at: String,
}

/// Configuration of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    /// Labels.
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Network attachments of an inspected container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectNetworkSettings {
    /// Attachments by network name.
    #[serde(default)]
    pub networks: Option<HashMap<String, InspectNetwork>>,
}

/// One network attachment.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "IPPrefixLen", default)]
    pub ip_prefix_len: u8,
    #[serde(default)]
    pub gateway: String,
    #[serde(rename = "GlobalIPv6Address", default)]
    pub global_ipv6_address: String,
    #[serde(rename = "GlobalIPv6PrefixLen", default)]
    pub global_ipv6_prefix_len: u8,
    #[serde(rename = "IPv6Gateway", default)]
    pub ipv6_gateway: String,
}

/// podman operations used by the driver.
#[async_trait]
pub trait PodmanApi: Send + Sync {
    /// Returns true if `image` is present.
    async fn image_exists(&self, ctx: &Context, image: &str) -> TopoResult<bool>;

    /// Pull `image`.
    async fn pull_image(&self, ctx: &Context, image: &str) -> TopoResult<()>;

    /// Returns true if network `name` exists.
    async fn network_exists(&self, ctx: &Context, name: &str) -> TopoResult<bool>;

    /// Create a network.
    async fn create_network(&self, ctx: &Context, spec: &NetworkSpec) -> TopoResult<()>;

    /// Remove network `name`.
    async fn remove_network(&self, ctx: &Context, name: &str) -> TopoResult<()>;

    /// Create a container, returning its ID.
    async fn create_container(&self, ctx: &Context, spec: &CreateSpec) -> TopoResult<String>;

    /// Start container `name`.
    async fn start_container(&self, ctx: &Context, name: &str) -> TopoResult<()>;

    /// Inspect container `name`, `None` when absent.
    async fn inspect(&self, ctx: &Context, name: &str) -> TopoResult<Option<InspectInfo>>;

    /// Containers matching every `--filter` value.
    async fn list(&self, ctx: &Context, filters: &[String]) -> TopoResult<Vec<PsEntry>>;

    /// Unpause container `name`.
    async fn unpause(&self, ctx: &Context, name: &str) -> TopoResult<()>;

    /// Send `signal` to container `name`.
    async fn kill(&self, ctx: &Context, name: &str, signal: &str) -> TopoResult<()>;

    /// Start listening for the container's exit.
    async fn wait(&self, ctx: &Context, name: &str) -> TopoResult<ExitWatch>;

    /// Remove container `name`, killing it if needed.
    async fn remove(&self, ctx: &Context, name: &str) -> TopoResult<()>;

    /// Run `cmd` in container `name`. A detached run returns once launched.
    async fn exec(&self, ctx: &Context, name: &str, cmd: &[String], detach: bool) -> TopoResult<ExecResult>;
}

/// [`PodmanApi`] over the `podman` tool.
#[derive(Debug, Clone)]
pub struct PodmanCli {
    podman: EngineCommand,
}

impl PodmanCli {
    /// Client for the configured binary and service.
    #[must_use]
    pub fn new(config: &PodmanConfig) -> Self {
        let mut podman = EngineCommand::new(&config.binary);
        if let Some(url) = &config.url {
            podman = podman.with_global_args(["--url", url.as_str()]);
        }
        Self { podman }
    }

    /// Run a yes/no query answered by the exit code.
    async fn exists(&self, ctx: &Context, context: &str, args: &[&str]) -> TopoResult<bool> {
        let out = self.podman.output(ctx, context, args).await?;
        match out.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.podman.failure(context, &out)),
        }
    }
}

#[async_trait]
impl PodmanApi for PodmanCli {
    async fn image_exists(&self, ctx: &Context, image: &str) -> TopoResult<bool> {
        self.exists(ctx, image, &["image", "exists", image]).await
    }

    async fn pull_image(&self, ctx: &Context, image: &str) -> TopoResult<()> {
        self.podman.run(ctx, image, ["pull", "--quiet", image]).await?;
        Ok(())
    }

    async fn network_exists(&self, ctx: &Context, name: &str) -> TopoResult<bool> {
        self.exists(ctx, name, &["network", "exists", name]).await
    }

    async fn create_network(&self, ctx: &Context, spec: &NetworkSpec) -> TopoResult<()> {
        self.podman.run(ctx, &spec.name, spec.to_args()).await?;
        Ok(())
    }

    async fn remove_network(&self, ctx: &Context, name: &str) -> TopoResult<()> {
        self.podman.run(ctx, name, ["network", "rm", name]).await?;
        Ok(())
    }

    async fn create_container(&self, ctx: &Context, spec: &CreateSpec) -> TopoResult<String> {
        self.podman.run(ctx, &spec.name, spec.to_args()?).await
    }

    async fn start_container(&self, ctx: &Context, name: &str) -> TopoResult<()> {
        self.podman.run(ctx, name, ["start", name]).await?;
        Ok(())
    }

    async fn inspect(&self, ctx: &Context, name: &str) -> TopoResult<Option<InspectInfo>> {
        let out = self
            .podman
            .output(ctx, name, ["container", "inspect", "--format", "json", name])
            .await?;
        if !out.success() {
            if out.reports_not_found() {
                return Ok(None);
            }
            return Err(self.podman.failure(name, &out));
        }
        let mut infos: Vec<InspectInfo> = serde_json::from_slice(&out.stdout)?;
        Ok(infos.pop())
    }

    async fn list(&self, ctx: &Context, filters: &[String]) -> TopoResult<Vec<PsEntry>> {
        let mut args = vec!["ps", "--all", "--format", "json"];
        for filter in filters {
            args.push("--filter");
            args.push(filter.as_str());
        }
        let out = self.podman.run(ctx, "container list", args).await?;
        if out.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out)?)
    }

    async fn unpause(&self, ctx: &Context, name: &str) -> TopoResult<()> {
        self.podman.run(ctx, name, ["unpause", name]).await?;
        Ok(())
    }

    async fn kill(&self, ctx: &Context, name: &str, signal: &str) -> TopoResult<()> {
        let out = self
            .podman
            .output(ctx, name, ["kill", "--signal", signal, name])
            .await?;
        if out.success() || out.reports_not_found() {
            return Ok(());
        }
        Err(self.podman.failure(name, &out))
    }

    async fn wait(&self, _ctx: &Context, name: &str) -> TopoResult<ExitWatch> {
        let child = self.podman.spawn(name, ["wait", name])?;
        let name = name.to_string();
        Ok(ExitWatch::spawn(async move {
            let out = child
                .wait_with_output()
                .await
                .map_err(|e| TopoError::engine(&name, format!("podman wait failed: {e}")))?;
            let stdout = String::from_utf8_lossy(&out.stdout);
            if !out.status.success() {
                return Err(TopoError::engine(
                    &name,
                    String::from_utf8_lossy(&out.stderr).trim().to_string(),
                ));
            }
            let code = stdout.trim().parse::<i64>().unwrap_or_default();
            Ok(ExitStatus::new(
                u32::try_from(code).unwrap_or_default(),
                chrono::Utc::now(),
            ))
        }))
    }

    async fn remove(&self, ctx: &Context, name: &str) -> TopoResult<()> {
        let out = self
            .podman
            .output(ctx, name, ["rm", "--force", "--volumes", name])
            .await?;
        if out.success() || out.reports_not_found() {
            return Ok(());
        }
        Err(self.podman.failure(name, &out))
    }

    async fn exec(&self, ctx: &Context, name: &str, cmd: &[String], detach: bool) -> TopoResult<ExecResult> {
        let mut args = vec!["exec".to_string()];
        if detach {
            args.push("--detach".to_string());
        }
        args.push(name.to_string());
        args.extend(cmd.iter().cloned());

        let out = self.podman.output(ctx, name, args).await?;
        // podman reserves 125 for its own failures
        if out.code == Some(125) || (detach && !out.success()) {
            return Err(self.podman.failure(name, &out));
        }
        Ok(ExecResult {
            exit_code: out.code.unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}
