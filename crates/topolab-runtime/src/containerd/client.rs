//! containerd engine client.
//!
//! [`ContainerdApi`] is the seam between the driver and containerd.
//! [`CtrClient`] implements it by running `ctr` against the configured
//! socket and namespace.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use topolab_common::{Context, TopoError, TopoResult};
use topolab_oci::{ContainerStatus, ExitStatus, Spec};

use crate::config::ContainerdConfig;
use crate::engine::EngineCommand;
use crate::model::{ExecResult, TaskSnapshot};
use crate::stop::ExitWatch;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A container to create.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    /// Container ID, the node's long name.
    pub id: String,
    /// Canonical image reference.
    pub image: String,
    /// Runtime spec.
    pub spec: Spec,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
}

/// A container record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container ID.
    pub id: String,
    /// Image reference.
    pub image: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
}

/// containerd operations used by the driver.
#[async_trait]
pub trait ContainerdApi: Send + Sync {
    /// Returns true if `image` is present.
    async fn image_exists(&self, ctx: &Context, image: &str) -> TopoResult<bool>;

    /// Pull `image`.
    async fn pull_image(&self, ctx: &Context, image: &str) -> TopoResult<()>;

    /// Create a container with a fresh snapshot.
    async fn create_container(&self, ctx: &Context, req: &CreateRequest) -> TopoResult<()>;

    /// Container record, `None` when absent.
    async fn container_info(&self, ctx: &Context, id: &str) -> TopoResult<Option<ContainerInfo>>;

    /// Containers matching a filter expression.
    async fn list_containers(&self, ctx: &Context, filter: &str) -> TopoResult<Vec<ContainerInfo>>;

    /// Add or replace labels.
    async fn set_labels(
        &self,
        ctx: &Context,
        id: &str,
        labels: &BTreeMap<String, String>,
    ) -> TopoResult<()>;

    /// Remove a container and its snapshot.
    async fn delete_container(&self, ctx: &Context, id: &str) -> TopoResult<()>;

    /// Create and start the container's task, logging to `log`.
    async fn start_task(&self, ctx: &Context, id: &str, log: &Path) -> TopoResult<()>;

    /// The container's task, `None` when it has none.
    async fn task(&self, ctx: &Context, id: &str) -> TopoResult<Option<TaskSnapshot>>;

    /// Start listening for the task's exit.
    async fn watch_exit(&self, ctx: &Context, id: &str) -> TopoResult<ExitWatch>;

    /// Resume a paused task.
    async fn resume_task(&self, ctx: &Context, id: &str) -> TopoResult<()>;

    /// Send SIGKILL to the task.
    async fn kill_task(&self, ctx: &Context, id: &str) -> TopoResult<()>;

    /// Delete the task, returning its exit status.
    async fn delete_task(&self, ctx: &Context, id: &str) -> TopoResult<ExitStatus>;

    /// Run `cmd` in the task. A detached run returns once launched.
    async fn exec(&self, ctx: &Context, id: &str, cmd: &[String], detach: bool) -> TopoResult<ExecResult>;
}

/// [`ContainerdApi`] over the `ctr` tool.
#[derive(Debug, Clone)]
pub struct CtrClient {
    ctr: EngineCommand,
    exits: Arc<Mutex<HashMap<String, ExitStatus>>>,
}

impl CtrClient {
    /// Client for the configured socket and namespace.
    #[must_use]
    pub fn new(config: &ContainerdConfig) -> Self {
        let ctr = EngineCommand::new(&config.binary).with_global_args([
            "--address",
            config.address.as_str(),
            "--namespace",
            config.namespace.as_str(),
        ]);
        Self {
            ctr,
            exits: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ContainerdApi for CtrClient {
    async fn image_exists(&self, ctx: &Context, image: &str) -> TopoResult<bool> {
        let filter = format!("name=={image}");
        let out = self.ctr.run(ctx, image, ["images", "ls", "-q", &filter]).await?;
        Ok(out.lines().any(|line| line.trim() == image))
    }

    async fn pull_image(&self, ctx: &Context, image: &str) -> TopoResult<()> {
        self.ctr.run(ctx, image, ["images", "pull", image]).await?;
        Ok(())
    }

    async fn create_container(&self, ctx: &Context, req: &CreateRequest) -> TopoResult<()> {
        self.ctr.run(ctx, &req.id, create_args(req)).await?;
        Ok(())
    }

    async fn container_info(&self, ctx: &Context, id: &str) -> TopoResult<Option<ContainerInfo>> {
        let out = self.ctr.output(ctx, id, ["containers", "info", id]).await?;
        if !out.success() {
            if out.reports_not_found() {
                return Ok(None);
            }
            return Err(self.ctr.failure(id, &out));
        }
        let raw: RawContainerInfo = serde_json::from_slice(&out.stdout)?;
        Ok(Some(ContainerInfo {
            id: raw.id,
            image: raw.image,
            labels: raw.labels.unwrap_or_default(),
        }))
    }

    async fn list_containers(&self, ctx: &Context, filter: &str) -> TopoResult<Vec<ContainerInfo>> {
        let mut args = vec!["containers", "ls", "-q"];
        if !filter.is_empty() {
            args.push(filter);
        }
        let out = self.ctr.run(ctx, "container list", args).await?;
        let ids: Vec<&str> = out.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        // a container removed between ls and info drops out
        let infos = try_join_all(ids.iter().map(|id| self.container_info(ctx, id))).await?;
        Ok(infos.into_iter().flatten().collect())
    }

    async fn set_labels(
        &self,
        ctx: &Context,
        id: &str,
        labels: &BTreeMap<String, String>,
    ) -> TopoResult<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let mut args = vec!["containers".to_string(), "label".to_string(), id.to_string()];
        args.extend(labels.iter().map(|(k, v)| format!("{k}={v}")));
        self.ctr.run(ctx, id, args).await?;
        Ok(())
    }

    async fn delete_container(&self, ctx: &Context, id: &str) -> TopoResult<()> {
        self.ctr.run(ctx, id, ["containers", "delete", id]).await?;
        self.exits.lock().remove(id);
        Ok(())
    }

    async fn start_task(&self, ctx: &Context, id: &str, log: &Path) -> TopoResult<()> {
        let log_uri = format!("file://{}", log.display());
        self.ctr
            .run(ctx, id, ["tasks", "start", "--detach", "--log-uri", &log_uri, id])
            .await?;
        Ok(())
    }

    async fn task(&self, ctx: &Context, id: &str) -> TopoResult<Option<TaskSnapshot>> {
        let Some((status, pid)) = task_status(&self.ctr, ctx, id).await? else {
            return Ok(None);
        };
        let exit = if status.is_stopped() {
            self.exits.lock().get(id).copied()
        } else {
            None
        };
        Ok(Some(TaskSnapshot { status, pid, exit }))
    }

    async fn watch_exit(&self, _ctx: &Context, id: &str) -> TopoResult<ExitWatch> {
        let mut child = self
            .ctr
            .spawn(id, ["events", r#"topic=="/tasks/exit""#])?;
        let stdout = child.stdout.take().ok_or_else(|| TopoError::Internal {
            message: "event stream has no stdout".to_string(),
        })?;

        let ctr = self.ctr.clone();
        let exits = Arc::clone(&self.exits);
        let id = id.to_string();
        Ok(ExitWatch::spawn(async move {
            // keeps the subscription alive until the watch ends
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            let mut streaming = true;
            let mut ticker = tokio::time::interval(EXIT_POLL_INTERVAL);
            let ctx = Context::background();
            loop {
                tokio::select! {
                    line = lines.next_line(), if streaming => match line {
                        Ok(Some(line)) => {
                            if let Some(exit) = parse_exit_event(&line, &id) {
                                exits.lock().insert(id.clone(), exit);
                                return Ok(exit);
                            }
                        }
                        Ok(None) | Err(_) => {
                            tracing::debug!(container = %id, "event stream closed, polling task state");
                            streaming = false;
                        }
                    },
                    _ = ticker.tick() => {
                        match task_status(&ctr, &ctx, &id).await? {
                            None => return Ok(exits.lock().get(&id).copied().unwrap_or(ExitStatus::code_only(0))),
                            Some((status, _)) if status.is_stopped() => {
                                // the code is reported when the task is deleted
                                return Ok(ExitStatus::code_only(0));
                            }
                            Some(_) => {}
                        }
                    }
                }
            }
        }))
    }

    async fn resume_task(&self, ctx: &Context, id: &str) -> TopoResult<()> {
        self.ctr.run(ctx, id, ["tasks", "resume", id]).await?;
        Ok(())
    }

    async fn kill_task(&self, ctx: &Context, id: &str) -> TopoResult<()> {
        let out = self
            .ctr
            .output(ctx, id, ["tasks", "kill", "--signal", "SIGKILL", id])
            .await?;
        if out.success() || out.reports_not_found() {
            return Ok(());
        }
        Err(self.ctr.failure(id, &out))
    }

    async fn delete_task(&self, ctx: &Context, id: &str) -> TopoResult<ExitStatus> {
        let out = self.ctr.output(ctx, id, ["tasks", "delete", id]).await?;
        // ctr exits with the task's exit code and prints nothing for it
        if !out.stderr_str().is_empty() && !out.reports_not_found() {
            return Err(self.ctr.failure(id, &out));
        }
        let code = out.code.and_then(|c| u32::try_from(c).ok()).unwrap_or_default();
        let recorded = self.exits.lock().get(id).copied();
        Ok(match recorded.and_then(|e| e.exited_at) {
            Some(at) => ExitStatus::new(code, at),
            None => ExitStatus::code_only(code),
        })
    }

    async fn exec(&self, ctx: &Context, id: &str, cmd: &[String], detach: bool) -> TopoResult<ExecResult> {
        let exec_id = format!("clab-{}", uuid::Uuid::new_v4().simple());
        let mut args = vec!["tasks".to_string(), "exec".to_string(), "--exec-id".to_string(), exec_id];
        if detach {
            args.push("--detach".to_string());
        }
        args.push(id.to_string());
        args.extend(cmd.iter().cloned());

        let out = self.ctr.output(ctx, id, args).await?;
        let stderr = out.stderr_str();
        if stderr.starts_with("ctr: ") || (detach && !out.success()) {
            return Err(self.ctr.failure(id, &out));
        }
        Ok(ExecResult {
            exit_code: out.code.unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawContainerInfo {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

async fn task_status(
    ctr: &EngineCommand,
    ctx: &Context,
    id: &str,
) -> TopoResult<Option<(ContainerStatus, u32)>> {
    let out = ctr.run(ctx, id, ["tasks", "ls"]).await?;
    Ok(parse_task_list(&out, id))
}

/// Find `id` in `ctr tasks ls` output.
fn parse_task_list(out: &str, id: &str) -> Option<(ContainerStatus, u32)> {
    out.lines().skip(1).find_map(|line| {
        let mut cols = line.split_whitespace();
        if cols.next()? != id {
            return None;
        }
        let pid = cols.next()?.parse().unwrap_or_default();
        let status = match cols.next()?.parse::<ContainerStatus>() {
            Ok(status) => status,
            Err(never) => match never {},
        };
        Some((status, pid))
    })
}

#[derive(Debug, Deserialize)]
struct TaskExitEvent {
    container_id: String,
    #[serde(default)]
    exit_status: u32,
    #[serde(default)]
    exited_at: Option<EventTime>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventTime {
    Rfc3339(DateTime<Utc>),
    Proto {
        seconds: i64,
        #[serde(default)]
        nanos: u32,
    },
}

impl EventTime {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Rfc3339(at) => Some(*at),
            Self::Proto { seconds, nanos } => Utc.timestamp_opt(*seconds, *nanos).single(),
        }
    }
}

/// Exit status from a `ctr events` line, if it reports `id` exiting.
///
/// Lines read `<timestamp> <namespace> /tasks/exit {json}`.
fn parse_exit_event(line: &str, id: &str) -> Option<ExitStatus> {
    if !line.contains("/tasks/exit") {
        return None;
    }
    let body = &line[line.find('{')?..];
    let event: TaskExitEvent = serde_json::from_str(body).ok()?;
    if event.container_id != id {
        return None;
    }
    Some(match event.exited_at.as_ref().and_then(EventTime::to_utc) {
        Some(at) => ExitStatus::new(event.exit_status, at),
        None => ExitStatus::code_only(event.exit_status),
    })
}

/// `ctr containers create` arguments for `req`.
fn create_args(req: &CreateRequest) -> Vec<String> {
    let spec = &req.spec;
    let mut args = vec!["containers".to_string(), "create".to_string()];
    let mut flag = |name: &str, value: String| {
        args.push(name.to_string());
        args.push(value);
    };

    if let Some(process) = &spec.process {
        for env in &process.env {
            flag("--env", env.clone());
        }
        if let Some(user) = &process.user.username {
            flag("--user", user.clone());
        }
    }
    for (k, v) in &req.labels {
        flag("--label", format!("{k}={v}"));
    }
    for mount in &spec.mounts {
        let (Some(src), Some(kind)) = (&mount.source, &mount.mount_type) else {
            continue;
        };
        flag(
            "--mount",
            format!(
                "type={kind},src={},dst={},options={}",
                src.display(),
                mount.destination.display(),
                mount.options.join(":")
            ),
        );
    }
    if let Some(hostname) = &spec.hostname {
        flag("--hostname", hostname.clone());
    }
    if let Some(linux) = &spec.linux {
        for (k, v) in &linux.sysctl {
            flag("--sysctl", format!("{k}={v}"));
        }
        if let Some(resources) = &linux.resources {
            if let Some(limit) = resources.memory.as_ref().and_then(|m| m.limit) {
                flag("--memory-limit", limit.to_string());
            }
            if let Some(cpu) = &resources.cpu {
                if let Some(quota) = cpu.quota {
                    flag("--cpu-quota", quota.to_string());
                }
                if let Some(period) = cpu.period {
                    flag("--cpu-period", period.to_string());
                }
                if let Some(cpus) = &cpu.cpus {
                    flag("--cpuset-cpus", cpus.clone());
                }
            }
        }
    }
    match spec.network_namespace() {
        None => args.push("--net-host".to_string()),
        Some(ns) => {
            if let Some(path) = &ns.path {
                args.push("--with-ns".to_string());
                args.push(format!("network:{}", path.display()));
            }
        }
    }
    args.push("--privileged".to_string());

    args.push(req.image.clone());
    args.push(req.id.clone());
    if let Some(process) = &spec.process {
        args.extend(process.args.iter().cloned());
    }
    args
}
