//! podman driver.
//!
//! podman attaches containers to its own networks, so the driver only
//! creates the management network, passes static addressing at create
//! time and reads the assigned addresses back from inspect.

pub mod client;
pub mod convert;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use topolab_common::{Context, ContainerId, TopoError, TopoResult, canonical_image_name};
use topolab_network::{Ethtool, LinkTuning, MgmtNet, link_container_ns, ns_path_for_pid, unlink_container_ns};
use topolab_oci::{ContainerStatus, ExitStatus};

use crate::config::RuntimeConfig;
use crate::events::{EventBus, RuntimeEvent};
use crate::model::{ExecResult, GenericContainer, GenericFilter};
use crate::node::{DeploymentStatus, NodeSpec};
use crate::runtime::ContainerRuntime;
use crate::stop::{ExitWatch, TaskControl, stop_task};

pub use client::{InspectInfo, PodmanApi, PodmanCli, PsEntry};
pub use convert::{CreateSpec, NetworkSpec};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver for podman.
pub struct PodmanRuntime {
    client: Arc<dyn PodmanApi>,
    tuning: Arc<dyn LinkTuning>,
    mgmt: RwLock<MgmtNet>,
    config: RuntimeConfig,
    events: EventBus,
}

impl PodmanRuntime {
    /// Driver talking to podman through its command line.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let client = Arc::new(PodmanCli::new(&config.podman));
        Self::with_client(config, client, Arc::new(Ethtool::new()))
    }

    /// Driver over the given engine client and link tuning.
    #[must_use]
    pub fn with_client(
        config: RuntimeConfig,
        client: Arc<dyn PodmanApi>,
        tuning: Arc<dyn LinkTuning>,
    ) -> Self {
        Self {
            client,
            tuning,
            mgmt: RwLock::new(MgmtNet::default().with_default_bridge()),
            config,
            events: EventBus::new(),
        }
    }

    fn task(&self, name: &str) -> PodmanTask {
        PodmanTask {
            client: Arc::clone(&self.client),
            name: name.to_string(),
        }
    }

    async fn inspect(&self, ctx: &Context, name: &str) -> TopoResult<InspectInfo> {
        self.client
            .inspect(ctx, name)
            .await?
            .ok_or_else(|| convert::not_found(name))
    }

    /// Start, link and tune a freshly created container.
    async fn post_start(&self, ctx: &Context, node: &mut NodeSpec) -> TopoResult<()> {
        let name = node.long_name.clone();
        self.client.start_container(ctx, &name).await?;
        self.events.started(&name);

        let ns_path = self.get_ns_path(ctx, &name).await?;
        link_container_ns(&ns_path, &self.config.paths.netns_link(&name)).await?;
        node.ns_path = Some(ns_path);

        if node.network_mode.provisions_network() {
            let bridge = self.mgmt_net().bridge;
            if let Err(e) = self.tuning.disable_tx_offload(ctx, &bridge).await {
                tracing::warn!(container = %name, bridge = %bridge, error = %e, "cannot disable tx offload");
            }
        }

        let info = self.inspect(ctx, &name).await?;
        node.mgmt_ips = convert::mgmt_ips(&info);
        Ok(())
    }
}

impl std::fmt::Debug for PodmanRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodmanRuntime")
            .field("mgmt", &*self.mgmt.read())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn name(&self) -> &'static str {
        "podman"
    }

    fn set_mgmt_net(&self, net: MgmtNet) {
        let net = net.with_default_bridge();
        tracing::debug!(network = %net.network, bridge = %net.bridge, "management network set");
        *self.mgmt.write() = net;
    }

    fn mgmt_net(&self) -> MgmtNet {
        self.mgmt.read().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn create_net(&self, ctx: &Context) -> TopoResult<()> {
        let mgmt = self.mgmt_net();
        if self.client.network_exists(ctx, &mgmt.network).await? {
            tracing::debug!(network = %mgmt.network, "management network exists");
            return Ok(());
        }
        let spec = NetworkSpec::from_mgmt(&mgmt)?;
        tracing::info!(network = %spec.name, bridge = %spec.interface, "creating management network");
        self.client.create_network(ctx, &spec).await
    }

    async fn delete_net(&self, ctx: &Context) -> TopoResult<()> {
        let network = self.mgmt_net().network;
        if !self.client.network_exists(ctx, &network).await? {
            tracing::debug!(network = %network, "management network already gone");
            return Ok(());
        }
        tracing::info!(network = %network, "removing management network");
        self.client.remove_network(ctx, &network).await
    }

    async fn pull_image_if_required(&self, ctx: &Context, image: &str) -> TopoResult<()> {
        let image = canonical_image_name(image)?;
        if self.client.image_exists(ctx, &image).await? {
            tracing::debug!(image = %image, "image present, skipping pull");
            return Ok(());
        }
        tracing::info!(image = %image, "pulling image");
        self.client.pull_image(ctx, &image).await
    }

    async fn create_container(&self, ctx: &Context, node: &mut NodeSpec) -> TopoResult<()> {
        let id = ContainerId::new(&node.long_name)?;
        let image = canonical_image_name(&node.image)?;
        if !self.client.image_exists(ctx, &image).await? {
            return Err(TopoError::ImageNotFound { reference: image });
        }
        let spec = CreateSpec::from_node(node, &self.mgmt_net(), &image)?;

        tracing::info!(container = %id, image = %image, network = %spec.network, "creating container");
        let container_id = self.client.create_container(ctx, &spec).await?;
        node.container_id = Some(container_id);

        if let Err(e) = self.post_start(ctx, node).await {
            tracing::warn!(container = %id, error = %e, "create failed, cleaning up");
            let cleanup = Context::background().with_timeout(CLEANUP_TIMEOUT);
            if let Err(cleanup_err) = self.client.remove(&cleanup, id.as_str()).await {
                tracing::warn!(container = %id, error = %cleanup_err, "cleanup after failed create incomplete");
            }
            if let Err(unlink_err) = unlink_container_ns(&self.config.paths.netns_link(id.as_str())).await {
                tracing::warn!(container = %id, error = %unlink_err, "cannot remove namespace link");
            }
            node.ns_path = None;
            node.container_id = None;
            return Err(e);
        }

        node.deployment_status = DeploymentStatus::Created;
        self.events.created(id.as_str());
        tracing::debug!(container = %id, ns_path = ?node.ns_path, "container created");
        Ok(())
    }

    async fn start_container(&self, ctx: &Context, name: &str) -> TopoResult<()> {
        self.inspect(ctx, name).await?;
        self.client.start_container(ctx, name).await?;
        self.events.started(name);
        Ok(())
    }

    async fn stop_container(
        &self,
        ctx: &Context,
        name: &str,
        timeout: Option<Duration>,
    ) -> TopoResult<()> {
        stop_task(ctx, &self.task(name), self.config.stop_timeout(timeout)).await?;
        self.events.stopped(name);
        Ok(())
    }

    async fn delete_container(
        &self,
        ctx: &Context,
        container: &GenericContainer,
    ) -> TopoResult<()> {
        let name = container
            .names()
            .first()
            .map_or_else(|| container.id(), String::as_str);
        tracing::info!(container = %name, "deleting container");

        stop_task(ctx, &self.task(name), self.config.stop_timeout(None)).await?;
        self.events.stopped(name);

        unlink_container_ns(&self.config.paths.netns_link(name)).await?;
        self.client.remove(ctx, name).await?;
        self.events.deleted(name);
        Ok(())
    }

    async fn list_containers(
        &self,
        ctx: &Context,
        filters: &[GenericFilter],
    ) -> TopoResult<Vec<GenericContainer>> {
        let filters = convert::filter_args(filters);
        tracing::debug!(?filters, "listing containers");
        let entries = self.client.list(ctx, &filters).await?;
        let infos = try_join_all(entries.iter().map(|e| self.client.inspect(ctx, &e.id))).await?;
        // removed between ps and inspect
        Ok(infos.iter().flatten().map(convert::to_generic).collect())
    }

    async fn container_inspect(&self, ctx: &Context, name: &str) -> TopoResult<GenericContainer> {
        Ok(convert::to_generic(&self.inspect(ctx, name).await?))
    }

    async fn get_ns_path(&self, ctx: &Context, name: &str) -> TopoResult<PathBuf> {
        let task = convert::task_snapshot(&self.inspect(ctx, name).await?);
        if task.pid == 0 || task.status.is_stopped() {
            return Err(TopoError::NoTask {
                id: name.to_string(),
            });
        }
        Ok(ns_path_for_pid(task.pid))
    }

    async fn exec(&self, ctx: &Context, name: &str, cmd: &[String]) -> TopoResult<ExecResult> {
        tracing::debug!(container = name, ?cmd, "exec");
        self.client.exec(ctx, name, cmd, false).await
    }

    async fn exec_not_wait(&self, ctx: &Context, name: &str, cmd: &[String]) -> TopoResult<()> {
        tracing::debug!(container = name, ?cmd, "exec without waiting");
        self.client.exec(ctx, name, cmd, true).await?;
        Ok(())
    }
}

/// [`TaskControl`] over a podman container.
///
/// podman has no task record separate from the container, so deleting
/// the task only reports the last exit code.
struct PodmanTask {
    client: Arc<dyn PodmanApi>,
    name: String,
}

#[async_trait]
impl TaskControl for PodmanTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self, ctx: &Context) -> TopoResult<Option<ContainerStatus>> {
        Ok(self
            .client
            .inspect(ctx, &self.name)
            .await?
            .map(|info| convert::task_snapshot(&info).status))
    }

    async fn watch_exit(&self, ctx: &Context) -> TopoResult<ExitWatch> {
        self.client.wait(ctx, &self.name).await
    }

    async fn resume(&self, ctx: &Context) -> TopoResult<()> {
        self.client.unpause(ctx, &self.name).await
    }

    async fn kill(&self, ctx: &Context) -> TopoResult<()> {
        self.client.kill(ctx, &self.name, "KILL").await
    }

    async fn delete(&self, ctx: &Context) -> TopoResult<ExitStatus> {
        let code = self
            .client
            .inspect(ctx, &self.name)
            .await?
            .map_or(0, |info| u32::try_from(info.state.exit_code).unwrap_or_default());
        Ok(ExitStatus::code_only(code))
    }
}
