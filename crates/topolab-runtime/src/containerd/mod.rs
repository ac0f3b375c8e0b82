//! containerd driver.
//!
//! containerd has no networking of its own: the driver attaches each
//! bridge-mode container to the management network with the plugin chain
//! from `topolab-network`, and records the assigned addresses as labels.

pub mod client;
pub mod convert;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use topolab_common::{Context, ContainerId, TopoError, TopoResult, canonical_image_name};
use topolab_network::cni::MGMT_NETWORK_NAME;
use topolab_network::{
    AttachResult, MGMT_IFNAME, MgmtNet, NetworkAttachment, PluginExec, RawExec,
    link_container_ns, ns_path_for_pid, unlink_container_ns,
};
use topolab_oci::{ContainerStatus, ExitStatus};

use crate::config::RuntimeConfig;
use crate::events::{EventBus, RuntimeEvent};
use crate::model::{ExecResult, GenericContainer, GenericFilter, GenericMgmtIPs};
use crate::node::{DeploymentStatus, NodeSpec};
use crate::runtime::ContainerRuntime;
use crate::stop::{ExitWatch, TaskControl, stop_task};

pub use client::{ContainerInfo, ContainerdApi, CreateRequest, CtrClient};

/// Bound on the cleanup after a failed create.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver for containerd.
pub struct ContainerdRuntime {
    client: Arc<dyn ContainerdApi>,
    plugins: Arc<dyn PluginExec>,
    mgmt: RwLock<MgmtNet>,
    config: RuntimeConfig,
    events: EventBus,
}

impl ContainerdRuntime {
    /// Driver talking to containerd through `ctr`.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let client = Arc::new(CtrClient::new(&config.containerd));
        Self::with_client(config, client, Arc::new(RawExec))
    }

    /// Driver over the given engine client and plugin executor.
    #[must_use]
    pub fn with_client(
        config: RuntimeConfig,
        client: Arc<dyn ContainerdApi>,
        plugins: Arc<dyn PluginExec>,
    ) -> Self {
        Self {
            client,
            plugins,
            mgmt: RwLock::new(MgmtNet::default().with_default_bridge()),
            config,
            events: EventBus::new(),
        }
    }

    fn task(&self, id: &str) -> ContainerdTask {
        ContainerdTask {
            client: Arc::clone(&self.client),
            id: id.to_string(),
        }
    }

    fn attachment(&self, id: &str) -> TopoResult<NetworkAttachment> {
        NetworkAttachment::new(&self.mgmt_net(), id, &self.config.paths)
    }

    fn prepare_attachment(&self, node: &NodeSpec) -> TopoResult<NetworkAttachment> {
        let mut attachment = self.attachment(&node.long_name)?;
        if !node.mac_address.is_empty() {
            attachment = attachment.with_mac(&node.mac_address)?;
        }
        Ok(attachment.with_port_mappings(node.port_mappings()?))
    }

    async fn start_task(&self, ctx: &Context, id: &str) -> TopoResult<()> {
        tokio::fs::create_dir_all(&self.config.paths.log_dir).await?;
        let log = self.config.paths.container_log(id);
        self.client.start_task(ctx, id, &log).await?;
        self.events.started(id);
        Ok(())
    }

    /// Start, link and attach a freshly created container.
    async fn start_and_attach(
        &self,
        ctx: &Context,
        node: &mut NodeSpec,
        attachment: Option<NetworkAttachment>,
    ) -> TopoResult<GenericMgmtIPs> {
        let id = node.long_name.clone();
        self.start_task(ctx, &id).await?;

        let ns_path = self.get_ns_path(ctx, &id).await?;
        link_container_ns(&ns_path, &self.config.paths.netns_link(&id)).await?;
        node.ns_path = Some(ns_path.clone());

        let Some(attachment) = attachment else {
            return Ok(GenericMgmtIPs::unset());
        };
        let result = attachment
            .with_netns(Some(ns_path))
            .add(ctx, self.plugins.as_ref())
            .await?;
        let ips = GenericMgmtIPs::from_attach(&AttachResult::from_result(&id, &result)?);
        self.client
            .set_labels(ctx, &id, &convert::mgmt_labels(&ips))
            .await?;
        Ok(ips)
    }

    /// Stop, detach and remove container `id`.
    async fn teardown(&self, ctx: &Context, id: &str, detach: bool) -> TopoResult<()> {
        let ns_path = self
            .client
            .task(ctx, id)
            .await?
            .filter(|task| task.pid > 0)
            .map(|task| ns_path_for_pid(task.pid));

        stop_task(ctx, &self.task(id), self.config.stop_timeout(None)).await?;
        self.events.stopped(id);

        let cache = self.config.paths.cni_result(MGMT_NETWORK_NAME, id, MGMT_IFNAME);
        if detach || cached_attachment(&cache).await {
            self.attachment(id)?
                .with_netns(ns_path)
                .del(ctx, self.plugins.as_ref())
                .await?;
        }

        unlink_container_ns(&self.config.paths.netns_link(id)).await?;
        self.client.delete_container(ctx, id).await?;
        self.events.deleted(id);
        Ok(())
    }
}

/// Whether an attach left a cached result at `cache`.
///
/// An unreadable cache counts as present so the lease is still released.
async fn cached_attachment(cache: &Path) -> bool {
    match tokio::fs::try_exists(cache).await {
        Ok(exists) => exists,
        Err(e) => {
            tracing::warn!(path = %cache.display(), error = %e, "cannot check cached attach result, detaching anyway");
            true
        }
    }
}

impl std::fmt::Debug for ContainerdRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerdRuntime")
            .field("mgmt", &*self.mgmt.read())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ContainerRuntime for ContainerdRuntime {
    fn name(&self) -> &'static str {
        "containerd"
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

    async fn create_net(&self, _ctx: &Context) -> TopoResult<()> {
        tracing::debug!("containerd keeps no management network, nothing to create");
        Ok(())
    }

    async fn delete_net(&self, _ctx: &Context) -> TopoResult<()> {
        tracing::debug!("containerd keeps no management network, nothing to delete");
        Ok(())
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

        let spec = convert::build_spec(node, &self.config.paths)?;
        let attachment = if node.network_mode.provisions_network() {
            Some(self.prepare_attachment(node)?)
        } else {
            None
        };
        if !node.mgmt_ipv4_address.is_empty() || !node.mgmt_ipv6_address.is_empty() {
            tracing::warn!(
                container = %id,
                "static management addresses are not supported by the containerd driver, using IPAM"
            );
        }

        tracing::info!(container = %id, image = %image, mode = %node.network_mode, "creating container");
        self.client
            .create_container(
                ctx,
                &CreateRequest {
                    id: id.as_str().to_string(),
                    image,
                    spec,
                    labels: node.labels.clone(),
                },
            )
            .await?;
        node.container_id = Some(id.as_str().to_string());

        match self.start_and_attach(ctx, node, attachment).await {
            Ok(ips) => node.mgmt_ips = ips,
            Err(e @ TopoError::IpExtraction { .. }) => {
                tracing::error!(container = %id, error = %e, "attached, but addresses could not be read");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "create failed, cleaning up");
                let cleanup = Context::background().with_timeout(CLEANUP_TIMEOUT);
                // only a completed attach left a cached result to undo
                if let Err(cleanup_err) = self.teardown(&cleanup, id.as_str(), false).await {
                    tracing::warn!(container = %id, error = %cleanup_err, "cleanup after failed create incomplete");
                }
                node.ns_path = None;
                node.container_id = None;
                return Err(e);
            }
        }

        node.deployment_status = DeploymentStatus::Created;
        self.events.created(id.as_str());
        tracing::debug!(container = %id, ns_path = ?node.ns_path, "container created");
        Ok(())
    }

    async fn start_container(&self, ctx: &Context, name: &str) -> TopoResult<()> {
        if self.client.container_info(ctx, name).await?.is_none() {
            return Err(TopoError::ContainerNotFound {
                id: name.to_string(),
            });
        }
        self.start_task(ctx, name).await
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
        let id = container.id();
        tracing::info!(container = %id, "deleting container");
        self.teardown(ctx, id, container.mgmt_ips().is_set()).await
    }

    async fn list_containers(
        &self,
        ctx: &Context,
        filters: &[GenericFilter],
    ) -> TopoResult<Vec<GenericContainer>> {
        let expr = convert::filter_expr(filters);
        tracing::debug!(filter = %expr, "listing containers");
        let infos = self.client.list_containers(ctx, &expr).await?;
        let tasks = try_join_all(infos.iter().map(|info| self.client.task(ctx, &info.id))).await?;
        Ok(infos
            .iter()
            .zip(tasks)
            .map(|(info, task)| convert::to_generic(info, task))
            .collect())
    }

    async fn container_inspect(&self, ctx: &Context, name: &str) -> TopoResult<GenericContainer> {
        let infos = self
            .client
            .list_containers(ctx, &convert::exact_name_expr(name))
            .await?;
        let Some(info) = infos.into_iter().next() else {
            return Err(TopoError::ContainerNotFound {
                id: name.to_string(),
            });
        };
        let task = self.client.task(ctx, &info.id).await?;
        Ok(convert::to_generic(&info, task))
    }

    async fn get_ns_path(&self, ctx: &Context, name: &str) -> TopoResult<PathBuf> {
        match self.client.task(ctx, name).await? {
            Some(task) if task.pid > 0 && !task.status.is_stopped() => Ok(ns_path_for_pid(task.pid)),
            _ => Err(TopoError::NoTask {
                id: name.to_string(),
            }),
        }
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

/// [`TaskControl`] over a containerd task.
struct ContainerdTask {
    client: Arc<dyn ContainerdApi>,
    id: String,
}

#[async_trait]
impl TaskControl for ContainerdTask {
    fn name(&self) -> &str {
        &self.id
    }

    async fn status(&self, ctx: &Context) -> TopoResult<Option<ContainerStatus>> {
        Ok(self.client.task(ctx, &self.id).await?.map(|task| task.status))
    }

    async fn watch_exit(&self, ctx: &Context) -> TopoResult<ExitWatch> {
        self.client.watch_exit(ctx, &self.id).await
    }

    async fn resume(&self, ctx: &Context) -> TopoResult<()> {
        self.client.resume_task(ctx, &self.id).await
    }

    async fn kill(&self, ctx: &Context) -> TopoResult<()> {
        self.client.kill_task(ctx, &self.id).await
    }

    async fn delete(&self, ctx: &Context) -> TopoResult<ExitStatus> {
        self.client.delete_task(ctx, &self.id).await
    }
}
