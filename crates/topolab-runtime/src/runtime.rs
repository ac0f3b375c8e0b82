//! The container runtime contract.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use topolab_common::{Context, TopoResult};
use topolab_network::MgmtNet;

use crate::events::RuntimeEvent;
use crate::model::{ExecResult, GenericContainer, GenericFilter};
use crate::node::NodeSpec;

/// Container lifecycle operations every engine driver provides.
///
/// A driver may be called concurrently for different containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Engine name.
    fn name(&self) -> &'static str;

    /// Record the management network. An empty bridge name becomes
    /// `br-<network>`.
    fn set_mgmt_net(&self, net: MgmtNet);

    /// The recorded management network.
    fn mgmt_net(&self) -> MgmtNet;

    /// Subscribe to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;

    /// Create the management network if the engine keeps one.
    async fn create_net(&self, ctx: &Context) -> TopoResult<()>;

    /// Remove the management network if the engine keeps one.
    async fn delete_net(&self, ctx: &Context) -> TopoResult<()>;

    /// Pull `image` unless it is already present.
    async fn pull_image_if_required(&self, ctx: &Context, image: &str) -> TopoResult<()>;

    /// Create and start a container for `node`, attach it to the
    /// management network, and fill in the write-back fields.
    async fn create_container(&self, ctx: &Context, node: &mut NodeSpec) -> TopoResult<()>;

    /// Start an existing container.
    async fn start_container(&self, ctx: &Context, name: &str) -> TopoResult<()>;

    /// Stop a container. `timeout` bounds the wait for its exit.
    async fn stop_container(
        &self,
        ctx: &Context,
        name: &str,
        timeout: Option<Duration>,
    ) -> TopoResult<()>;

    /// Stop, detach and remove a container.
    async fn delete_container(&self, ctx: &Context, container: &GenericContainer)
    -> TopoResult<()>;

    /// Containers matching every filter. No match is an empty list.
    async fn list_containers(
        &self,
        ctx: &Context,
        filters: &[GenericFilter],
    ) -> TopoResult<Vec<GenericContainer>>;

    /// One container by name.
    async fn container_inspect(&self, ctx: &Context, name: &str) -> TopoResult<GenericContainer>;

    /// Network namespace path of a running container.
    async fn get_ns_path(&self, ctx: &Context, name: &str) -> TopoResult<PathBuf>;

    /// Run `cmd` in a container and wait for it.
    async fn exec(&self, ctx: &Context, name: &str, cmd: &[String]) -> TopoResult<ExecResult>;

    /// Launch `cmd` in a container without waiting for it.
    async fn exec_not_wait(&self, ctx: &Context, name: &str, cmd: &[String]) -> TopoResult<()>;
}

/// Poll until container `name` is running.
///
/// # Errors
///
/// Returns inspect errors, or an abort error once `ctx` finishes.
pub async fn wait_for_container_running(
    runtime: &dyn ContainerRuntime,
    ctx: &Context,
    name: &str,
    poll: Duration,
) -> TopoResult<GenericContainer> {
    loop {
        let container = runtime.container_inspect(ctx, name).await?;
        if container.state().is_running() {
            return Ok(container);
        }
        tracing::trace!(container = name, state = %container.state(), "waiting for container to run");
        ctx.run(&format!("wait for {name} to run"), async {
            tokio::time::sleep(poll).await;
            Ok(())
        })
        .await?;
    }
}
