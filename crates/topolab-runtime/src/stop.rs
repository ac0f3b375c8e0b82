//! Stopping a container's task.
//!
//! Every driver stops containers the same way; only the primitives behind
//! [`TaskControl`] differ.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use topolab_common::{Context, TopoError, TopoResult};
use topolab_oci::{ContainerStatus, ExitStatus};

/// Pending notification of a task's exit.
///
/// Dropping the watch stops listening.
#[derive(Debug)]
pub struct ExitWatch {
    handle: JoinHandle<TopoResult<ExitStatus>>,
}

impl ExitWatch {
    /// Watch for the exit reported by `fut`.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = TopoResult<ExitStatus>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(fut),
        }
    }

    /// Wait for the exit, or for `ctx` to finish.
    ///
    /// # Errors
    ///
    /// Returns the watcher's error, or an abort error from `ctx`.
    pub async fn wait(mut self, ctx: &Context, operation: &str) -> TopoResult<ExitStatus> {
        ctx.run(operation, async {
            match (&mut self.handle).await {
                Ok(status) => status,
                Err(e) => Err(TopoError::Internal {
                    message: format!("exit watcher failed: {e}"),
                }),
            }
        })
        .await
    }
}

impl Drop for ExitWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Task primitives a driver provides for [`stop_task`].
#[async_trait]
pub trait TaskControl: Send + Sync {
    /// Container name, for logs and errors.
    fn name(&self) -> &str;

    /// Current task state, `None` when the container has no task.
    async fn status(&self, ctx: &Context) -> TopoResult<Option<ContainerStatus>>;

    /// Start listening for the task's exit.
    async fn watch_exit(&self, ctx: &Context) -> TopoResult<ExitWatch>;

    /// Resume a paused task.
    async fn resume(&self, ctx: &Context) -> TopoResult<()>;

    /// Deliver SIGKILL.
    async fn kill(&self, ctx: &Context) -> TopoResult<()>;

    /// Remove the task record, returning its exit status.
    async fn delete(&self, ctx: &Context) -> TopoResult<ExitStatus>;
}

/// Stop a task.
///
/// A missing task is already stopped. Created and stopped tasks skip
/// straight to deletion. A paused task is resumed before the kill, with
/// the exit watch registered first. `timeout` bounds the wait for exit.
///
/// # Errors
///
/// Returns engine errors from the primitives, and
/// [`TopoError::Cancelled`] or [`TopoError::DeadlineExceeded`] when the
/// wait is aborted.
pub async fn stop_task(
    ctx: &Context,
    task: &dyn TaskControl,
    timeout: Option<Duration>,
) -> TopoResult<()> {
    let name = task.name();
    let Some(status) = task.status(ctx).await? else {
        tracing::debug!(container = name, "no task found, nothing to stop");
        return Ok(());
    };
    tracing::debug!(container = name, %status, "stopping task");

    if status.needs_kill() {
        let exit = task.watch_exit(ctx).await?;

        if status.needs_resume() {
            if let Err(e) = task.resume(ctx).await {
                tracing::warn!(container = name, error = %e, "cannot resume paused task");
            }
        }

        task.kill(ctx).await?;

        let wait_ctx = match timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let exited = exit.wait(&wait_ctx, &format!("stop {name}")).await?;
        tracing::trace!(container = name, code = exited.code, "task exited");
    }

    let exit = task.delete(ctx).await?;
    tracing::debug!(container = name, exit_code = exit.code, "container stopped");
    Ok(())
}
