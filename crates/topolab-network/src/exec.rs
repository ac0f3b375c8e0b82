//! Plugin binary invocation.
//!
//! Plugins are executables found on the plugin search path. They receive
//! their configuration on stdin, the call parameters in `CNI_*` environment
//! variables, and print a result (or an error object) on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use topolab_common::{Context, TopoError, TopoResult};

use crate::cni::PluginError;

/// Locates and runs network plugin binaries.
#[async_trait]
pub trait PluginExec: Send + Sync {
    /// Find the binary for plugin type `plugin` in `paths`.
    async fn find_plugin(&self, plugin: &str, paths: &[PathBuf]) -> TopoResult<PathBuf>;

    /// Run `binary` with `stdin` and the given environment, returning stdout.
    async fn exec_plugin(
        &self,
        ctx: &Context,
        binary: &Path,
        stdin: Vec<u8>,
        env: Vec<(String, String)>,
    ) -> TopoResult<Vec<u8>>;
}

/// Runs plugins as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawExec;

#[async_trait]
impl PluginExec for RawExec {
    async fn find_plugin(&self, plugin: &str, paths: &[PathBuf]) -> TopoResult<PathBuf> {
        for dir in paths {
            let candidate = dir.join(plugin);
            if tokio::fs::metadata(&candidate)
                .await
                .is_ok_and(|m| m.is_file())
            {
                return Ok(candidate);
            }
        }
        Err(TopoError::PluginNotFound {
            plugin: plugin.to_string(),
            paths: paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":"),
        })
    }

    async fn exec_plugin(
        &self,
        ctx: &Context,
        binary: &Path,
        stdin: Vec<u8>,
        env: Vec<(String, String)>,
    ) -> TopoResult<Vec<u8>> {
        let plugin = binary
            .file_name()
            .map_or_else(|| binary.display().to_string(), |n| n.to_string_lossy().into_owned());

        tracing::trace!(plugin = %plugin, "invoking network plugin");

        let mut child = Command::new(binary)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TopoError::Config {
                message: format!("failed to execute plugin {}: {e}", binary.display()),
            })?;

        if let Some(mut input) = child.stdin.take() {
            input.write_all(&stdin).await?;
        }

        let output = ctx
            .run(&format!("network plugin {plugin}"), async {
                child.wait_with_output().await.map_err(TopoError::from)
            })
            .await?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let err: PluginError = serde_json::from_slice(&output.stdout).unwrap_or_else(|_| {
            PluginError {
                msg: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ..PluginError::default()
            }
        });
        Err(TopoError::Plugin {
            plugin,
            code: err.code,
            message: err.message(),
        })
    }
}
