//! Running engine command-line tools.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::process::{Child, Command};

use topolab_common::{Context, TopoError, TopoResult};

/// Captured result of an engine command.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
}

impl EngineOutput {
    /// Returns true on a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Standard output as trimmed text.
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Standard error as trimmed text.
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Returns true if stderr reports a missing object.
    #[must_use]
    pub fn reports_not_found(&self) -> bool {
        let stderr = self.stderr_str().to_ascii_lowercase();
        stderr.contains("not found") || stderr.contains("no such")
    }
}

/// An engine binary with its global arguments.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    binary: String,
    global_args: Vec<String>,
}

impl EngineCommand {
    /// Wrap `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            global_args: Vec::new(),
        }
    }

    /// Add arguments passed before every subcommand.
    #[must_use]
    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The binary name.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.global_args)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run a subcommand and capture its output, whatever the exit code.
    ///
    /// `context` names the container or object the call is about.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the binary cannot be executed, or an
    /// abort error from `ctx`.
    pub async fn output<I, S>(&self, ctx: &Context, context: &str, args: I) -> TopoResult<EngineOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(args);
        tracing::trace!(command = ?cmd.as_std(), "running engine command");
        let output = ctx
            .run(&format!("{} call for {context}", self.binary), async {
                cmd.output()
                    .await
                    .map_err(|e| TopoError::engine(context, format!("failed to execute {}: {e}", self.binary)))
            })
            .await?;
        Ok(EngineOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Run a subcommand that must succeed, returning its stdout.
    ///
    /// # Errors
    ///
    /// Returns an engine error carrying stderr on a non-zero exit.
    pub async fn run<I, S>(&self, ctx: &Context, context: &str, args: I) -> TopoResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.output(ctx, context, args).await?;
        if out.success() {
            return Ok(out.stdout_str());
        }
        Err(self.failure(context, &out))
    }

    /// Spawn a long-running subcommand with piped stdout.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the binary cannot be executed.
    pub fn spawn<I, S>(&self, context: &str, args: I) -> TopoResult<Child>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TopoError::engine(context, format!("failed to execute {}: {e}", self.binary)))
    }

    /// The error for a failed call.
    #[must_use]
    pub fn failure(&self, context: &str, out: &EngineOutput) -> TopoError {
        let stderr = out.stderr_str();
        let message = if stderr.is_empty() {
            format!("{} exited with {:?}", self.binary, out.code)
        } else {
            stderr
        };
        TopoError::engine(context, message)
    }
}
