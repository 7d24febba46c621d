use crate::config::ServerSpec;
use crate::error::{Error, Result};
use async_process::{Child, Command, Stdio};
use std::time::Duration;

/// A spawned MCP server child process.
///
/// The child is killed when the `ServerProcess` is dropped, so an abandoned
/// start never leaks a worker.
pub struct ServerProcess {
    /// Server name
    name: String,
    /// Command to execute
    command: String,
    /// Command-line arguments
    args: Vec<String>,
    /// Extra environment variables
    env: Vec<(String, String)>,
    /// Working directory; empty means inherit
    cwd: String,
    /// Child process
    child: Option<Child>,
}

impl ServerProcess {
    /// Create a process description from a spec. Nothing is spawned yet.
    pub fn new(spec: &ServerSpec) -> Self {
        let mut env: Vec<(String, String)> =
            spec.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.sort();
        Self {
            name: spec.name.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            env,
            cwd: spec.cwd.clone(),
            child: None,
        }
    }

    /// Get the server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Spawn the child with piped stdio.
    #[tracing::instrument(skip(self), fields(server = %self.name, command = %self.command))]
    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(Error::Process(format!("{} is already running", self.name)));
        }

        let mut command = Command::new(&self.command);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if !self.cwd.is_empty() {
            command.current_dir(&self.cwd);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to start process: {}", e)))?;
        tracing::debug!(pid = child.id(), "Process spawned");
        self.child = Some(child);
        Ok(())
    }

    /// Kill the child and wait up to `grace` for it to exit.
    #[tracing::instrument(skip(self), fields(server = %self.name))]
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Err(Error::Process(format!("{} is not running", self.name)));
        };

        if let Err(e) = child.kill() {
            return Err(Error::Process(format!("Failed to kill process: {}", e)));
        }
        match tokio::time::timeout(grace, child.status()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "Process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Process(format!("Failed to wait for process: {}", e))),
            Err(_) => Err(Error::Timeout(format!(
                "{} did not exit within {:?}",
                self.name, grace
            ))),
        }
    }

    fn child_mut(&mut self) -> Result<&mut Child> {
        let name = &self.name;
        self.child
            .as_mut()
            .ok_or_else(|| Error::Process(format!("{} is not running", name)))
    }

    /// Take the stdin pipe from the process
    pub fn take_stdin(&mut self) -> Result<async_process::ChildStdin> {
        self.child_mut()?.stdin.take().ok_or_else(|| {
            Error::Process("Failed to get stdin pipe from child process".to_string())
        })
    }

    /// Take the stdout pipe from the process
    pub fn take_stdout(&mut self) -> Result<async_process::ChildStdout> {
        self.child_mut()?.stdout.take().ok_or_else(|| {
            Error::Process("Failed to get stdout pipe from child process".to_string())
        })
    }

    /// Take the stderr pipe from the process
    pub fn take_stderr(&mut self) -> Result<async_process::ChildStderr> {
        self.child_mut()?.stderr.take().ok_or_else(|| {
            Error::Process("Failed to get stderr pipe from child process".to_string())
        })
    }
}
