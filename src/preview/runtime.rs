//! Contract with the sandboxed runtime that hosts a preview.
//!
//! The orchestrator never touches processes or files directly. It boots one
//! [`Environment`] per session through a [`SandboxRuntime`], mounts the
//! assembled tree into it, and spawns commands that come back as
//! [`ProcessHandle`]s. Readiness ("a server bound a port") is decided by the
//! runtime and announced on [`Environment::server_ready`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::models::FileNode;
use crate::errors::{PreviewError, PreviewResult};

/// A spawned process bound a port reachable at `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Obtain an isolated environment. Called at most once per session.
    async fn boot(&self) -> PreviewResult<Arc<dyn Environment>>;
}

#[async_trait]
pub trait Environment: Send + Sync {
    /// Materialize `root` as the working directory, replacing prior contents.
    async fn mount(&self, root: &FileNode) -> PreviewResult<()>;

    async fn spawn(&self, command: &str, args: &[String]) -> PreviewResult<ProcessHandle>;

    /// Subscribe to port-binding notifications for this environment.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

/// One-shot kill capability for a spawned process.
///
/// `kill` consumes the switch, so a process can be killed at most once
/// through it. Dropping an unfired switch also terminates the process.
#[derive(Debug)]
pub struct KillSwitch {
    tx: oneshot::Sender<()>,
}

impl KillSwitch {
    /// Returns false if the process had already gone away.
    pub fn kill(self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Runtime-side ends of a [`ProcessHandle`].
#[derive(Debug)]
pub struct ProcessControl {
    pub output: mpsc::UnboundedSender<Vec<u8>>,
    pub exit: oneshot::Sender<i32>,
    /// Resolves `Ok(())` on an explicit kill, `Err(_)` when the handle's
    /// switch was dropped without firing.
    pub kill: oneshot::Receiver<()>,
}

/// Opaque reference to a command running inside an environment.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    output: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    exit: Option<oneshot::Receiver<i32>>,
    kill: Option<KillSwitch>,
}

impl ProcessHandle {
    /// Create a connected handle/control pair. Runtimes keep the control
    /// side and give the handle to the caller.
    pub fn channel(label: impl Into<String>) -> (Self, ProcessControl) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = Self {
            label: label.into(),
            output: Some(output_rx),
            exit: Some(exit_rx),
            kill: Some(KillSwitch { tx: kill_tx }),
        };
        let control = ProcessControl {
            output: output_tx,
            exit: exit_tx,
            kill: kill_rx,
        };
        (handle, control)
    }

    /// Command line the process was started with, for messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.output.take()
    }

    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<i32>> {
        self.exit.take()
    }

    pub fn take_kill_switch(&mut self) -> Option<KillSwitch> {
        self.kill.take()
    }

    /// Wait for the exit code.
    pub async fn wait(&mut self) -> PreviewResult<i32> {
        let exit = self
            .exit
            .take()
            .ok_or_else(|| PreviewError::Runtime(format!("exit status of '{}' already taken", self.label)))?;
        exit.await.map_err(|_| {
            PreviewError::Runtime(format!("'{}' ended without reporting an exit code", self.label))
        })
    }

    /// Fire the kill switch if it is still held here.
    pub fn kill(&mut self) -> bool {
        self.kill.take().is_some_and(KillSwitch::kill)
    }
}

/// Join a command and its arguments for display.
pub fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
