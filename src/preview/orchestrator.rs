//! Process Orchestrator: run the install command to completion, then launch
//! the long-running server command.
//!
//! One install and one server spawn per deploy cycle. Sequencing and the
//! ownership of the resulting handles belong to the lifecycle controller;
//! this module only knows how to start each step and how to judge the
//! install's outcome.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::console::pump_output_with;
use super::runtime::{Environment, ProcessHandle, command_line};
use crate::errors::{PreviewError, PreviewResult};

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Build from an argv list such as `["npm", "run", "dev"]`.
    pub fn from_argv(argv: &[String]) -> anyhow::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("command must not be empty"))?;
        if program.trim().is_empty() {
            anyhow::bail!("command program must not be blank");
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn display(&self) -> String {
        command_line(&self.program, &self.args)
    }

    pub fn default_install() -> Self {
        Self::new("npm", &["install"])
    }

    pub fn default_start() -> Self {
        Self::new("npm", &["run", "dev"])
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOrchestrator {
    install: CommandSpec,
    start: CommandSpec,
}

impl Default for ProcessOrchestrator {
    fn default() -> Self {
        Self::new(CommandSpec::default_install(), CommandSpec::default_start())
    }
}

impl ProcessOrchestrator {
    pub fn new(install: CommandSpec, start: CommandSpec) -> Self {
        Self { install, start }
    }

    pub fn install_command(&self) -> &CommandSpec {
        &self.install
    }

    pub fn start_command(&self) -> &CommandSpec {
        &self.start
    }

    pub async fn spawn_install(&self, env: &dyn Environment) -> PreviewResult<ProcessHandle> {
        info!(command = %self.install.display(), "Starting dependency install");
        env.spawn(&self.install.program, &self.install.args).await
    }

    /// Drain the install's output into `sink` and wait for it to exit.
    ///
    /// All output is delivered before this returns. A non-zero exit code is
    /// an [`PreviewError::Install`].
    pub async fn await_install(
        &self,
        mut install: ProcessHandle,
        sink: impl FnMut(String),
    ) -> PreviewResult<()> {
        let output = install.take_output();
        let pump = async move {
            if let Some(output) = output {
                pump_output_with(output, sink).await;
            }
        };
        let ((), exit) = tokio::join!(pump, install.wait());
        let exit_code = exit?;
        debug!(exit_code, "Dependency install finished");
        if exit_code != 0 {
            return Err(PreviewError::Install { exit_code });
        }
        Ok(())
    }

    /// Launch the server command. The process is not awaited.
    pub async fn spawn_server(&self, env: &dyn Environment) -> PreviewResult<ProcessHandle> {
        info!(command = %self.start.display(), "Starting dev server");
        env.spawn(&self.start.program, &self.start.args).await
    }
}
