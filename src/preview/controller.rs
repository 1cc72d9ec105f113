//! Lifecycle Controller: the state machine that owns a preview session.
//!
//! ```text
//! idle ──deploy──▶ cloning ──mounted──▶ installing ──exit 0──▶ running
//!   ▲                 │                     │                     │
//!   │                 └──────failure────────┴───▶ error ◀──crash──┘
//!   └─────────────── stop (from any state) ◀──────────────────────┘
//! ```
//!
//! Every transition happens under one lock and is published as a
//! [`Snapshot`] (watch channel + `StateChanged` event) before the lock is
//! released. The live process belongs to the current [`Stage`] and nowhere
//! else. Each deploy attempt gets a cycle number, and work from a cycle that
//! is no longer current (stopped, or replaced by a newer deploy) is
//! discarded instead of being applied.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::{OnceCell, broadcast, watch};
use tracing::{debug, info, warn};

use super::assembler::assemble;
use super::console::{Console, ConsoleSource, pump_output_with};
use super::github::HostingApi;
use super::models::{Credential, DeviceMode, LifecyclePhase, PreviewAddress, RepoRef, Snapshot};
use super::orchestrator::ProcessOrchestrator;
use super::readiness::{first_ready, preview_address};
use super::runtime::{Environment, KillSwitch, ProcessHandle, SandboxRuntime, ServerReady};
use super::selection::SelectionPolicy;
use super::ws::{PreviewEvent, broadcast_message};
use crate::errors::{PreviewError, PreviewResult};

const EVENT_CAPACITY: usize = 1024;

/// What to deploy and with which credential.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub repo: RepoRef,
    pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// A new cycle began in `cloning`.
    Started { cycle: u64 },
    /// A cycle is already in flight; nothing changed.
    Rejected { phase: LifecyclePhase },
    /// The runtime could not be provisioned earlier in this session.
    Disabled { reason: String },
}

/// Lifecycle state with the resources each state owns.
#[derive(Debug)]
enum Stage {
    Idle,
    Cloning {
        cycle: u64,
    },
    Installing {
        cycle: u64,
        install: Option<KillSwitch>,
    },
    Running {
        cycle: u64,
        server: ProcessHandle,
        preview: Option<PreviewAddress>,
    },
    Error {
        message: String,
    },
}

impl Stage {
    fn phase(&self) -> LifecyclePhase {
        match self {
            Stage::Idle => LifecyclePhase::Idle,
            Stage::Cloning { .. } => LifecyclePhase::Cloning,
            Stage::Installing { .. } => LifecyclePhase::Installing,
            Stage::Running { .. } => LifecyclePhase::Running,
            Stage::Error { .. } => LifecyclePhase::Error,
        }
    }

    /// Cycle that owns this stage, if a cycle is in flight.
    fn cycle(&self) -> Option<u64> {
        match self {
            Stage::Cloning { cycle } | Stage::Installing { cycle, .. } | Stage::Running { cycle, .. } => {
                Some(*cycle)
            }
            Stage::Idle | Stage::Error { .. } => None,
        }
    }
}

/// A process taken out of the state, to be killed after the lock is released.
enum Victim {
    Install(KillSwitch),
    Server(ProcessHandle),
}

impl Victim {
    fn from_stage(stage: Stage) -> Option<Self> {
        match stage {
            Stage::Installing {
                install: Some(switch),
                ..
            } => Some(Victim::Install(switch)),
            Stage::Running { server, .. } => Some(Victim::Server(server)),
            _ => None,
        }
    }

    fn kill(self) {
        let (what, delivered) = match self {
            Victim::Install(switch) => ("install", switch.kill()),
            Victim::Server(mut server) => ("server", server.kill()),
        };
        if delivered {
            debug!(process = what, "Kill delivered");
        } else {
            debug!(process = what, "Process had already exited");
        }
    }
}

/// Whether the state machine allows moving from `from` to `to`.
pub fn is_valid_transition(from: LifecyclePhase, to: LifecyclePhase) -> bool {
    use LifecyclePhase::*;
    matches!(
        (from, to),
        (Idle | Error, Cloning)
            | (Cloning, Installing)
            | (Installing, Running)
            | (Cloning | Installing | Running, Error)
            | (Running, Running)
            | (_, Idle)
    )
}

struct Inner {
    stage: Stage,
    last_cycle: u64,
    device_mode: DeviceMode,
    /// Set once provisioning has failed; deploys stay disabled afterwards.
    provision_failure: Option<String>,
}

impl Inner {
    fn snapshot(&self) -> Snapshot {
        let (preview, error) = match &self.stage {
            Stage::Running { preview, .. } => (preview.clone(), None),
            Stage::Error { message } => (None, Some(message.clone())),
            _ => (None, None),
        };
        Snapshot {
            state: self.stage.phase(),
            preview,
            error,
            device_mode: self.device_mode,
        }
    }

    fn is_current(&self, cycle: u64) -> bool {
        self.stage.cycle() == Some(cycle)
    }
}

struct Shared {
    hosting: Arc<dyn HostingApi>,
    runtime: Arc<dyn SandboxRuntime>,
    policy: SelectionPolicy,
    orchestrator: ProcessOrchestrator,
    environment: OnceCell<Arc<dyn Environment>>,
    /// Serializes mount and install spawn across cycles.
    workspace: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    console: Console,
    events: broadcast::Sender<String>,
    state_tx: watch::Sender<Snapshot>,
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct PreviewController {
    shared: Arc<Shared>,
}

impl PreviewController {
    pub fn new(
        hosting: Arc<dyn HostingApi>,
        runtime: Arc<dyn SandboxRuntime>,
        policy: SelectionPolicy,
        orchestrator: ProcessOrchestrator,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(Snapshot::default());
        Self {
            shared: Arc::new(Shared {
                hosting,
                runtime,
                policy,
                orchestrator,
                environment: OnceCell::new(),
                workspace: tokio::sync::Mutex::new(()),
                inner: Mutex::new(Inner {
                    stage: Stage::Idle,
                    last_cycle: 0,
                    device_mode: DeviceMode::default(),
                    provision_failure: None,
                }),
                console: Console::new(events.clone()),
                events,
                state_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<Snapshot> {
        self.shared.state_tx.subscribe()
    }

    /// JSON-encoded [`PreviewEvent`]s, in the order they happened.
    pub fn subscribe_events(&self) -> broadcast::Receiver<String> {
        self.shared.events.subscribe()
    }

    pub fn console(&self) -> &Console {
        &self.shared.console
    }

    /// Begin a deploy cycle in the background.
    ///
    /// Only accepted from `idle` or `error`. Must be called from within a
    /// Tokio runtime.
    pub fn deploy(&self, request: DeployRequest) -> DeployOutcome {
        let cycle = {
            let mut inner = self.lock();
            if let Some(reason) = &inner.provision_failure {
                return DeployOutcome::Disabled {
                    reason: reason.clone(),
                };
            }
            let phase = inner.stage.phase();
            if !phase.accepts_deploy() {
                debug!(%phase, repo = %request.repo, "Deploy rejected, cycle already in flight");
                return DeployOutcome::Rejected { phase };
            }
            inner.last_cycle += 1;
            let cycle = inner.last_cycle;
            self.shared.console.clear();
            self.set_stage(&mut inner, Stage::Cloning { cycle });
            self.shared.console.system(format!("Deploying {}", request.repo));
            cycle
        };

        info!(
            cycle,
            owner = %request.repo.owner,
            repo = %request.repo.repo,
            branch = %request.repo.branch,
            "Deploy cycle started"
        );
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(err) = controller.drive(cycle, &request).await {
                controller.fail(cycle, err);
            }
        });
        DeployOutcome::Started { cycle }
    }

    /// Return to `idle` from any state, killing whatever process the current
    /// state holds. Returns whether a process was signalled.
    pub fn stop(&self) -> bool {
        let victim = {
            let mut inner = self.lock();
            if matches!(inner.stage, Stage::Idle) {
                return false;
            }
            let previous = self.set_stage(&mut inner, Stage::Idle);
            self.shared.console.system("Preview stopped");
            Victim::from_stage(previous)
        };
        info!("Preview stopped");
        match victim {
            Some(victim) => {
                victim.kill();
                true
            }
            None => false,
        }
    }

    /// Tear the session down: kill any active process regardless of state.
    pub fn shutdown(&self) {
        let victim = {
            let mut inner = self.lock();
            let previous = self.set_stage(&mut inner, Stage::Idle);
            Victim::from_stage(previous)
        };
        if let Some(victim) = victim {
            info!("Killing preview process on shutdown");
            victim.kill();
        }
    }

    pub fn set_device_mode(&self, mode: DeviceMode) -> Snapshot {
        let mut inner = self.lock();
        inner.device_mode = mode;
        if let Stage::Running {
            preview: Some(preview),
            ..
        } = &mut inner.stage
        {
            preview.device_mode = mode;
        }
        self.publish(&inner);
        inner.snapshot()
    }

    // ── Cycle ────────────────────────────────────────────────────────

    async fn drive(&self, cycle: u64, request: &DeployRequest) -> PreviewResult<()> {
        let shared = &self.shared;
        let DeployRequest { repo, credential } = request;

        self.log(cycle, ConsoleSource::Fetch, format!("Fetching file tree for {}\n", repo));
        let entries = shared.hosting.get_tree(credential, repo).await?;
        self.log(
            cycle,
            ConsoleSource::Fetch,
            format!("Repository lists {} entries\n", entries.len()),
        );

        let assembly = assemble(
            shared.hosting.as_ref(),
            credential,
            repo,
            &entries,
            &shared.policy,
            |progress| {
                self.log(cycle, ConsoleSource::Fetch, format!("Fetching {}\n", progress.path));
            },
        )
        .await?;

        if !self.is_current(cycle) {
            debug!(cycle, "Discarding assembly from a stopped cycle");
            return Ok(());
        }
        let mut summary = format!("Fetched {} files", assembly.files_fetched);
        if assembly.capped {
            summary.push_str(&format!(" (limited to {} source files)", shared.policy.max_files));
        }
        self.log(cycle, ConsoleSource::System, format!("{}\n", summary));

        let env = self.environment().await?;
        // Held from mount until the stage owns the install; a stale cycle
        // never touches the workspace
        let workspace_guard = shared.workspace.lock().await;
        if !self.is_current(cycle) {
            debug!(cycle, "Cycle stopped before mount");
            return Ok(());
        }
        env.mount(&assembly.root).await?;
        if !self.is_current(cycle) {
            debug!(cycle, "Cycle stopped during mount");
            return Ok(());
        }

        let mut install = shared.orchestrator.spawn_install(env.as_ref()).await?;
        let install_switch = install.take_kill_switch();
        {
            let mut inner = self.lock();
            if !inner.is_current(cycle) {
                drop(inner);
                if let Some(switch) = install_switch {
                    switch.kill();
                }
                return Ok(());
            }
            self.set_stage(
                &mut inner,
                Stage::Installing {
                    cycle,
                    install: install_switch,
                },
            );
            shared.console.system(format!(
                "Installing dependencies: {}",
                shared.orchestrator.install_command().display()
            ));
        }
        drop(workspace_guard);

        let installed = shared
            .orchestrator
            .await_install(install, |text| {
                self.log(cycle, ConsoleSource::Install, text);
            })
            .await;
        if !self.is_current(cycle) {
            debug!(cycle, "Install finished after the cycle was stopped");
            return Ok(());
        }
        installed?;

        // Subscribe before spawning so the first announcement cannot be missed
        let ready_rx = env.server_ready();
        let mut server = shared.orchestrator.spawn_server(env.as_ref()).await?;
        let output = server.take_output();
        let exit = server.take_exit();
        {
            let mut inner = self.lock();
            if !inner.is_current(cycle) {
                drop(inner);
                server.kill();
                return Ok(());
            }
            self.set_stage(
                &mut inner,
                Stage::Running {
                    cycle,
                    server,
                    preview: None,
                },
            );
            shared.console.system(format!(
                "Starting dev server: {}",
                shared.orchestrator.start_command().display()
            ));
        }

        let weak = Arc::downgrade(&self.shared);
        if let Some(output) = output {
            let weak = weak.clone();
            tokio::spawn(async move {
                pump_output_with(output, |text| {
                    if let Some(controller) = PreviewController::upgrade(&weak) {
                        controller.log(cycle, ConsoleSource::Server, text);
                    }
                })
                .await;
            });
        }
        if let Some(mut exit) = exit {
            tokio::spawn(async move {
                let ready = first_ready(ready_rx);
                tokio::pin!(ready);
                let mut ready_done = false;
                let code = loop {
                    tokio::select! {
                        announced = &mut ready, if !ready_done => {
                            ready_done = true;
                            if let Some(ready) = announced
                                && let Some(controller) = PreviewController::upgrade(&weak)
                            {
                                controller.apply_ready(cycle, ready);
                            }
                        }
                        code = &mut exit => break code,
                    }
                };
                if let Ok(code) = code
                    && let Some(controller) = PreviewController::upgrade(&weak)
                {
                    controller.server_exited(cycle, code);
                }
            });
        }
        Ok(())
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// The session's environment, booted on first use.
    async fn environment(&self) -> PreviewResult<Arc<dyn Environment>> {
        let runtime = Arc::clone(&self.shared.runtime);
        self.shared
            .environment
            .get_or_try_init(|| async move { runtime.boot().await })
            .await
            .cloned()
    }

    /// First readiness notification of the cycle becomes the preview address.
    fn apply_ready(&self, cycle: u64, ready: ServerReady) -> bool {
        let mut inner = self.lock();
        let device_mode = inner.device_mode;
        let address = match &mut inner.stage {
            Stage::Running {
                cycle: current,
                preview,
                ..
            } if *current == cycle && preview.is_none() => {
                let address = preview_address(ready, device_mode);
                *preview = Some(address.clone());
                address
            }
            _ => {
                debug!(cycle, port = ready.port, "Ignoring readiness notification");
                return false;
            }
        };
        info!(cycle, url = %address.url, "Preview ready");
        self.shared
            .console
            .system(format!("Preview ready at {}", address.url));
        broadcast_message(
            &self.shared.events,
            &PreviewEvent::PreviewReady { preview: address },
        );
        self.publish(&inner);
        true
    }

    fn server_exited(&self, cycle: u64, code: i32) {
        let mut inner = self.lock();
        if !inner.is_current(cycle) {
            return;
        }
        if code == 0 {
            info!(cycle, "Dev server exited cleanly");
            self.shared.console.system("Dev server exited with code 0");
            return;
        }
        let err = PreviewError::Runtime(format!("Dev server exited with code {}", code));
        warn!(cycle, exit_code = code, "Dev server crashed");
        self.shared.console.system(format!("Error: {}", err));
        // The process is gone; dropping its handle is all that is left
        self.set_stage(&mut inner, Stage::Error { message: err.banner() });
    }

    fn fail(&self, cycle: u64, err: PreviewError) {
        let victim = {
            let mut inner = self.lock();
            if err.is_fatal() {
                inner.provision_failure = Some(err.banner());
            }
            if !inner.is_current(cycle) {
                debug!(cycle, error = %err, "Dropping failure from a stopped cycle");
                return;
            }
            warn!(cycle, error = %err, "Deploy cycle failed");
            self.shared.console.system(format!("Error: {}", err));
            if err.is_fatal() {
                self.shared
                    .console
                    .system("Deploys are disabled for the rest of this session");
            }
            let previous = self.set_stage(&mut inner, Stage::Error { message: err.banner() });
            Victim::from_stage(previous)
        };
        if let Some(victim) = victim {
            victim.kill();
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn is_current(&self, cycle: u64) -> bool {
        self.lock().is_current(cycle)
    }

    /// Append to the console on behalf of `cycle`. Dropped if the cycle is
    /// no longer current.
    fn log(&self, cycle: u64, source: ConsoleSource, text: impl Into<String>) -> bool {
        let inner = self.lock();
        if !inner.is_current(cycle) {
            return false;
        }
        self.shared.console.append(source, text).is_some()
    }

    /// Replace the stage and publish, returning the previous stage.
    fn set_stage(&self, inner: &mut Inner, next: Stage) -> Stage {
        let from = inner.stage.phase();
        let to = next.phase();
        debug_assert!(
            is_valid_transition(from, to),
            "invalid lifecycle transition {} -> {}",
            from,
            to
        );
        debug!(%from, %to, "Lifecycle transition");
        let previous = std::mem::replace(&mut inner.stage, next);
        self.publish(inner);
        previous
    }

    fn publish(&self, inner: &Inner) {
        let snapshot = inner.snapshot();
        self.shared.state_tx.send_replace(snapshot.clone());
        broadcast_message(&self.shared.events, &PreviewEvent::StateChanged { snapshot });
    }
}
