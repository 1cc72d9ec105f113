//! Scripted doubles for the hosting API and the sandboxed runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast, watch};

use super::github::HostingApi;
use super::models::{Credential, FileNode, RepoRef, Snapshot, TreeEntry};
use super::runtime::{Environment, ProcessControl, ProcessHandle, SandboxRuntime, ServerReady, command_line};
use crate::errors::{PreviewError, PreviewResult};

#[derive(Default)]
pub struct ScriptedHost {
    entries: Vec<TreeEntry>,
    /// Trees served by the second, third, ... `get_tree` call. The last
    /// one repeats.
    later: Vec<Vec<TreeEntry>>,
    blobs: HashMap<String, String>,
    tree_error: Mutex<Option<PreviewError>>,
    gate: Option<Arc<Notify>>,
    pub tree_calls: AtomicUsize,
}

impl ScriptedHost {
    /// A host whose tree is `files`, with each path's blob being `contents`.
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let mut host = Self::default();
        host.entries = host.add_blobs(files);
        host
    }

    /// Serve `files` from the next `get_tree` call onwards.
    pub fn then_files(mut self, files: &[(&str, &str)]) -> Self {
        let entries = self.add_blobs(files);
        self.later.push(entries);
        self
    }

    fn add_blobs(&mut self, files: &[(&str, &str)]) -> Vec<TreeEntry> {
        let offset = self.blobs.len();
        files
            .iter()
            .enumerate()
            .map(|(i, (path, contents))| {
                let sha = format!("sha-{}", offset + i);
                self.blobs.insert(sha.clone(), contents.to_string());
                TreeEntry::blob(*path, sha)
            })
            .collect()
    }

    /// A minimal installable project.
    pub fn node_app() -> Self {
        Self::with_files(&[
            ("package.json", r#"{"scripts":{"dev":"vite"}}"#),
            ("src/index.js", "console.log('hi')"),
        ])
    }

    pub fn failing_tree(self, err: PreviewError) -> Self {
        *self.tree_error.lock().unwrap() = Some(err);
        self
    }

    /// Hold `get_tree` until the returned `Notify` is signalled.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }
}

#[async_trait]
impl HostingApi for ScriptedHost {
    async fn get_tree(&self, _: &Credential, _: &RepoRef) -> PreviewResult<Vec<TreeEntry>> {
        let call = self.tree_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(err) = self.tree_error.lock().unwrap().take() {
            return Err(err);
        }
        match call.checked_sub(1) {
            Some(i) if !self.later.is_empty() => Ok(self.later[i.min(self.later.len() - 1)].clone()),
            _ => Ok(self.entries.clone()),
        }
    }

    async fn get_blob(&self, _: &Credential, _: &RepoRef, sha: &str) -> PreviewResult<String> {
        self.blobs
            .get(sha)
            .cloned()
            .ok_or_else(|| PreviewError::fetch(format!("blob {}", sha), "HTTP 404: Not Found"))
    }
}

/// What a spawned process does.
#[derive(Debug, Clone)]
pub struct Script {
    pub output: Vec<String>,
    /// `None` keeps the process alive until it is killed.
    pub exit: Option<i32>,
}

impl Script {
    pub fn exits(code: i32, output: &[&str]) -> Self {
        Self {
            output: output.iter().map(|s| s.to_string()).collect(),
            exit: Some(code),
        }
    }

    pub fn long_running(output: &[&str]) -> Self {
        Self {
            output: output.iter().map(|s| s.to_string()).collect(),
            exit: None,
        }
    }
}

pub struct ScriptedEnv {
    scripts: Mutex<VecDeque<Script>>,
    pub spawned: Mutex<Vec<String>>,
    pub mounts: Mutex<Vec<FileNode>>,
    /// Mounts begun, counted before any delay.
    pub mount_starts: AtomicUsize,
    mount_delay: Mutex<Option<Duration>>,
    /// Explicit kills received.
    pub kills: AtomicUsize,
    /// Processes terminated because their handle was dropped.
    pub drops: AtomicUsize,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl ScriptedEnv {
    pub fn new(scripts: Vec<Script>) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            scripts: Mutex::new(scripts.into()),
            spawned: Mutex::new(Vec::new()),
            mounts: Mutex::new(Vec::new()),
            mount_starts: AtomicUsize::new(0),
            mount_delay: Mutex::new(None),
            kills: AtomicUsize::new(0),
            drops: AtomicUsize::new(0),
            ready_tx,
        }
    }

    /// Simulate the runtime noticing a bound port.
    pub fn announce(&self, port: u16, url: &str) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: url.to_string(),
        });
    }

    /// Make the next mount take `delay` before it lands.
    pub fn delay_next_mount(&self, delay: Duration) {
        *self.mount_delay.lock().unwrap() = Some(delay);
    }

    pub fn mount_starts(&self) -> usize {
        self.mount_starts.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Environment for Arc<ScriptedEnv> {
    async fn mount(&self, root: &FileNode) -> PreviewResult<()> {
        self.mount_starts.fetch_add(1, Ordering::SeqCst);
        let delay = self.mount_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.mounts.lock().unwrap().push(root.clone());
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> PreviewResult<ProcessHandle> {
        let label = command_line(command, args);
        self.spawned.lock().unwrap().push(label.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::long_running(&[]));

        let (handle, control) = ProcessHandle::channel(label);
        let ProcessControl { output, exit, kill } = control;
        for chunk in &script.output {
            let _ = output.send(chunk.clone().into_bytes());
        }
        match script.exit {
            Some(code) => {
                drop(output);
                let _ = exit.send(code);
            }
            None => {
                let env = Arc::clone(self);
                tokio::spawn(async move {
                    match kill.await {
                        Ok(()) => env.kills.fetch_add(1, Ordering::SeqCst),
                        Err(_) => env.drops.fetch_add(1, Ordering::SeqCst),
                    };
                    drop(output);
                    let _ = exit.send(137);
                });
            }
        }
        Ok(handle)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

pub struct ScriptedRuntime {
    pub env: Arc<ScriptedEnv>,
    boot_error: Mutex<Option<String>>,
    pub boots: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            env: Arc::new(ScriptedEnv::new(scripts)),
            boot_error: Mutex::new(None),
            boots: AtomicUsize::new(0),
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        let runtime = Self::new(Vec::new());
        *runtime.boot_error.lock().unwrap() = Some(reason.to_string());
        runtime
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    async fn boot(&self) -> PreviewResult<Arc<dyn Environment>> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.boot_error.lock().unwrap().clone() {
            return Err(PreviewError::Provision(reason));
        }
        Ok(Arc::new(Arc::clone(&self.env)))
    }
}

/// Wait (bounded) until the published snapshot satisfies `pred`.
pub async fn wait_for(
    rx: &mut watch::Receiver<Snapshot>,
    pred: impl FnMut(&Snapshot) -> bool,
) -> Snapshot {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for lifecycle state")
        .expect("controller dropped")
        .clone()
}

/// Wait (bounded) until `pred` holds, polling.
pub async fn eventually(mut pred: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
