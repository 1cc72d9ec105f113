//! Host-directory runtime: each session gets a fresh directory under the
//! workspace root, commands run there as child processes, and readiness is
//! read off the server's own output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::FileNode;
use super::runtime::{Environment, ProcessControl, ProcessHandle, SandboxRuntime, ServerReady, command_line};
use crate::errors::{PreviewError, PreviewResult};

/// Longest partial line kept while scanning output for a server URL.
const MAX_SCAN_LINE: usize = 8 * 1024;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI regex"));

static LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})")
        .expect("valid URL regex")
});

static LISTENING_ON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)listening (?:on|at) (?:port\s*)?:?(\d{2,5})\b").expect("valid listen regex")
});

/// Find a "server is up" announcement in one line of output.
pub fn detect_server_ready(line: &str) -> Option<ServerReady> {
    let clean = ANSI_ESCAPE.replace_all(line, "");
    let port = LOCAL_URL
        .captures(&clean)
        .or_else(|| LISTENING_ON.captures(&clean))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|port| *port != 0)?;
    Some(ServerReady {
        port,
        url: format!("http://localhost:{}", port),
    })
}

#[derive(Debug, Clone)]
pub struct LocalRuntime {
    workspace_root: PathBuf,
    env: Vec<(String, String)>,
}

impl LocalRuntime {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            env: Vec::new(),
        }
    }

    /// Extra environment variables for every spawned command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn boot(&self) -> PreviewResult<Arc<dyn Environment>> {
        let workdir = self
            .workspace_root
            .join(format!("forge-preview-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&workdir).await.map_err(|e| {
            PreviewError::Provision(format!(
                "cannot create workspace {}: {}",
                workdir.display(),
                e
            ))
        })?;
        info!(workdir = %workdir.display(), "Booted local preview environment");
        Ok(Arc::new(LocalEnvironment::new(workdir, self.env.clone())))
    }
}

pub struct LocalEnvironment {
    workdir: PathBuf,
    env: Vec<(String, String)>,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl LocalEnvironment {
    fn new(workdir: PathBuf, env: Vec<(String, String)>) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            workdir,
            env,
            ready_tx,
        }
    }
}

impl Drop for LocalEnvironment {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
            debug!(workdir = %self.workdir.display(), error = %e, "Failed to remove preview workspace");
        }
    }
}

async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

async fn write_tree(base: &Path, root: &FileNode) -> std::io::Result<usize> {
    let mut written = 0;
    let mut stack: Vec<(PathBuf, &FileNode)> = vec![(base.to_path_buf(), root)];
    while let Some((path, node)) = stack.pop() {
        match node {
            FileNode::File { contents } => {
                tokio::fs::write(&path, contents).await?;
                written += 1;
            }
            FileNode::Directory { children } => {
                tokio::fs::create_dir_all(&path).await?;
                for (name, child) in children {
                    stack.push((path.join(name), child));
                }
            }
        }
    }
    Ok(written)
}

/// Forward raw chunks to the console channel while scanning complete lines
/// for a readiness announcement.
async fn read_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    output: mpsc::UnboundedSender<Vec<u8>>,
    ready_tx: broadcast::Sender<ServerReady>,
) {
    let mut buf = vec![0u8; 8192];
    let mut line = String::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Process output stream closed with error");
                break;
            }
        };
        let chunk = &buf[..n];
        let _ = output.send(chunk.to_vec());

        line.push_str(&String::from_utf8_lossy(chunk));
        while let Some(idx) = line.find('\n') {
            if let Some(ready) = detect_server_ready(&line[..idx]) {
                let _ = ready_tx.send(ready);
            }
            line.drain(..=idx);
        }
        if line.len() > MAX_SCAN_LINE {
            line.clear();
        }
    }
    if let Some(ready) = detect_server_ready(&line) {
        let _ = ready_tx.send(ready);
    }
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) -> bool {
    match child.id() {
        // The child leads its own process group, so this reaches the tools
        // it launched as well (npm → vite, etc.).
        Some(pid) => unsafe { libc::kill(-(pid as i32), libc::SIGKILL) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) -> bool {
    false
}

async fn supervise(mut child: tokio::process::Child, label: String, exit: tokio::sync::oneshot::Sender<i32>, kill: tokio::sync::oneshot::Receiver<()>) {
    let status = tokio::select! {
        status = child.wait() => status,
        requested = kill => {
            if requested.is_err() {
                debug!(command = %label, "Process handle dropped, terminating");
            }
            if !kill_process_group(&child)
                && let Err(e) = child.kill().await
            {
                warn!(command = %label, error = %e, "Failed to kill process");
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(command = %label, error = %e, "Failed to collect exit status");
            -1
        }
    };
    debug!(command = %label, exit_code = code, "Process exited");
    let _ = exit.send(code);
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn mount(&self, root: &FileNode) -> PreviewResult<()> {
        clear_dir(&self.workdir).await.map_err(|e| {
            PreviewError::Runtime(format!("failed to clear {}: {}", self.workdir.display(), e))
        })?;
        let written = write_tree(&self.workdir, root).await.map_err(|e| {
            PreviewError::Runtime(format!("failed to write files into {}: {}", self.workdir.display(), e))
        })?;
        debug!(workdir = %self.workdir.display(), files = written, "Mounted file tree");
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> PreviewResult<ProcessHandle> {
        let label = command_line(command, args);
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&self.workdir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| PreviewError::Runtime(format!("failed to start '{}': {}", label, e)))?;

        let (handle, control) = ProcessHandle::channel(label.clone());
        let ProcessControl { output, exit, kill } = control;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(stdout, output.clone(), self.ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(stderr, output.clone(), self.ready_tx.clone()));
        }
        drop(output);

        debug!(command = %label, pid = child.id(), "Spawned process");
        tokio::spawn(supervise(child, label, exit, kill));
        Ok(handle)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tree(files: &[(&str, &str)]) -> FileNode {
        let mut root = FileNode::empty_dir();
        for (path, contents) in files {
            root.insert(path, contents.to_string()).unwrap();
        }
        root
    }

    async fn boot(dir: &tempfile::TempDir) -> Arc<dyn Environment> {
        LocalRuntime::new(dir.path()).boot().await.unwrap()
    }

    async fn collect_output(handle: &mut ProcessHandle) -> String {
        let mut rx = handle.take_output().unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend(chunk);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn detects_vite_style_banner_with_colors() {
        let line = "  \x1b[32m➜\x1b[39m  \x1b[1mLocal\x1b[22m:   \x1b[36mhttp://localhost:\x1b[1m5173\x1b[22m/\x1b[39m";
        let ready = detect_server_ready(line).unwrap();
        assert_eq!(ready.port, 5173);
        assert_eq!(ready.url, "http://localhost:5173");
    }

    #[test]
    fn detects_plain_listening_message() {
        assert_eq!(detect_server_ready("Server listening on port 3000").unwrap().port, 3000);
        assert_eq!(detect_server_ready("listening at :8080").unwrap().port, 8080);
        assert_eq!(detect_server_ready("ready on http://0.0.0.0:4321").unwrap().port, 4321);
    }

    #[test]
    fn ignores_unrelated_output() {
        assert!(detect_server_ready("added 120 packages in 3s").is_none());
        assert!(detect_server_ready("see https://example.com:443/docs").is_none());
    }

    #[tokio::test]
    async fn boot_fails_with_provision_error_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        let err = match LocalRuntime::new(&file).boot().await {
            Ok(_) => panic!("boot should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, PreviewError::Provision(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn mount_writes_tree_and_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let env = boot(&dir).await;
        env.mount(&tree(&[("package.json", "{}"), ("src/old.js", "old")]))
            .await
            .unwrap();
        env.mount(&tree(&[("package.json", "{\"v\":2}"), ("src/new.js", "new")]))
            .await
            .unwrap();

        let workdir = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert_eq!(std::fs::read_to_string(workdir.join("package.json")).unwrap(), "{\"v\":2}");
        assert_eq!(std::fs::read_to_string(workdir.join("src/new.js")).unwrap(), "new");
        assert!(!workdir.join("src/old.js").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_streams_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let env = boot(&dir).await;
        env.mount(&tree(&[("hello.txt", "from the tree")])).await.unwrap();

        let mut handle = env
            .spawn("sh", &["-c".to_string(), "cat hello.txt; echo; echo oops >&2; exit 3".to_string()])
            .await
            .unwrap();
        let output = collect_output(&mut handle).await;
        assert!(output.contains("from the tree"));
        assert!(output.contains("oops"));
        assert_eq!(handle.wait().await.unwrap(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runtime_env_reaches_spawned_commands() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalRuntime::new(dir.path())
            .with_env("BROWSER", "none")
            .boot()
            .await
            .unwrap();
        let mut handle = env
            .spawn("sh", &["-c".to_string(), "echo \"browser=$BROWSER\"".to_string()])
            .await
            .unwrap();
        assert_eq!(collect_output(&mut handle).await, "browser=none\n");
        assert_eq!(handle.wait().await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_missing_binary_is_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = boot(&dir).await;
        let err = env
            .spawn("definitely-not-a-real-binary-4821", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::Runtime(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn server_ready_is_announced_from_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = boot(&dir).await;
        let mut ready = env.server_ready();
        let mut handle = env
            .spawn("sh", &["-c".to_string(), "echo 'Local: http://localhost:3000/'; sleep 30".to_string()])
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), ready.recv())
            .await
            .expect("readiness within 5s")
            .unwrap();
        assert_eq!(event, ServerReady { port: 3000, url: "http://localhost:3000".into() });

        assert!(handle.kill());
        let code = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("process should exit after kill")
            .unwrap();
        assert_ne!(code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_handle_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let env = boot(&dir).await;
        let mut handle = env
            .spawn("sh", &["-c".to_string(), "sleep 30".to_string()])
            .await
            .unwrap();
        let exit = handle.take_exit().unwrap();
        drop(handle);
        let code = tokio::time::timeout(Duration::from_secs(5), exit)
            .await
            .expect("process should exit once its handle is dropped")
            .unwrap();
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn dropping_environment_removes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let env = boot(&dir).await;
        env.mount(&tree(&[("a.txt", "a")])).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        drop(env);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
