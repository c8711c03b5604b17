//! In-sandbox execution agent.
//!
//! Runs as PID 1 inside each sandbox and serves a small HTTP API on port
//! 2024. Reachability is the security boundary: the port is only exposed on
//! the container's own endpoint, so the API carries no authentication.

use std::convert::Infallible;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::pip;
use crate::state::{ExecResult, StreamChunk};

const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;
const PIP_INSTALL_TIMEOUT_SECS: u64 = 120;
/// Grace window between SIGTERM and SIGKILL when a timeout fires.
const TERM_GRACE_SECS: u64 = 2;
/// Stream chunks are flushed at most this many bytes at a time.
const STREAM_CHUNK_BYTES: usize = 4096;

/// Filesystem roots the agent serves. Fixed in production; injectable so
/// file semantics are testable outside a container.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Default working directory and root for relative paths.
    pub workspace: PathBuf,
    /// Root of the user-data mount; `<user_data>/outputs` is writable.
    pub user_data: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("/workspace"),
            user_data: PathBuf::from("/mnt/user-data"),
        }
    }
}

impl AgentConfig {
    fn outputs(&self) -> PathBuf {
        self.user_data.join("outputs")
    }

    fn write_roots(&self) -> Vec<PathBuf> {
        vec![self.workspace.clone(), self.outputs()]
    }

    fn read_roots(&self) -> Vec<PathBuf> {
        vec![self.workspace.clone(), self.user_data.clone()]
    }
}

#[derive(Deserialize)]
struct ExecRequest {
    command: String,
    workdir: Option<String>,
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct ExecStreamRequest {
    command: String,
    workdir: Option<String>,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    path: String,
    content: String,
    mode: Option<String>,
}

#[derive(Deserialize)]
struct ReadFileRequest {
    path: String,
}

#[derive(Serialize)]
struct FileResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PipInstallRequest {
    packages: Vec<String>,
}

/// Serve the agent API until the process is killed.
pub async fn run_server(addr: &str, config: AgentConfig) -> anyhow::Result<()> {
    tokio::spawn(zombie_reaper());

    let app = router(config);
    let listener = TcpListener::bind(addr).await?;
    info!("agent listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

pub(crate) fn router(config: AgentConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/exec", post(exec))
        .route("/exec_stream", post(exec_stream))
        .route("/write_file", post(write_file))
        .route("/read_file", post(read_file))
        .route("/pip_install", post(pip_install))
        .with_state(config)
}

/// PID-1 duty: adopt and reap orphaned children so the sandbox never
/// accumulates zombies.
async fn zombie_reaper() {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tick.tick().await;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

async fn exec(State(config): State<AgentConfig>, Json(req): Json<ExecRequest>) -> Json<ExecResult> {
    let workdir = req
        .workdir
        .unwrap_or_else(|| config.workspace.display().to_string());
    let timeout = req.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
    Json(exec_command(&req.command, &workdir, timeout).await)
}

/// Run a command under `sh -c` with a wall-clock deadline.
///
/// The child gets its own process group so the timeout kill reaches
/// descendants, not just the shell.
pub async fn exec_command(command: &str, workdir: &str, timeout_secs: u64) -> ExecResult {
    let mut child = match spawn_shell(command, workdir) {
        Ok(child) => child,
        Err(e) => return ExecResult::failure(format!("spawn failed: {e}")),
    };
    let mut guard = GroupGuard::new(&child);

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_task = tokio::spawn(read_to_end(stdout));
    let mut stderr_task = tokio::spawn(read_to_end(stderr));

    // The deadline covers draining the pipes too: a descendant that
    // outlives the shell keeps them open, and must count as a timeout.
    let finished = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        let status = child.wait().await;
        let stdout = (&mut stdout_task).await.unwrap_or_default();
        let stderr = (&mut stderr_task).await.unwrap_or_default();
        (status, stdout, stderr)
    })
    .await;

    match finished {
        Ok((Ok(status), stdout, stderr)) => {
            guard.disarm();
            ExecResult {
                exit_code: exit_code_of(status),
                stdout,
                stderr,
                timed_out: false,
            }
        }
        Ok((Err(e), _, _)) => ExecResult::failure(format!("wait failed: {e}")),
        Err(_) => {
            terminate_group(&mut child).await;
            guard.disarm();
            // The group is dead, so the pipes hit EOF promptly.
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            ExecResult {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: true,
            }
        }
    }
}

/// Kills the process group on drop unless disarmed. A request future
/// dropped by a client disconnect takes the whole group down with it, not
/// just the shell.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().map(|pid| pid as i32),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            unsafe { libc::kill(-pgid, libc::SIGKILL) };
        }
    }
}

fn spawn_shell(command: &str, workdir: &str) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd.spawn()
}

async fn read_to_end(mut stream: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// SIGTERM the whole group, give it a grace window, then SIGKILL.
async fn terminate_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        let _ = child.wait().await;
        return;
    };
    let pgid = pid as i32;

    // pgid == pid because the child was spawned with process_group(0).
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == -1 {
        let _ = child.wait().await;
        return;
    }

    if tokio::time::timeout(Duration::from_secs(TERM_GRACE_SECS), child.wait())
        .await
        .is_ok()
    {
        return;
    }

    warn!(pgid, "process group ignored SIGTERM, escalating");
    unsafe { libc::kill(-pgid, libc::SIGKILL) };
    let _ = child.wait().await;
}

async fn exec_stream(
    State(config): State<AgentConfig>,
    Json(req): Json<ExecStreamRequest>,
) -> axum::response::Response {
    let workdir = req
        .workdir
        .unwrap_or_else(|| config.workspace.display().to_string());

    let (tx, rx) = mpsc::channel::<StreamChunk>(32);
    tokio::spawn(stream_command(req.command, workdir, tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(|chunk| {
        let mut line = serde_json::to_string(&chunk).unwrap_or_default();
        line.push('\n');
        Ok::<_, Infallible>(line)
    }));

    axum::response::Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(body)
        .unwrap_or_else(|_| axum::response::Response::new(Body::empty()))
}

/// Pump stdout/stderr chunks into the channel, then the terminal exit
/// chunk. The exit chunk is sent strictly after both pipes reach EOF.
async fn stream_command(command: String, workdir: String, tx: mpsc::Sender<StreamChunk>) {
    let mut child = match spawn_shell(&command, &workdir) {
        Ok(child) => child,
        Err(e) => {
            let _ = tx
                .send(StreamChunk::data("stderr", format!("spawn failed: {e}\n")))
                .await;
            let _ = tx.send(StreamChunk::exit(-1)).await;
            return;
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let out_task = tokio::spawn(pump_chunks(stdout, "stdout", tx.clone()));
    let err_task = tokio::spawn(pump_chunks(stderr, "stderr", tx.clone()));
    let out_eof = out_task.await.unwrap_or(false);
    let err_eof = err_task.await.unwrap_or(false);

    if !out_eof || !err_eof {
        // Client went away mid-stream; take the group down and skip the
        // exit chunk nobody is listening for.
        terminate_group(&mut child).await;
        return;
    }

    let exit_code = match child.wait().await {
        Ok(status) => exit_code_of(status),
        Err(_) => -1,
    };
    let _ = tx.send(StreamChunk::exit(exit_code)).await;
}

/// Returns true when the stream reached EOF, false when the receiver was
/// dropped first.
async fn pump_chunks(
    mut stream: impl tokio::io::AsyncRead + Unpin,
    channel: &'static str,
    tx: mpsc::Sender<StreamChunk>,
) -> bool {
    let mut buf = vec![0u8; STREAM_CHUNK_BYTES];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return true,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(StreamChunk::data(channel, data)).await.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn write_file(
    State(config): State<AgentConfig>,
    Json(req): Json<WriteFileRequest>,
) -> Json<FileResponse> {
    let append = req.mode.as_deref() == Some("a");
    Json(match write_file_at(&config, &req.path, &req.content, append) {
        Ok(()) => FileResponse {
            success: true,
            content: None,
            error: None,
        },
        Err(e) => FileResponse {
            success: false,
            content: None,
            error: Some(e),
        },
    })
}

async fn read_file(
    State(config): State<AgentConfig>,
    Json(req): Json<ReadFileRequest>,
) -> Json<FileResponse> {
    Json(match read_file_at(&config, &req.path) {
        Ok(content) => FileResponse {
            success: true,
            content: Some(content),
            error: None,
        },
        Err(e) => FileResponse {
            success: false,
            content: None,
            error: Some(e),
        },
    })
}

async fn pip_install(
    State(config): State<AgentConfig>,
    Json(req): Json<PipInstallRequest>,
) -> Json<ExecResult> {
    if let Err(e) = pip::validate_packages(&req.packages) {
        return Json(ExecResult::failure(e));
    }
    let command = pip::install_command(&req.packages);
    let workdir = config.workspace.display().to_string();
    Json(exec_command(&command, &workdir, PIP_INSTALL_TIMEOUT_SECS).await)
}

pub fn write_file_at(
    config: &AgentConfig,
    path: &str,
    content: &str,
    append: bool,
) -> Result<(), String> {
    let target = resolve_path(&config.workspace, path);
    confine(&target, &config.write_roots())?;

    // Symlinks resolve here; re-check the real location before touching
    // the filesystem. The file (or its directories) may not exist yet, so
    // the longest existing prefix is resolved and the rest kept verbatim.
    let real = resolve_existing_prefix(&target);
    confine(&real, &config.write_roots())?;

    if let Some(parent) = real.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
    }

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&real)
        .map_err(|e| format!("open {}: {e}", target.display()))?;
    file.write_all(content.as_bytes())
        .map_err(|e| format!("write {}: {e}", target.display()))?;
    Ok(())
}

pub fn read_file_at(config: &AgentConfig, path: &str) -> Result<String, String> {
    let target = resolve_path(&config.workspace, path);
    confine(&target, &config.read_roots())?;

    // Symlinks resolve here; re-check the real location before reading.
    let real = target
        .canonicalize()
        .map_err(|e| format!("read {}: {e}", target.display()))?;
    confine(&real, &config.read_roots())?;

    std::fs::read_to_string(&real).map_err(|e| format!("read {}: {e}", target.display()))
}

/// Absolute iff the path starts with the root separator, else relative to
/// the workspace. `.` and `..` components are folded out before the
/// confinement check.
fn resolve_path(workspace: &Path, path: &str) -> PathBuf {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        workspace.join(path)
    };
    normalize(&joined)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve symlinks in the longest existing prefix of `path`; missing
/// trailing components are kept as-is (they are already lexically
/// normalized and cannot be links).
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut prefix = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match prefix.canonicalize() {
            Ok(real) => {
                let mut out = real;
                for part in suffix.iter().rev() {
                    out.push(part);
                }
                return out;
            }
            Err(_) => match (prefix.parent(), prefix.file_name()) {
                (Some(parent), Some(name)) => {
                    suffix.push(name.to_os_string());
                    prefix = parent.to_path_buf();
                }
                _ => return path.to_path_buf(),
            },
        }
    }
}

fn confine(path: &Path, roots: &[PathBuf]) -> Result<(), String> {
    if roots.iter().any(|root| path.starts_with(root)) {
        return Ok(());
    }
    Err(format!("path not allowed: {}", path.display()))
}
