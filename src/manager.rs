//! Sandbox manager: owns the session registry and the lifecycle of every
//! isolated environment.
//!
//! Locking discipline: the registry mutex is taken only to mutate or
//! snapshot the map. It is never held across a container-runtime or agent
//! call; callers take the lock, clone what they need, release, then do I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::SandboxError;
use crate::pip;
use crate::state::{
    default_allowed_hosts, new_registry, unix_now, ExecResult, Registry, Session, StreamChunk,
};
use crate::token::TokenService;

/// Label marking containers owned by this service; orphan recovery keys
/// off it.
const CONTAINER_MARKER: &str = "agentcell";
/// Port the in-sandbox agent listens on.
const AGENT_PORT: &str = "2024/tcp";

const STARTUP_DEADLINE: Duration = Duration::from_secs(30);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Headroom on top of the in-sandbox timeout so the agent can report its
/// own timeout before ours fires.
const EXEC_DEADLINE_SLACK_SECS: u64 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);
const REAPER_PERIOD: Duration = Duration::from_secs(60);
const PIP_INSTALL_TIMEOUT_SECS: u64 = 120;

const MEMORY_LIMIT_BYTES: i64 = 4 * 1024 * 1024 * 1024;
const NANO_CPUS: i64 = 4_000_000_000;

pub struct SandboxManager {
    config: Config,
    docker: Docker,
    registry: Registry,
    tokens: Arc<TokenService>,
    http: reqwest::Client,
    reaper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SandboxManager {
    pub fn new(config: Config) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;

        let secret = match &config.signing_key {
            Some(key) => key.clone(),
            None => {
                warn!("no SIGNING_KEY configured; generated one, so an out-of-process proxy cannot verify our tokens");
                TokenService::generate_secret()
            }
        };
        let tokens = Arc::new(TokenService::new(&secret));

        if let Some(storage) = &config.storage_path {
            std::fs::create_dir_all(storage)
                .map_err(|e| SandboxError::Runtime(format!("storage path: {e}")))?;
            info!("tenant storage enabled at {}", storage.display());
        }

        // Agent traffic goes straight to the published port; it must not
        // be routed through any ambient proxy configuration.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| SandboxError::Runtime(format!("http client: {e}")))?;

        Ok(Self {
            config,
            docker,
            registry: new_registry(),
            tokens,
            http,
            reaper: std::sync::Mutex::new(None),
        })
    }

    /// The token verifier sharing this manager's secret, for running the
    /// egress proxy in-process.
    pub fn token_service(&self) -> Arc<TokenService> {
        self.tokens.clone()
    }

    /// Reconcile leftover containers and start the idle reaper.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.recover_orphans().await {
            warn!("orphan recovery failed: {e}");
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_PERIOD);
            tick.tick().await; // immediate first tick is a no-op
            loop {
                tick.tick().await;
                manager.reap_idle().await;
            }
        });
        *self.reaper.lock().unwrap() = Some(handle);
        info!("sandbox manager started");
    }

    /// Destroy every live session and stop the reaper.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }
        let ids: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        for id in ids {
            self.destroy_session(&id).await;
        }
        info!("sandbox manager stopped");
    }

    /// Remove containers carrying our marker that have no registry entry.
    /// The registry is not persisted, so after a restart every labeled
    /// leftover is an orphan.
    async fn recover_orphans(&self) -> Result<(), SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{CONTAINER_MARKER}=true")]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let known: Vec<String> = {
            let registry = self.registry.lock().await;
            registry.values().map(|s| s.container_id.clone()).collect()
        };

        for container in containers {
            let Some(id) = container.id else { continue };
            if known.contains(&id) {
                continue;
            }
            info!(container = %short_id(&id), "removing orphaned sandbox");
            self.remove_container(&id).await;
        }
        Ok(())
    }

    pub async fn create_session(
        &self,
        session_id: Option<String>,
        tenant_id: Option<String>,
        allowed_hosts: Option<Vec<String>>,
    ) -> Result<Session, SandboxError> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Creating an id that already exists returns the live session.
        {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry.get_mut(&session_id) {
                existing.last_activity = unix_now();
                return Ok(existing.clone());
            }
        }

        let hosts = effective_hosts(allowed_hosts);
        let token = self
            .tokens
            .issue(&session_id, &hosts, self.config.session_timeout_secs)
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;

        let tenant_storage = match (&tenant_id, &self.config.storage_path) {
            (Some(tenant), Some(root)) => Some(ensure_tenant_storage(root, tenant)?),
            _ => None,
        };
        let workspace_path = tenant_storage
            .as_ref()
            .map(|dir| dir.join("workspace").display().to_string())
            .unwrap_or_else(|| "/workspace".to_string());

        let container_id = self
            .create_container(&session_id, &token, tenant_storage.as_deref(), &hosts)
            .await?;

        let (agent_host, agent_port) = match self.container_agent_addr(&container_id).await {
            Ok(addr) => addr,
            Err(e) => {
                self.remove_container(&container_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.wait_for_agent(&agent_host, agent_port).await {
            self.remove_container(&container_id).await;
            return Err(e);
        }

        let now = unix_now();
        let session = Session {
            session_id: session_id.clone(),
            tenant_id: tenant_id.clone(),
            container_id: container_id.clone(),
            agent_host,
            agent_port,
            allowed_hosts: hosts.clone(),
            workspace_path,
            created_at: now,
            last_activity: now,
        };

        {
            let mut registry = self.registry.lock().await;
            if let Some(existing) = registry.get(&session_id) {
                // Lost a create race on the same id; ours is surplus.
                let existing = existing.clone();
                drop(registry);
                self.remove_container(&container_id).await;
                return Ok(existing);
            }
            registry.insert(session_id.clone(), session.clone());
        }

        info!(
            session = %session_id,
            container = %short_id(&container_id),
            tenant = tenant_id.as_deref().unwrap_or("-"),
            hosts = hosts.len(),
            "created session"
        );
        Ok(session)
    }

    async fn create_container(
        &self,
        session_id: &str,
        token: &str,
        tenant_storage: Option<&std::path::Path>,
        allowed_hosts: &[String],
    ) -> Result<String, SandboxError> {
        // Caller-supplied ids can hold anything; the container name cannot.
        let short: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        let name = format!("cell-{short}");

        let mut env = vec![format!("SANDBOX_SESSION_TOKEN={token}")];
        if let Some(proxy_host) = &self.config.proxy_host {
            if !allowed_hosts.is_empty() {
                // Token rides in the URL userinfo so stock clients (curl,
                // pip) authenticate from the env var alone.
                let proxy_url =
                    format!("http://sandbox:{token}@{proxy_host}:{}", self.config.proxy_port);
                for var in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
                    env.push(format!("{var}={proxy_url}"));
                }
            }
        }

        let binds = tenant_storage.map(|dir| {
            vec![
                format!("{}:/workspace:rw", dir.join("workspace").display()),
                format!(
                    "{}:/mnt/user-data/outputs:rw",
                    dir.join("outputs").display()
                ),
            ]
        });

        let mut labels = HashMap::new();
        labels.insert(CONTAINER_MARKER.to_string(), "true".to_string());
        labels.insert("session-id".to_string(), session_id.to_string());

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(AGENT_PORT.to_string(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            AGENT_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None, // ephemeral
            }]),
        );

        let host_config = HostConfig {
            binds,
            memory: Some(MEMORY_LIMIT_BYTES),
            nano_cpus: Some(NANO_CPUS),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            runtime: Some(self.config.runtime.clone()),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.config.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::SandboxStartup(format!("create container: {e}")))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&created.id).await;
            return Err(SandboxError::SandboxStartup(format!("start container: {e}")));
        }

        Ok(created.id)
    }

    /// Host address where the container's agent port is reachable:
    /// the published host port, falling back to the container IP.
    async fn container_agent_addr(
        &self,
        container_id: &str,
    ) -> Result<(String, u16), SandboxError> {
        let inspect = self.docker.inspect_container(container_id, None).await?;
        let settings = inspect
            .network_settings
            .ok_or_else(|| SandboxError::SandboxStartup("container has no network".into()))?;

        if let Some(bindings) = settings.ports.as_ref().and_then(|p| p.get(AGENT_PORT)) {
            if let Some(binding) = bindings.as_ref().and_then(|b| b.first()) {
                if let Some(port) = binding.host_port.as_ref().and_then(|p| p.parse().ok()) {
                    return Ok(("127.0.0.1".to_string(), port));
                }
            }
        }

        if let Some(networks) = settings.networks {
            for network in networks.values() {
                if let Some(ip) = &network.ip_address {
                    if !ip.is_empty() {
                        return Ok((ip.clone(), 2024));
                    }
                }
            }
        }

        Err(SandboxError::SandboxStartup(
            "container has no reachable agent address".into(),
        ))
    }

    async fn wait_for_agent(&self, host: &str, port: u16) -> Result<(), SandboxError> {
        let url = format!("http://{host}:{port}/health");
        let deadline = tokio::time::Instant::now() + STARTUP_DEADLINE;

        while tokio::time::Instant::now() < deadline {
            let probe = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(1))
                .send()
                .await;
            if let Ok(response) = probe {
                if response.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        Err(SandboxError::SandboxStartup(format!(
            "agent not ready within {}s",
            STARTUP_DEADLINE.as_secs()
        )))
    }

    pub async fn destroy_session(&self, session_id: &str) -> bool {
        let session = self.registry.lock().await.remove(session_id);
        let Some(session) = session else {
            return false;
        };
        self.remove_container(&session.container_id).await;
        info!(session = %session_id, "destroyed session");
        true
    }

    /// Force-remove, tolerating a container that is already gone.
    async fn remove_container(&self, container_id: &str) {
        let result = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => error!(container = %short_id(container_id), "remove failed: {e}"),
        }
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let registry = self.registry.lock().await;
        let mut sessions: Vec<Session> = registry.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        sessions
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        let mut registry = self.registry.lock().await;
        let session = registry.get_mut(session_id)?;
        session.last_activity = unix_now();
        Some(session.clone())
    }

    /// Snapshot a session without refreshing activity; used by dispatch
    /// paths that touch on success instead.
    async fn lookup(&self, session_id: &str) -> Result<Session, SandboxError> {
        self.registry
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))
    }

    async fn touch(&self, session_id: &str) {
        if let Some(session) = self.registry.lock().await.get_mut(session_id) {
            session.last_activity = unix_now();
        }
    }

    pub async fn exec(
        &self,
        session_id: &str,
        command: &str,
        timeout_secs: u64,
        workdir: &str,
    ) -> Result<ExecResult, SandboxError> {
        let session = self.lookup(session_id).await?;

        let body = serde_json::json!({
            "command": command,
            "workdir": workdir,
            "timeout": timeout_secs,
        });
        let url = format!("{}/exec", session.agent_url());
        let deadline = Duration::from_secs(timeout_secs + EXEC_DEADLINE_SLACK_SECS);

        let response = self.post_with_retry(&url, &body, deadline).await?;
        let result: ExecResult = response
            .json()
            .await
            .map_err(|e| SandboxError::AgentUnreachable(format!("bad agent response: {e}")))?;

        self.touch(session_id).await;
        Ok(result)
    }

    /// One retry on transport errors; deadline errors surface as such.
    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<reqwest::Response, SandboxError> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.http.post(url).json(body).timeout(deadline).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => {
                    return Err(SandboxError::Deadline(format!("agent call: {e}")));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(SandboxError::AgentUnreachable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Relay the agent's chunk stream. The returned stream always ends
    /// with an exit chunk; if the agent connection drops first, a
    /// sentinel exit (code -1) marks the interrupted execution.
    pub async fn exec_stream(
        &self,
        session_id: &str,
        command: &str,
        workdir: &str,
    ) -> Result<ReceiverStream<StreamChunk>, SandboxError> {
        let session = self.lookup(session_id).await?;

        let body = serde_json::json!({
            "command": command,
            "workdir": workdir,
        });
        let url = format!("{}/exec_stream", session.agent_url());

        let mut last_err = None;
        let mut response = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) => {
                    response = Some(resp);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let response = response.ok_or_else(|| {
            SandboxError::AgentUnreachable(last_err.map(|e| e.to_string()).unwrap_or_default())
        })?;

        self.touch(session_id).await;

        let (tx, rx) = mpsc::channel::<StreamChunk>(32);
        tokio::spawn(relay_chunks(response, tx));
        Ok(ReceiverStream::new(rx))
    }

    pub async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
        mode: &str,
    ) -> Result<(), SandboxError> {
        let session = self.lookup(session_id).await?;

        let body = serde_json::json!({
            "path": path,
            "content": content,
            "mode": mode,
        });
        let url = format!("{}/write_file", session.agent_url());
        let response = self
            .post_with_retry(&url, &body, Duration::from_secs(30))
            .await?;

        let result: FileOpResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::AgentUnreachable(format!("bad agent response: {e}")))?;
        if !result.success {
            return Err(SandboxError::File(
                result.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        self.touch(session_id).await;
        Ok(())
    }

    pub async fn read_file(
        &self,
        session_id: &str,
        path: &str,
    ) -> Result<String, SandboxError> {
        let session = self.lookup(session_id).await?;

        let body = serde_json::json!({ "path": path });
        let url = format!("{}/read_file", session.agent_url());
        let response = self
            .post_with_retry(&url, &body, Duration::from_secs(30))
            .await?;

        let result: FileOpResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::AgentUnreachable(format!("bad agent response: {e}")))?;
        if !result.success {
            return Err(SandboxError::File(
                result.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        self.touch(session_id).await;
        Ok(result.content.unwrap_or_default())
    }

    /// Install Python packages. Rejected before dispatch when the session
    /// allowlist cannot reach PyPI, or when a specifier fails validation.
    pub async fn pip_install(
        &self,
        session_id: &str,
        packages: &[String],
    ) -> Result<ExecResult, SandboxError> {
        let session = self.lookup(session_id).await?;

        if !pip::pip_hosts_allowed(&session.allowed_hosts) {
            return Ok(ExecResult::failure(
                "pip install requires pypi.org and files.pythonhosted.org in allowed_hosts",
            ));
        }
        if let Err(e) = pip::validate_packages(packages) {
            return Ok(ExecResult::failure(e));
        }

        let command = pip::install_command(packages);
        info!(session = %session_id, count = packages.len(), "installing packages");
        self.exec(session_id, &command, PIP_INSTALL_TIMEOUT_SECS, "/workspace")
            .await
    }

    /// Destroy sessions idle past the TTL, stalest first.
    async fn reap_idle(&self) {
        let expired = {
            let registry = self.registry.lock().await;
            select_expired(&registry, self.config.session_timeout_secs, unix_now())
        };
        for session_id in expired {
            info!(session = %session_id, "reaping idle session");
            self.destroy_session(&session_id).await;
        }
    }
}

#[derive(serde::Deserialize)]
struct FileOpResponse {
    success: bool,
    content: Option<String>,
    error: Option<String>,
}

/// Empty or absent allowlists select the default; the wire format cannot
/// distinguish the two. "No network" is expressed with a non-routable
/// sentinel host.
fn effective_hosts(allowed_hosts: Option<Vec<String>>) -> Vec<String> {
    match allowed_hosts {
        Some(hosts) if !hosts.is_empty() => hosts,
        _ => default_allowed_hosts(),
    }
}

fn ensure_tenant_storage(
    root: &std::path::Path,
    tenant_id: &str,
) -> Result<std::path::PathBuf, SandboxError> {
    let tenant_dir = root.join(tenant_id);
    for sub in ["workspace", "outputs"] {
        std::fs::create_dir_all(tenant_dir.join(sub))
            .map_err(|e| SandboxError::Runtime(format!("tenant storage: {e}")))?;
    }
    Ok(tenant_dir)
}

/// Session ids idle past the TTL, stalest first.
fn select_expired(
    sessions: &HashMap<String, Session>,
    ttl_secs: u64,
    now: f64,
) -> Vec<String> {
    let mut expired: Vec<(&String, f64)> = sessions
        .iter()
        .filter(|(_, s)| now - s.last_activity > ttl_secs as f64)
        .map(|(id, s)| (id, s.last_activity))
        .collect();
    expired.sort_by(|a, b| a.1.total_cmp(&b.1));
    expired.into_iter().map(|(id, _)| id.clone()).collect()
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}

/// Decode the agent's JSON-lines chunk stream, guaranteeing a terminal
/// exit chunk on the way out.
async fn relay_chunks(response: reqwest::Response, tx: mpsc::Sender<StreamChunk>) {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut saw_exit = false;

    'outer: while let Some(next) = stream.next().await {
        let Ok(bytes) = next else { break };
        buf.extend_from_slice(&bytes);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let Ok(chunk) = serde_json::from_slice::<StreamChunk>(&line) else {
                continue;
            };
            let is_exit = chunk.is_exit();
            if tx.send(chunk).await.is_err() {
                // Caller dropped the stream; stop pulling from the agent.
                return;
            }
            if is_exit {
                saw_exit = true;
                break 'outer;
            }
        }
    }

    if !saw_exit {
        let _ = tx.send(StreamChunk::exit(-1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{self, AgentConfig};
    use crate::state::DEFAULT_ALLOWED_HOSTS;

    fn test_session(id: &str, last_activity: f64) -> Session {
        Session {
            session_id: id.to_string(),
            tenant_id: None,
            container_id: format!("container-{id}"),
            agent_host: "127.0.0.1".to_string(),
            agent_port: 2024,
            allowed_hosts: default_allowed_hosts(),
            workspace_path: "/workspace".to_string(),
            created_at: last_activity,
            last_activity,
        }
    }

    #[test]
    fn empty_or_absent_allowlist_selects_default() {
        assert_eq!(effective_hosts(None), default_allowed_hosts());
        assert_eq!(effective_hosts(Some(vec![])), default_allowed_hosts());
        let custom = vec!["example.com".to_string()];
        assert_eq!(effective_hosts(Some(custom.clone())), custom);
    }

    #[test]
    fn default_allowlist_is_the_documented_set() {
        assert!(DEFAULT_ALLOWED_HOSTS.contains(&"registry.npmjs.org"));
        assert!(DEFAULT_ALLOWED_HOSTS.contains(&"static.crates.io"));
    }

    #[test]
    fn select_expired_applies_ttl_and_orders_stalest_first() {
        let mut sessions = HashMap::new();
        sessions.insert("fresh".to_string(), test_session("fresh", 1000.0));
        sessions.insert("stale".to_string(), test_session("stale", 100.0));
        sessions.insert("stalest".to_string(), test_session("stalest", 50.0));

        // TTL 600 at t=1010: "fresh" idle 10s survives, the others go.
        let expired = select_expired(&sessions, 600, 1010.0);
        assert_eq!(expired, vec!["stalest".to_string(), "stale".to_string()]);

        // Exactly at the boundary is not expired (strictly greater).
        let boundary = select_expired(&sessions, 910, 1010.0);
        assert!(boundary.is_empty());
    }

    #[test]
    fn tenant_storage_layout() {
        let root = tempfile::tempdir().unwrap();
        let dir = ensure_tenant_storage(root.path(), "tenant-a").unwrap();
        assert!(dir.join("workspace").is_dir());
        assert!(dir.join("outputs").is_dir());
        // Second call is idempotent.
        ensure_tenant_storage(root.path(), "tenant-a").unwrap();
    }

    fn test_manager() -> SandboxManager {
        SandboxManager::new(Config {
            signing_key: Some("manager-test-secret".into()),
            ..Config::default()
        })
        .expect("docker client construction is lazy")
    }

    /// Serve the real agent router on an ephemeral port, rooted in a
    /// tempdir, and register a session pointing at it.
    async fn manager_with_live_agent() -> (SandboxManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let agent_config = AgentConfig {
            workspace: dir.path().join("workspace"),
            user_data: dir.path().join("user-data"),
        };
        std::fs::create_dir_all(&agent_config.workspace).unwrap();
        std::fs::create_dir_all(agent_config.user_data.join("outputs")).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = agent::router(agent_config);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let manager = test_manager();
        let mut session = test_session("live", unix_now());
        session.agent_port = port;
        manager
            .registry
            .lock()
            .await
            .insert("live".to_string(), session);
        (manager, dir)
    }

    #[tokio::test]
    async fn list_sessions_reflects_registry() {
        let manager = test_manager();
        assert!(manager.list_sessions().await.is_empty());

        manager
            .registry
            .lock()
            .await
            .insert("s1".to_string(), test_session("s1", 10.0));
        manager
            .registry
            .lock()
            .await
            .insert("s2".to_string(), test_session("s2", 20.0));

        let listed = manager.list_sessions().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, "s1");
        assert_eq!(listed[1].session_id, "s2");
    }

    #[tokio::test]
    async fn create_session_with_existing_id_returns_the_live_session() {
        let manager = test_manager();
        let original = test_session("dup", 100.0);
        manager
            .registry
            .lock()
            .await
            .insert("dup".to_string(), original.clone());

        // No container is created: the branch returns before any runtime
        // call, so this works without a daemon.
        let session = manager
            .create_session(
                Some("dup".to_string()),
                None,
                Some(vec!["other.host".to_string()]),
            )
            .await
            .unwrap();

        assert_eq!(session.session_id, "dup");
        assert_eq!(session.container_id, original.container_id);
        // The live session's allowlist stands; the request's is ignored.
        assert_eq!(session.allowed_hosts, original.allowed_hosts);
        assert!(session.last_activity > original.last_activity);
        assert_eq!(manager.registry.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn destroy_unknown_session_is_false_without_error() {
        let manager = test_manager();
        assert!(!manager.destroy_session("ghost").await);
    }

    #[tokio::test]
    async fn exec_against_missing_session_is_session_not_found() {
        let manager = test_manager();
        let err = manager.exec("ghost", "true", 5, "/workspace").await.unwrap_err();
        assert!(matches!(err, SandboxError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn get_session_refreshes_last_activity() {
        let manager = test_manager();
        manager
            .registry
            .lock()
            .await
            .insert("s1".to_string(), test_session("s1", 1.0));

        let before = manager.registry.lock().await.get("s1").unwrap().last_activity;
        let session = manager.get_session("s1").await.unwrap();
        assert!(session.last_activity > before);
        assert!(manager.get_session("ghost").await.is_none());
    }

    #[tokio::test]
    async fn exec_forwards_to_agent_and_touches_session() {
        let (manager, _dir) = manager_with_live_agent().await;
        let before = manager.registry.lock().await.get("live").unwrap().last_activity;

        let result = manager.exec("live", "echo hello", 10, "/tmp").await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");

        let after = manager.registry.lock().await.get("live").unwrap().last_activity;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn exec_stream_relays_chunks_and_ends_with_exit() {
        let (manager, _dir) = manager_with_live_agent().await;
        let mut stream = manager
            .exec_stream("live", "printf a; printf b >&2", "/tmp")
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        let last = chunks.last().unwrap();
        assert!(last.is_exit());
        assert_eq!(last.exit_code, Some(0));
        let stdout: String = chunks
            .iter()
            .filter(|c| c.channel == "stdout")
            .map(|c| c.data.as_str())
            .collect();
        assert_eq!(stdout, "a");
    }

    #[tokio::test]
    async fn file_roundtrip_through_agent() {
        let (manager, _dir) = manager_with_live_agent().await;

        manager.write_file("live", "a.txt", "hi", "w").await.unwrap();
        assert_eq!(manager.read_file("live", "a.txt").await.unwrap(), "hi");

        manager.write_file("live", "a.txt", "!", "a").await.unwrap();
        assert_eq!(manager.read_file("live", "a.txt").await.unwrap(), "hi!");

        let err = manager.read_file("live", "missing.txt").await.unwrap_err();
        assert!(matches!(err, SandboxError::File(_)));
    }

    #[tokio::test]
    async fn exec_against_dead_agent_is_unreachable_after_retry() {
        let manager = test_manager();
        // Port from a listener we immediately drop: connection refused.
        let dead_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut session = test_session("dead", unix_now());
        session.agent_port = dead_port;
        manager
            .registry
            .lock()
            .await
            .insert("dead".to_string(), session);

        let err = manager.exec("dead", "true", 2, "/tmp").await.unwrap_err();
        assert!(matches!(err, SandboxError::AgentUnreachable(_)));
    }

    #[tokio::test]
    async fn pip_install_is_gated_on_allowlist() {
        let manager = test_manager();
        let mut session = test_session("nopip", unix_now());
        session.allowed_hosts = vec!["example.com".to_string()];
        manager
            .registry
            .lock()
            .await
            .insert("nopip".to_string(), session);

        let result = manager
            .pip_install("nopip", &["requests".to_string()])
            .await
            .unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("files.pythonhosted.org"));
    }

    #[tokio::test]
    async fn pip_install_rejects_bad_specifiers_before_dispatch() {
        let manager = test_manager();
        manager
            .registry
            .lock()
            .await
            .insert("pip".to_string(), test_session("pip", unix_now()));

        let result = manager
            .pip_install("pip", &["requests; rm -rf /".to_string()])
            .await
            .unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("invalid package specifier"));
    }
}
