//! Session registry types shared by the manager and the gRPC front-end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Hosts reachable through the egress proxy when the caller does not
/// supply an allowlist: the package registries plus GitHub.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "pypi.org",
    "files.pythonhosted.org",
    "registry.npmjs.org",
    "github.com",
    "raw.githubusercontent.com",
    "objects.githubusercontent.com",
    "crates.io",
    "static.crates.io",
];

pub fn default_allowed_hosts() -> Vec<String> {
    DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect()
}

/// One live sandbox session.
///
/// The allowlist is fixed at creation; `last_activity` advances on every
/// successful call routed to the session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub tenant_id: Option<String>,
    pub container_id: String,
    /// Host-reachable address of the in-sandbox agent.
    pub agent_host: String,
    pub agent_port: u16,
    pub allowed_hosts: Vec<String>,
    pub workspace_path: String,
    pub created_at: f64,
    pub last_activity: f64,
}

impl Session {
    pub fn agent_url(&self) -> String {
        format!("http://{}:{}", self.agent_host, self.agent_port)
    }
}

/// All mutation and snapshot reads go through this single mutex. It must
/// never be held across container or agent I/O: take it, clone what you
/// need, release, then do the call.
pub type Registry = Arc<Mutex<HashMap<String, Session>>>;

pub fn new_registry() -> Registry {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Result of a buffered command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl ExecResult {
    /// A local failure reported in exec shape, exit code -1.
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }
}

/// One streamed output chunk. `channel` is "stdout" or "stderr" for data
/// chunks; the terminal chunk has channel "exit" and carries `exit_code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub channel: String,
    #[serde(default)]
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StreamChunk {
    pub fn data(channel: &str, data: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            data: data.into(),
            exit_code: None,
        }
    }

    pub fn exit(exit_code: i32) -> Self {
        Self {
            channel: "exit".to_string(),
            data: String::new(),
            exit_code: Some(exit_code),
        }
    }

    pub fn is_exit(&self) -> bool {
        self.channel == "exit"
    }
}

/// Seconds since the epoch as a float, the timestamp unit used on the wire.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allowlist_covers_package_registries() {
        let hosts = default_allowed_hosts();
        for required in ["pypi.org", "files.pythonhosted.org", "crates.io"] {
            assert!(hosts.iter().any(|h| h == required), "missing {required}");
        }
        assert_eq!(hosts.len(), 8);
    }

    #[test]
    fn stream_chunk_json_shape() {
        let chunk = StreamChunk::data("stdout", "hello\n");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["channel"], "stdout");
        assert_eq!(json["data"], "hello\n");
        assert!(json.get("exit_code").is_none());

        let exit = StreamChunk::exit(0);
        let json = serde_json::to_value(&exit).unwrap();
        assert_eq!(json["channel"], "exit");
        assert_eq!(json["exit_code"], 0);
        assert!(exit.is_exit());
    }

    #[test]
    fn exec_result_roundtrips_without_timed_out_field() {
        // Older agents omit timed_out; it must default to false.
        let parsed: ExecResult =
            serde_json::from_str(r#"{"exit_code":0,"stdout":"hi","stderr":""}"#).unwrap();
        assert!(!parsed.timed_out);
        assert_eq!(parsed.stdout, "hi");
    }
}
