//! Environment-driven configuration for the `serve` and `proxy` subcommands.

use std::env;
use std::path::PathBuf;

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Front-end gRPC listen port.
    pub grpc_port: u16,
    /// Image used for new session containers.
    pub image: String,
    /// Container runtime name (runsc for gVisor, runc for stock Docker).
    pub runtime: String,
    /// Root directory for tenant workspaces. Unset disables persistence.
    pub storage_path: Option<PathBuf>,
    /// Idle TTL for sessions, in seconds.
    pub session_timeout_secs: u64,
    /// Egress proxy host as seen from inside sandboxes. Unset disables
    /// proxy env injection.
    pub proxy_host: Option<String>,
    pub proxy_port: u16,
    /// Shared token secret. Generated at startup when unset, in which case
    /// an out-of-process proxy cannot verify our tokens.
    pub signing_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            grpc_port: parse_var("GRPC_PORT", 50051),
            image: env::var("SANDBOX_IMAGE").unwrap_or_else(|_| "sandbox-img:latest".into()),
            runtime: env::var("SANDBOX_RUNTIME").unwrap_or_else(|_| "runsc".into()),
            storage_path: env::var("STORAGE_PATH").ok().map(PathBuf::from),
            session_timeout_secs: parse_var("SESSION_TIMEOUT", 1800),
            proxy_host: env::var("PROXY_HOST").ok().filter(|h| !h.is_empty()),
            proxy_port: parse_var("PROXY_PORT", 15004),
            signing_key: env::var("SIGNING_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grpc_port: 50051,
            image: "sandbox-img:latest".into(),
            runtime: "runsc".into(),
            storage_path: None,
            session_timeout_secs: 1800,
            proxy_host: None,
            proxy_port: 15004,
            signing_key: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.grpc_port, 50051);
        assert_eq!(cfg.runtime, "runsc");
        assert_eq!(cfg.session_timeout_secs, 1800);
        assert_eq!(cfg.proxy_port, 15004);
        assert!(cfg.storage_path.is_none());
        assert!(cfg.proxy_host.is_none());
    }

    #[test]
    fn parse_var_falls_back_on_garbage() {
        // Not using set_var here: env mutation races with parallel tests.
        assert_eq!(parse_var::<u16>("AGENTCELL_TEST_UNSET_VAR", 42), 42);
    }
}
