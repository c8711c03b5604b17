//! Error taxonomy for the manager and front-end.

use thiserror::Error;

/// Errors surfaced by the sandbox manager. Exec timeouts are not errors;
/// they travel inside `ExecResult` with `timed_out` set.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The container did not become ready before the startup deadline.
    /// The environment has already been torn down when this is returned.
    #[error("sandbox startup failed: {0}")]
    SandboxStartup(String),

    /// The agent could not be reached mid-session (after one retry).
    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    /// The per-call wall-clock deadline elapsed before the agent answered.
    #[error("deadline exceeded: {0}")]
    Deadline(String),

    #[error("file error: {0}")]
    File(String),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error("{0}")]
    Runtime(String),
}

impl From<SandboxError> for tonic::Status {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::SessionNotFound(id) => {
                tonic::Status::not_found(format!("session not found: {id}"))
            }
            SandboxError::SandboxStartup(msg) => tonic::Status::unavailable(msg),
            SandboxError::AgentUnreachable(msg) => tonic::Status::unavailable(msg),
            SandboxError::Deadline(msg) => tonic::Status::deadline_exceeded(msg),
            SandboxError::File(msg) => tonic::Status::internal(msg),
            SandboxError::Docker(e) => tonic::Status::internal(e.to_string()),
            SandboxError::Runtime(msg) => tonic::Status::internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_maps_to_not_found_status() {
        let status: tonic::Status = SandboxError::SessionNotFound("abc".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(status.message().contains("abc"));
    }

    #[test]
    fn startup_and_unreachable_map_to_unavailable() {
        let status: tonic::Status = SandboxError::SandboxStartup("deadline".into()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let status: tonic::Status = SandboxError::AgentUnreachable("refused".into()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
