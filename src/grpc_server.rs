//! gRPC front-end: translates the external RPC surface into manager
//! operations and bridges the exec chunk stream back to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::manager::SandboxManager;
use crate::state::{Session, StreamChunk};

pub mod proto {
    tonic::include_proto!("sandbox");
}

use proto::sandbox_service_server::{SandboxService, SandboxServiceServer};
use proto::{
    CreateSessionRequest, CreateSessionResponse, DestroySessionRequest, DestroySessionResponse,
    ExecRequest, ExecResponse, ExecStreamRequest, ExecStreamResponse, GetSessionRequest,
    GetSessionResponse, ListSessionsRequest, ListSessionsResponse, PipInstallRequest,
    ReadFileRequest, ReadFileResponse, SessionInfo, WriteFileRequest, WriteFileResponse,
};

const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WORKDIR: &str = "/workspace";

pub struct SandboxServiceImpl {
    manager: Arc<SandboxManager>,
}

impl SandboxServiceImpl {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

fn session_to_proto(session: &Session) -> SessionInfo {
    SessionInfo {
        session_id: session.session_id.clone(),
        container_id: session.container_id.clone(),
        tenant_id: session.tenant_id.clone().unwrap_or_default(),
        allowed_hosts: session.allowed_hosts.clone(),
        workspace_path: session.workspace_path.clone(),
        created_at: session.created_at,
        last_activity: session.last_activity,
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn workdir_or_default(workdir: &str) -> &str {
    if workdir.is_empty() {
        DEFAULT_WORKDIR
    } else {
        workdir
    }
}

fn timeout_or_default(timeout: i32) -> u64 {
    if timeout > 0 {
        timeout as u64
    } else {
        DEFAULT_EXEC_TIMEOUT_SECS
    }
}

fn chunk_to_proto(chunk: StreamChunk) -> ExecStreamResponse {
    ExecStreamResponse {
        exit_code: chunk.exit_code.unwrap_or(0),
        channel: chunk.channel,
        data: chunk.data,
    }
}

#[tonic::async_trait]
impl SandboxService for SandboxServiceImpl {
    async fn create_session(
        &self,
        request: Request<CreateSessionRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let req = request.into_inner();
        // Empty repeated field means "use defaults"; the wire format
        // cannot express unset.
        let allowed_hosts = if req.allowed_hosts.is_empty() {
            None
        } else {
            Some(req.allowed_hosts)
        };

        let session = self
            .manager
            .create_session(
                non_empty(req.session_id),
                non_empty(req.tenant_id),
                allowed_hosts,
            )
            .await?;

        Ok(Response::new(CreateSessionResponse {
            session: Some(session_to_proto(&session)),
        }))
    }

    async fn destroy_session(
        &self,
        request: Request<DestroySessionRequest>,
    ) -> Result<Response<DestroySessionResponse>, Status> {
        let req = request.into_inner();
        let success = self.manager.destroy_session(&req.session_id).await;
        Ok(Response::new(DestroySessionResponse { success }))
    }

    async fn get_session(
        &self,
        request: Request<GetSessionRequest>,
    ) -> Result<Response<GetSessionResponse>, Status> {
        let req = request.into_inner();
        let session = self
            .manager
            .get_session(&req.session_id)
            .await
            .ok_or_else(|| Status::not_found("session not found"))?;
        Ok(Response::new(GetSessionResponse {
            session: Some(session_to_proto(&session)),
        }))
    }

    async fn list_sessions(
        &self,
        _request: Request<ListSessionsRequest>,
    ) -> Result<Response<ListSessionsResponse>, Status> {
        let sessions = self.manager.list_sessions().await;
        Ok(Response::new(ListSessionsResponse {
            sessions: sessions.iter().map(session_to_proto).collect(),
        }))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .manager
            .exec(
                &req.session_id,
                &req.command,
                timeout_or_default(req.timeout),
                workdir_or_default(&req.workdir),
            )
            .await?;

        Ok(Response::new(ExecResponse {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            timed_out: result.timed_out,
        }))
    }

    type ExecStreamStream = ReceiverStream<Result<ExecStreamResponse, Status>>;

    async fn exec_stream(
        &self,
        request: Request<ExecStreamRequest>,
    ) -> Result<Response<Self::ExecStreamStream>, Status> {
        let req = request.into_inner();
        let mut chunks = self
            .manager
            .exec_stream(
                &req.session_id,
                &req.command,
                workdir_or_default(&req.workdir),
            )
            .await?;

        // The manager guarantees a terminal exit chunk even when the
        // agent connection drops; this pump just converts and forwards.
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(chunk) = chunks.next().await {
                if tx.send(Ok(chunk_to_proto(chunk))).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn write_file(
        &self,
        request: Request<WriteFileRequest>,
    ) -> Result<Response<WriteFileResponse>, Status> {
        let req = request.into_inner();
        let mode = if req.mode.is_empty() {
            "w".to_string()
        } else {
            req.mode
        };

        match self
            .manager
            .write_file(&req.session_id, &req.path, &req.content, &mode)
            .await
        {
            Ok(()) => Ok(Response::new(WriteFileResponse {
                success: true,
                error: String::new(),
            })),
            // File errors ride in the response body, verbatim.
            Err(crate::error::SandboxError::File(msg)) => Ok(Response::new(WriteFileResponse {
                success: false,
                error: msg,
            })),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_file(
        &self,
        request: Request<ReadFileRequest>,
    ) -> Result<Response<ReadFileResponse>, Status> {
        let req = request.into_inner();
        match self.manager.read_file(&req.session_id, &req.path).await {
            Ok(content) => Ok(Response::new(ReadFileResponse {
                success: true,
                content,
                error: String::new(),
            })),
            Err(crate::error::SandboxError::File(msg)) => Ok(Response::new(ReadFileResponse {
                success: false,
                content: String::new(),
                error: msg,
            })),
            Err(e) => Err(e.into()),
        }
    }

    async fn pip_install(
        &self,
        request: Request<PipInstallRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        let result = self
            .manager
            .pip_install(&req.session_id, &req.packages)
            .await?;

        Ok(Response::new(ExecResponse {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            timed_out: result.timed_out,
        }))
    }
}

/// Run the gRPC server until the process is stopped.
pub async fn run_server(port: u16, manager: Arc<SandboxManager>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("gRPC server listening on {addr}");

    let service = SandboxServiceImpl::new(manager);
    tonic::transport::Server::builder()
        .add_service(SandboxServiceServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::default_allowed_hosts;

    #[test]
    fn session_descriptor_carries_the_wire_fields() {
        let session = Session {
            session_id: "s1".into(),
            tenant_id: Some("acme".into()),
            container_id: "deadbeef".into(),
            agent_host: "127.0.0.1".into(),
            agent_port: 32768,
            allowed_hosts: default_allowed_hosts(),
            workspace_path: "/srv/tenants/acme/workspace".into(),
            created_at: 100.0,
            last_activity: 200.0,
        };
        let proto = session_to_proto(&session);
        assert_eq!(proto.session_id, "s1");
        assert_eq!(proto.tenant_id, "acme");
        assert_eq!(proto.container_id, "deadbeef");
        assert_eq!(proto.workspace_path, "/srv/tenants/acme/workspace");
        assert_eq!(proto.allowed_hosts.len(), 8);
    }

    #[test]
    fn request_defaults() {
        assert_eq!(timeout_or_default(0), 30);
        assert_eq!(timeout_or_default(-1), 30);
        assert_eq!(timeout_or_default(120), 120);
        assert_eq!(workdir_or_default(""), "/workspace");
        assert_eq!(workdir_or_default("/tmp"), "/tmp");
        assert_eq!(non_empty(String::new()), None);
        assert_eq!(non_empty("x".into()), Some("x".into()));
    }

    #[test]
    fn exit_chunk_converts_with_code() {
        let proto = chunk_to_proto(StreamChunk::exit(7));
        assert_eq!(proto.channel, "exit");
        assert_eq!(proto.exit_code, 7);
        let proto = chunk_to_proto(StreamChunk::data("stdout", "x"));
        assert_eq!(proto.channel, "stdout");
        assert_eq!(proto.data, "x");
    }
}
