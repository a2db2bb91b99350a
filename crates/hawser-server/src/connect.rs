use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hawser_gateway::{AuthorizeError, Authorizer, CacheWithErr};
use hawser_proto::ConnectRequest;
use hawser_tunnel::{AgentInfo, ConnectStream, ReverseTunnelHandler, TunnelRegistry};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Status, Streaming};

/// Agent-facing `Connect` handler: resolves the agent's bearer token into
/// its identity, then parks the stream in the registry until the tunnel is
/// used or torn down.
pub struct TunnelConnectService {
    registry: Arc<TunnelRegistry>,
    authorizer: Arc<dyn Authorizer>,
    agent_cache: CacheWithErr<String, AgentInfo>,
    shutdown: CancellationToken,
}

impl TunnelConnectService {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        authorizer: Arc<dyn Authorizer>,
        agent_cache_ttl: Duration,
        agent_cache_err_ttl: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            authorizer,
            agent_cache: CacheWithErr::new(agent_cache_ttl, agent_cache_err_ttl),
            shutdown,
        }
    }

    async fn authenticate(&self, token: String) -> Result<AgentInfo, Status> {
        let authorizer = self.authorizer.clone();
        let fetch_token = token.clone();
        self.agent_cache
            .get_or_fetch(token, || async move {
                authorizer.authenticate_agent(&fetch_token).await
            })
            .await
            .map_err(|err| match err {
                AuthorizeError::Denied { status: 403 } => {
                    Status::permission_denied("agent access forbidden")
                }
                AuthorizeError::Denied { status: 404 } => Status::not_found("agent not found"),
                AuthorizeError::Denied { .. } => Status::unauthenticated("agent token rejected"),
                AuthorizeError::Unavailable(msg) => Status::unavailable(msg),
            })
    }
}

fn bearer_token(metadata: &tonic::metadata::MetadataMap) -> Option<String> {
    let raw = metadata.get("authorization")?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

#[async_trait]
impl ReverseTunnelHandler for TunnelConnectService {
    async fn connect(
        &self,
        request: tonic::Request<Streaming<ConnectRequest>>,
    ) -> Result<tonic::Response<ConnectStream>, Status> {
        let token = bearer_token(request.metadata())
            .ok_or_else(|| Status::unauthenticated("missing agent token"))?;
        let agent_info = self.authenticate(token).await?;
        tracing::info!(agent_id = agent_info.id, agent_name = %agent_info.name, "agent connected");

        let incoming = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let agent_id = agent_info.id;
            let result = registry
                .handle_tunnel(shutdown, agent_info, Box::pin(incoming), tx.clone())
                .await;
            match result {
                Ok(()) => tracing::debug!(agent_id, "tunnel closed"),
                Err(status) => {
                    tracing::debug!(agent_id, error = %status, "tunnel failed");
                    let _ = tx.send(Err(status)).await;
                }
            }
        });
        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }
}
