use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use hawser_presence::{AggregatingQuerier, UrlQuerier};
use hawser_proto::{
    GatewayRequest, GatewayResponse, Meta, PROXY_TUNNEL_FULL_METHOD, RequestInfo,
    ROUTING_AGENT_ID_KEY, ROUTING_METHOD_KEY, RpcStatus, gateway_response, split_full_method,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::{Status, Streaming};

use crate::pipe::{self, FrameRx, FrameTx, InboundFrame, PipeRequest, TunnelDataSink};
use crate::registry::TunnelRegistry;
use crate::tunnel::Tunnel;

/// One proxied request entering the routing layer, with the target agent id
/// already resolved.
pub struct RoutedRequest {
    pub agent_id: i64,
    pub method: String,
    pub meta: Meta,
    pub extra: Option<Vec<u8>>,
    pub body: BoxStream<'static, Result<Bytes, Status>>,
}

/// Response head plus the streamed body. Dropping the receiver cancels the
/// underlying pipe.
pub struct ProxyResponse {
    pub meta: Meta,
    pub body: mpsc::Receiver<Result<Bytes, Status>>,
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Reusable channels to peer brokers, one per private API URL.
#[derive(Clone, Default)]
pub struct PeerPool {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl PeerPool {
    pub fn channel(&self, url: &str) -> Result<Channel, Status> {
        if let Some(channel) = self.channels.lock().get(url) {
            return Ok(channel.clone());
        }
        let endpoint = Endpoint::from_shared(url.to_string())
            .map_err(|e| Status::invalid_argument(format!("invalid peer url {url:?}: {e}")))?;
        let channel = endpoint.connect_lazy();
        self.channels.lock().insert(url.to_string(), channel.clone());
        Ok(channel)
    }
}

/// Routes requests to agents: a local tunnel when one matches, otherwise a
/// forwarding stream to whichever peer broker presence says holds one.
pub struct TunnelRouter {
    registry: Arc<TunnelRegistry>,
    querier: Arc<AggregatingQuerier<dyn UrlQuerier>>,
    own_url: String,
    peers: PeerPool,
    find_timeout: Duration,
    /// Shared secret authenticating this broker to its peers; `None`
    /// disables private API auth.
    private_api_secret: Option<Arc<Vec<u8>>>,
}

enum Conduit {
    Local(Tunnel),
    Remote(RemoteConduit),
}

impl TunnelRouter {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        querier: Arc<AggregatingQuerier<dyn UrlQuerier>>,
        own_url: String,
        find_timeout: Duration,
        private_api_secret: Option<Vec<u8>>,
    ) -> Self {
        Self {
            registry,
            querier,
            own_url,
            peers: PeerPool::default(),
            find_timeout,
            private_api_secret: private_api_secret.map(Arc::new),
        }
    }

    /// Finds a conduit for the request and pipes it. Resolves once the
    /// response header (or a terminal error) is known; the body streams
    /// through the returned receiver afterwards.
    pub async fn route(&self, request: RoutedRequest) -> Result<ProxyResponse, Status> {
        let RoutedRequest { agent_id, method, meta, extra, body } = request;
        let (service, method_name) = split_full_method(&method)
            .ok_or_else(|| Status::invalid_argument(format!("malformed method name {method:?}")))?;

        let (found, mut handle) = self.registry.find_tunnel(agent_id, service, method_name);
        let mut conduit = if found {
            Conduit::Local(handle.get().await?)
        } else {
            // The queued find-request stays live while peers are tried;
            // first hit wins and the loser is cleaned up.
            let acquired = tokio::time::timeout(self.find_timeout, async {
                tokio::select! {
                    local = handle.get() => local.map(Conduit::Local),
                    remote = self.find_remote(agent_id, &method) => remote.map(Conduit::Remote),
                }
            })
            .await;
            match acquired {
                Ok(Ok(conduit)) => conduit,
                Ok(Err(status)) => return Err(status),
                Err(_) => {
                    return Err(Status::deadline_exceeded(
                        "no matching tunnel became available before the deadline",
                    ));
                }
            }
        };
        drop(handle);

        if let Conduit::Remote(remote) = &mut conduit {
            remote.start_streaming().await?;
        }

        let pipe_request = PipeRequest { method, meta, extra, body };
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut sink = ChannelSink { head: Some(head_tx), body: body_tx };
            let result = match conduit {
                Conduit::Local(tunnel) => pipe::forward(tunnel, pipe_request, &mut sink).await,
                Conduit::Remote(remote) => {
                    let RemoteConduit { tx, rx } = remote;
                    pipe::run_pipe(
                        RemoteFrameTx { tx },
                        RemoteFrameRx { rx },
                        pipe_request,
                        &mut sink,
                    )
                    .await
                    .for_caller
                }
            };
            sink.finish(result).await;
        });

        match head_rx.await {
            Ok(Ok(meta)) => Ok(ProxyResponse { meta, body: body_rx }),
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Status::internal("tunnel pipe ended before a response header")),
        }
    }

    /// Polls presence for peers holding a tunnel to the agent and races
    /// connection attempts; resolves with the first peer that reports a
    /// ready tunnel. Runs until cancelled by drop.
    async fn find_remote(&self, agent_id: i64, full_method: &str) -> Result<RemoteConduit, Status> {
        let token = CancellationToken::new();
        let _stop_on_drop = token.clone().drop_guard();
        let (ready_tx, mut ready_rx) = mpsc::channel::<RemoteConduit>(1);
        let (url_tx, mut url_rx) = mpsc::channel::<String>(8);
        tokio::spawn({
            let querier = self.querier.clone();
            let token = token.clone();
            async move {
                querier
                    .poll_urls_by_agent_id(token, agent_id, move |urls| {
                        for url in urls.iter() {
                            let _ = url_tx.try_send(url.clone());
                        }
                    })
                    .await;
            }
        });

        let mut attempted = HashSet::new();
        attempted.insert(self.own_url.clone());
        let mut urls_open = true;
        loop {
            if !urls_open {
                return match ready_rx.recv().await {
                    Some(conduit) => Ok(conduit),
                    None => Err(Status::unavailable("no peer with a matching tunnel")),
                };
            }
            tokio::select! {
                url = url_rx.recv() => match url {
                    Some(url) => {
                        if attempted.insert(url.clone()) {
                            tokio::spawn(attempt_peer(
                                self.peers.clone(),
                                url,
                                agent_id,
                                full_method.to_string(),
                                self.private_api_secret.clone(),
                                token.clone(),
                                ready_tx.clone(),
                            ));
                        }
                    }
                    None => urls_open = false,
                },
                conduit = ready_rx.recv() => {
                    if let Some(conduit) = conduit {
                        return Ok(conduit);
                    }
                }
            }
        }
    }
}

/// Dials one peer and waits for its tunnel-ready answer. Side-effect free
/// until the winner sends `start_streaming`; losing attempts just drop the
/// stream, returning the serving peer's tunnel to its pool.
async fn attempt_peer(
    peers: PeerPool,
    url: String,
    agent_id: i64,
    full_method: String,
    secret: Option<Arc<Vec<u8>>>,
    token: CancellationToken,
    ready: mpsc::Sender<RemoteConduit>,
) {
    let attempt = async {
        let channel = peers.channel(&url)?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("peer is not ready ({url}): {e}")))?;
        let (tx, rx) = mpsc::channel::<GatewayRequest>(16);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        let md = request.metadata_mut();
        md.insert(
            ROUTING_AGENT_ID_KEY,
            tonic::metadata::MetadataValue::try_from(agent_id.to_string().as_str())
                .map_err(|e| Status::internal(format!("agent id metadata: {e}")))?,
        );
        md.insert(
            ROUTING_METHOD_KEY,
            tonic::metadata::MetadataValue::try_from(full_method.as_str())
                .map_err(|e| Status::invalid_argument(format!("method metadata: {e}")))?,
        );
        if let Some(secret) = &secret {
            let signed = crate::peer_auth::sign(secret.as_slice())?;
            md.insert(
                "authorization",
                tonic::metadata::MetadataValue::try_from(format!("Bearer {signed}").as_str())
                    .map_err(|e| Status::internal(format!("peer token metadata: {e}")))?,
            );
        }
        let path = tonic::codegen::http::uri::PathAndQuery::from_static(PROXY_TUNNEL_FULL_METHOD);
        let codec: tonic::codec::ProstCodec<GatewayRequest, GatewayResponse> =
            tonic::codec::ProstCodec::default();
        let response = grpc.streaming(request, path, codec).await?;
        let mut inbound = response.into_inner();
        match inbound.message().await? {
            Some(GatewayResponse { msg: Some(gateway_response::Msg::TunnelReady(_)) }) => {
                Ok(RemoteConduit { tx, rx: inbound })
            }
            Some(_) => Err(Status::internal("peer sent an unexpected first frame")),
            None => Err(Status::unavailable("peer closed the stream without a tunnel")),
        }
    };
    tokio::select! {
        _ = token.cancelled() => {}
        res = attempt => match res {
            Ok(conduit) => {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = ready.send(conduit) => {}
                }
            }
            Err(status) => {
                tracing::debug!(peer_url = %url, agent_id, error = %status, "peer tunnel attempt failed");
            }
        },
    }
}

pub(crate) struct RemoteConduit {
    tx: mpsc::Sender<GatewayRequest>,
    rx: Streaming<GatewayResponse>,
}

impl RemoteConduit {
    async fn start_streaming(&mut self) -> Result<(), Status> {
        self.tx
            .send(GatewayRequest::start_streaming())
            .await
            .map_err(|_| Status::unavailable("peer stream closed"))
    }
}

struct RemoteFrameTx {
    tx: mpsc::Sender<GatewayRequest>,
}

#[async_trait]
impl FrameTx for RemoteFrameTx {
    async fn send_info(&mut self, info: RequestInfo) -> Result<(), Status> {
        self.send(GatewayRequest::request_info(info)).await
    }

    async fn send_data(&mut self, data: Vec<u8>) -> Result<(), Status> {
        self.send(GatewayRequest::message(data)).await
    }

    async fn send_close(&mut self) -> Result<(), Status> {
        self.send(GatewayRequest::close_send()).await
    }
}

impl RemoteFrameTx {
    async fn send(&mut self, frame: GatewayRequest) -> Result<(), Status> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Status::unavailable("peer stream closed"))
    }
}

struct RemoteFrameRx {
    rx: Streaming<GatewayResponse>,
}

#[async_trait]
impl FrameRx for RemoteFrameRx {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, Status> {
        match self.rx.message().await? {
            None => Ok(None),
            Some(frame) => Ok(Some(match frame.msg {
                Some(gateway_response::Msg::Header(h)) => InboundFrame::Header(h.meta),
                Some(gateway_response::Msg::Message(m)) => InboundFrame::Message(m.data),
                Some(gateway_response::Msg::Trailer(t)) => InboundFrame::Trailer(t.meta),
                Some(gateway_response::Msg::Error(e)) => {
                    InboundFrame::Error(e.status.unwrap_or_else(|| {
                        RpcStatus::from_status(&Status::unknown("peer relayed an empty error"))
                    }))
                }
                Some(gateway_response::Msg::TunnelReady(_)) => {
                    InboundFrame::Unexpected("tunnel_ready")
                }
                None => InboundFrame::Unexpected("empty"),
            })),
        }
    }
}

/// Sink bridging a pipe to the routing caller: the header resolves the
/// route() future, body bytes flow through the channel, and a terminal
/// error lands wherever the response currently is.
struct ChannelSink {
    head: Option<oneshot::Sender<Result<Meta, Status>>>,
    body: mpsc::Sender<Result<Bytes, Status>>,
}

impl ChannelSink {
    async fn finish(mut self, result: Result<(), Status>) {
        match (self.head.take(), result) {
            (Some(head), Err(status)) => {
                let _ = head.send(Err(status));
            }
            (Some(head), Ok(())) => {
                let _ = head.send(Err(Status::internal(
                    "tunnel pipe ended before a response header",
                )));
            }
            (None, Err(status)) => {
                let _ = self.body.send(Err(status)).await;
            }
            (None, Ok(())) => {}
        }
    }
}

#[async_trait]
impl TunnelDataSink for ChannelSink {
    async fn header(&mut self, meta: Meta) -> Result<(), Status> {
        match self.head.take() {
            Some(head) => head
                .send(Ok(meta))
                .map_err(|_| Status::cancelled("requester went away")),
            None => Err(Status::internal("duplicate response header")),
        }
    }

    async fn message(&mut self, data: Vec<u8>) -> Result<(), Status> {
        self.body
            .send(Ok(Bytes::from(data)))
            .await
            .map_err(|_| Status::cancelled("requester went away"))
    }

    async fn trailer(&mut self, _meta: Meta) -> Result<(), Status> {
        Ok(())
    }

    async fn error(&mut self, status: RpcStatus) -> Result<(), Status> {
        let status = status.to_status();
        if let Some(head) = self.head.take() {
            let _ = head.send(Err(status));
        } else {
            let _ = self.body.send(Err(status)).await;
        }
        Ok(())
    }
}
