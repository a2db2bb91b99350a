// Hand-rolled service and client glue for the two streaming RPCs. The
// frame schema is tiny and the router already drives path-addressed calls
// through `tonic::client::Grpc` with explicit codecs, so the tower plumbing
// is spelled out here instead of being generated.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hawser_proto::{
    CONNECT_FULL_METHOD, ConnectRequest, ConnectResponse, GatewayRequest, GatewayResponse,
    PROXY_TUNNEL_FULL_METHOD, RequestInfo, ROUTING_AGENT_ID_KEY, ROUTING_METHOD_KEY,
    gateway_request, split_full_method,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http;
use tonic::transport::Channel;
use tonic::{Status, Streaming};

use crate::pipe::{self, PipeRequest, TunnelDataSink};
use crate::registry::TunnelRegistry;
use crate::tunnel::Tunnel;

/// Response stream of the agent-facing `Connect` RPC.
pub type ConnectStream = ReceiverStream<Result<ConnectResponse, Status>>;

/// Implements the agent-facing side of the tunnel stream. The production
/// handler authenticates the agent and hands the stream to the registry.
#[async_trait]
pub trait ReverseTunnelHandler: Send + Sync + 'static {
    async fn connect(
        &self,
        request: tonic::Request<Streaming<ConnectRequest>>,
    ) -> Result<tonic::Response<ConnectStream>, Status>;
}

/// `hawser.tunnel.v1.ReverseTunnel` server.
pub struct ReverseTunnelServer<T> {
    inner: Arc<T>,
}

impl<T> ReverseTunnelServer<T> {
    pub fn new(inner: T) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

impl<T> Clone for ReverseTunnelServer<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> tonic::server::NamedService for ReverseTunnelServer<T> {
    const NAME: &'static str = "hawser.tunnel.v1.ReverseTunnel";
}

impl<T, B> tonic::codegen::Service<http::Request<B>> for ReverseTunnelServer<T>
where
    T: ReverseTunnelHandler,
    B: tonic::codegen::Body + Send + 'static,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = tonic::codegen::BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            CONNECT_FULL_METHOD => {
                struct ConnectSvc<T>(Arc<T>);
                impl<T: ReverseTunnelHandler> tonic::server::StreamingService<ConnectRequest>
                    for ConnectSvc<T>
                {
                    type Response = ConnectResponse;
                    type ResponseStream = ConnectStream;
                    type Future =
                        tonic::codegen::BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

                    fn call(
                        &mut self,
                        request: tonic::Request<Streaming<ConnectRequest>>,
                    ) -> Self::Future {
                        let inner = self.0.clone();
                        Box::pin(async move { inner.connect(request).await })
                    }
                }
                let inner = self.inner.clone();
                Box::pin(async move {
                    let method = ConnectSvc(inner);
                    let codec = tonic::codec::ProstCodec::default();
                    let mut grpc = tonic::server::Grpc::new(codec);
                    Ok(grpc.streaming(method, req).await)
                })
            }
            _ => Box::pin(async move { Ok(grpc_unimplemented()) }),
        }
    }
}

/// Client for the agent-facing `Connect` RPC, used by agents and tests.
pub struct ReverseTunnelClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ReverseTunnelClient {
    pub fn new(channel: Channel) -> Self {
        Self { inner: tonic::client::Grpc::new(channel) }
    }

    pub async fn connect(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = ConnectRequest>,
    ) -> Result<tonic::Response<Streaming<ConnectResponse>>, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("broker is not ready: {e}")))?;
        let codec: tonic::codec::ProstCodec<ConnectRequest, ConnectResponse> =
            tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(CONNECT_FULL_METHOD);
        self.inner
            .streaming(request.into_streaming_request(), path, codec)
            .await
    }
}

/// Response stream of the peer-facing `ProxyTunnel` RPC.
pub type ProxyTunnelStream = ReceiverStream<Result<GatewayResponse, Status>>;

/// Serving-peer side of cross-broker forwarding: matches a local tunnel
/// for the routing metadata, answers `tunnel_ready`, and relays frames
/// verbatim once the routing peer commits with `start_streaming`.
#[derive(Clone)]
pub struct GatewayTunnelService {
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
    /// Shared secret peers must present; `None` disables auth.
    secret: Option<Arc<Vec<u8>>>,
}

impl GatewayTunnelService {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        shutdown: CancellationToken,
        secret: Option<Vec<u8>>,
    ) -> Self {
        Self {
            registry,
            shutdown,
            secret: secret.map(Arc::new),
        }
    }

    async fn proxy_tunnel(
        &self,
        request: tonic::Request<Streaming<GatewayRequest>>,
    ) -> Result<tonic::Response<ProxyTunnelStream>, Status> {
        let md = request.metadata();
        if let Some(secret) = &self.secret {
            crate::peer_auth::validate(md, secret.as_slice())?;
        }
        let agent_id: i64 = md
            .get(ROUTING_AGENT_ID_KEY)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Status::invalid_argument("missing or invalid routing agent id"))?;
        let full_method = md
            .get(ROUTING_METHOD_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Status::invalid_argument("missing routing method"))?;
        let (service, method) = split_full_method(&full_method)
            .ok_or_else(|| Status::invalid_argument("malformed routing method"))?;

        let mut inbound = request.into_inner();
        // Local tunnels only; a serving peer never forwards onward.
        let (found, mut handle) = self.registry.find_tunnel(agent_id, service, method);
        let tunnel = if found {
            handle.get().await?
        } else {
            tokio::select! {
                tunnel = handle.get() => tunnel?,
                frame = inbound.message() => {
                    return Err(match frame {
                        Err(status) => status,
                        Ok(None) => Status::cancelled("routing peer went away"),
                        Ok(Some(_)) => Status::invalid_argument(
                            "no frames are allowed before tunnel_ready",
                        ),
                    });
                }
                _ = self.shutdown.cancelled() => {
                    return Err(Status::unavailable("broker is shutting down"));
                }
            }
        };

        let (tx, rx) = mpsc::channel(16);
        let _ = tx.send(Ok(GatewayResponse::tunnel_ready())).await;
        tokio::spawn(relay(tunnel, inbound, tx));
        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }
}

async fn relay(
    tunnel: Tunnel,
    mut inbound: Streaming<GatewayRequest>,
    tx: mpsc::Sender<Result<GatewayResponse, Status>>,
) {
    match inbound.message().await {
        Ok(Some(GatewayRequest { msg: Some(gateway_request::Msg::StartStreaming(_)) })) => {}
        Ok(None) | Err(_) => {
            // Abandoned before commit; the tunnel goes back to the pool.
            drop(tunnel);
            return;
        }
        Ok(Some(_)) => {
            drop(tunnel);
            let _ = tx
                .send(Err(Status::invalid_argument("expected start_streaming frame")))
                .await;
            return;
        }
    }
    let info = match inbound.message().await {
        Ok(Some(GatewayRequest { msg: Some(gateway_request::Msg::RequestInfo(info)) })) => info,
        Ok(None) | Err(_) => {
            drop(tunnel);
            return;
        }
        Ok(Some(_)) => {
            drop(tunnel);
            let _ = tx
                .send(Err(Status::invalid_argument("expected request_info frame")))
                .await;
            return;
        }
    };
    let RequestInfo { method_name, meta, extra } = info;
    let body = Box::pin(futures_util::stream::unfold(inbound, |mut inbound| async move {
        match inbound.message().await {
            Ok(Some(GatewayRequest { msg: Some(gateway_request::Msg::Message(m)) })) => {
                Some((Ok(Bytes::from(m.data)), inbound))
            }
            Ok(Some(GatewayRequest { msg: Some(gateway_request::Msg::CloseSend(_)) }))
            | Ok(None) => None,
            Ok(Some(_)) => Some((
                Err(Status::invalid_argument("unexpected frame in forwarded request")),
                inbound,
            )),
            Err(status) => Some((Err(status), inbound)),
        }
    }));
    let request = PipeRequest { method: method_name, meta, extra, body };
    let mut sink = GatewaySink { tx: tx.clone() };
    if let Err(status) = pipe::forward(tunnel, request, &mut sink).await {
        let _ = tx.send(Err(status)).await;
    }
}

struct GatewaySink {
    tx: mpsc::Sender<Result<GatewayResponse, Status>>,
}

impl GatewaySink {
    async fn send(&mut self, frame: GatewayResponse) -> Result<(), Status> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| Status::cancelled("routing peer went away"))
    }
}

#[async_trait]
impl TunnelDataSink for GatewaySink {
    async fn header(&mut self, meta: hawser_proto::Meta) -> Result<(), Status> {
        self.send(GatewayResponse::header(hawser_proto::Header { meta })).await
    }

    async fn message(&mut self, data: Vec<u8>) -> Result<(), Status> {
        self.send(GatewayResponse::message(data)).await
    }

    async fn trailer(&mut self, meta: hawser_proto::Meta) -> Result<(), Status> {
        self.send(GatewayResponse::trailer(hawser_proto::Trailer { meta })).await
    }

    async fn error(&mut self, status: hawser_proto::RpcStatus) -> Result<(), Status> {
        self.send(GatewayResponse::error(hawser_proto::Error { status: Some(status) }))
            .await
    }
}

/// `hawser.gateway.v1.GatewayTunnel` server.
#[derive(Clone)]
pub struct GatewayTunnelServer {
    inner: GatewayTunnelService,
}

impl GatewayTunnelServer {
    pub fn new(inner: GatewayTunnelService) -> Self {
        Self { inner }
    }
}

impl tonic::server::NamedService for GatewayTunnelServer {
    const NAME: &'static str = "hawser.gateway.v1.GatewayTunnel";
}

impl<B> tonic::codegen::Service<http::Request<B>> for GatewayTunnelServer
where
    B: tonic::codegen::Body + Send + 'static,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = tonic::codegen::BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            PROXY_TUNNEL_FULL_METHOD => {
                struct ProxyTunnelSvc(GatewayTunnelService);
                impl tonic::server::StreamingService<GatewayRequest> for ProxyTunnelSvc {
                    type Response = GatewayResponse;
                    type ResponseStream = ProxyTunnelStream;
                    type Future =
                        tonic::codegen::BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

                    fn call(
                        &mut self,
                        request: tonic::Request<Streaming<GatewayRequest>>,
                    ) -> Self::Future {
                        let inner = self.0.clone();
                        Box::pin(async move { inner.proxy_tunnel(request).await })
                    }
                }
                let inner = self.inner.clone();
                Box::pin(async move {
                    let method = ProxyTunnelSvc(inner);
                    let codec = tonic::codec::ProstCodec::default();
                    let mut grpc = tonic::server::Grpc::new(codec);
                    Ok(grpc.streaming(method, req).await)
                })
            }
            _ => Box::pin(async move { Ok(grpc_unimplemented()) }),
        }
    }
}

fn grpc_unimplemented() -> http::Response<tonic::body::BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    let headers = response.headers_mut();
    headers.insert(
        tonic::Status::GRPC_STATUS,
        (tonic::Code::Unimplemented as i32).into(),
    );
    headers.insert(http::header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);
    response
}
