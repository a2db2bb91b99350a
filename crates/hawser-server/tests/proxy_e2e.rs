// End-to-end proxy flow over real sockets: a scripted agent dials the
// broker's tunnel server, an HTTP client hits the gateway, and the request
// is piped through the agent's stream. The authorizer is stubbed and
// presence is in-memory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hawser_gateway::{
    AccessAs, Authorization, AuthorizeError, Authorizer, GatewayConfig, GatewayState, UserAccess,
};
use hawser_presence::{AggregatingQuerier, InMemoryTracker, UrlQuerier};
use hawser_proto::{
    ConnectRequest, ImpersonationConfig, KUBERNETES_PROXY_FULL_METHOD, Meta, RequestInfo,
    connect_response, meta_first, meta_insert,
};
use hawser_server::connect::TunnelConnectService;
use hawser_tunnel::{
    AgentInfo, GatewayTunnelServer, GatewayTunnelService, ReverseTunnelClient,
    ReverseTunnelServer, TunnelRegistry, TunnelRouter,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;

const AGENT_TOKEN: &str = "agent-tok";
const AGENT_ID: i64 = 42;
const AGENT_UUID: &str = "00000000-0000-0000-0000-00000000002a";
const PRIVATE_API_SECRET: &[u8] = b"e2e-private-secret";

struct StubAuthorizer;

#[async_trait]
impl Authorizer for StubAuthorizer {
    async fn authorize_proxy_user(
        &self,
        _agent_id: i64,
        _access_type: &str,
        access_key: &str,
    ) -> Result<Authorization, AuthorizeError> {
        if access_key != "tok" {
            return Err(AuthorizeError::Denied { status: 401 });
        }
        Ok(Authorization {
            access_as: AccessAs::User(UserAccess {
                username: "u1".into(),
                groups: vec!["g".into()],
                roles: vec!["r".into()],
            }),
        })
    }

    async fn authenticate_agent(&self, token: &str) -> Result<AgentInfo, AuthorizeError> {
        if token != AGENT_TOKEN {
            return Err(AuthorizeError::Denied { status: 401 });
        }
        Ok(AgentInfo { id: AGENT_ID, name: "test-agent".into() })
    }
}

struct Broker {
    api_url: String,
    agent_addr: SocketAddr,
    tracker: Arc<InMemoryTracker>,
    shutdown: CancellationToken,
}

/// Boots one broker instance. `peer_tracker` is the presence view its
/// querier reads; passing another broker's tracker makes that peer
/// discoverable.
async fn spawn_broker(
    find_timeout: Duration,
    peer_tracker: Option<Arc<dyn UrlQuerier>>,
) -> Broker {
    let shutdown = CancellationToken::new();

    let private_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let private_addr = private_listener.local_addr().unwrap();
    let own_url = format!("http://{private_addr}");

    let tracker = Arc::new(InMemoryTracker::new(own_url.clone()));
    let registry = TunnelRegistry::new(
        tracker.clone(),
        Duration::from_secs(60),
        Duration::from_secs(60),
        None,
    );
    let delegate: Arc<dyn UrlQuerier> =
        peer_tracker.unwrap_or_else(|| tracker.clone() as Arc<dyn UrlQuerier>);
    let querier = AggregatingQuerier::new(delegate, Duration::from_millis(50), Duration::from_secs(60));
    let router = Arc::new(TunnelRouter::new(
        registry.clone(),
        querier,
        own_url,
        find_timeout,
        Some(PRIVATE_API_SECRET.to_vec()),
    ));
    let authorizer = Arc::new(StubAuthorizer);

    let state = GatewayState::new(
        GatewayConfig {
            url_path_prefix: "/k8s".into(),
            allowed_origins: vec![],
            server_name: "hawser/test".into(),
            auth_cache_ttl: Duration::from_secs(300),
            auth_cache_err_ttl: Duration::from_secs(10),
        },
        router,
        authorizer.clone(),
        None,
    );
    let app = hawser_gateway::router(state);
    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = api_listener.local_addr().unwrap();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = axum::serve(api_listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
        }
    });

    let agent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_addr = agent_listener.local_addr().unwrap();
    let connect_service = TunnelConnectService::new(
        registry.clone(),
        authorizer,
        Duration::from_secs(300),
        Duration::from_secs(10),
        shutdown.clone(),
    );
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tonic::transport::Server::builder()
                .add_service(ReverseTunnelServer::new(connect_service))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(agent_listener),
                    shutdown.cancelled_owned(),
                )
                .await;
        }
    });

    tokio::spawn({
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        async move {
            let _ = tonic::transport::Server::builder()
                .add_service(GatewayTunnelServer::new(GatewayTunnelService::new(
                    registry,
                    shutdown.clone(),
                    Some(PRIVATE_API_SECRET.to_vec()),
                )))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(private_listener),
                    shutdown.cancelled_owned(),
                )
                .await;
        }
    });

    Broker {
        api_url: format!("http://{api_addr}"),
        agent_addr,
        tracker,
        shutdown,
    }
}

/// Connects a scripted agent that serves one proxied request: it records
/// the request info it receives and answers 200 with a `{}` body.
async fn spawn_agent(agent_addr: SocketAddr) -> mpsc::Receiver<RequestInfo> {
    let channel = Endpoint::from_shared(format!("http://{agent_addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = ReverseTunnelClient::new(channel);

    let (tx, rx) = mpsc::channel::<ConnectRequest>(16);
    let descriptor = hawser_proto::AgentDescriptor {
        services: vec![hawser_proto::ServiceDescriptor {
            name: "hawser.k8s.v1.KubernetesProxy".into(),
            methods: vec![hawser_proto::MethodDescriptor { name: "Proxy".into() }],
        }],
    };
    tx.send(ConnectRequest::descriptor(descriptor)).await.unwrap();

    let mut request = tonic::Request::new(ReceiverStream::new(rx));
    request.metadata_mut().insert(
        "authorization",
        tonic::metadata::MetadataValue::try_from(format!("Bearer {AGENT_TOKEN}").as_str())
            .unwrap(),
    );
    let response = client.connect(request).await.unwrap();
    let mut inbound = response.into_inner();

    let (info_tx, info_rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while let Ok(Some(frame)) = inbound.message().await {
            match frame.msg {
                Some(connect_response::Msg::RequestInfo(info)) => {
                    let _ = info_tx.send(info).await;
                }
                Some(connect_response::Msg::Message(_)) => {}
                Some(connect_response::Msg::CloseSend(_)) => {
                    let mut meta = Meta::new();
                    meta_insert(&mut meta, ":status", "200");
                    meta_insert(&mut meta, "content-type", "application/json");
                    let _ = tx.send(ConnectRequest::header(meta)).await;
                    let _ = tx.send(ConnectRequest::message(b"{}".to_vec())).await;
                    let _ = tx.send(ConnectRequest::trailer(Meta::new())).await;
                }
                None => {}
            }
        }
    });
    info_rx
}

async fn wait_for_presence(tracker: &InMemoryTracker, agent_id: i64) {
    for _ in 0..100 {
        let (urls, _) = tracker.urls_by_agent_id(agent_id).await;
        if !urls.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent {agent_id} never registered presence");
}

#[tokio::test(flavor = "multi_thread")]
async fn proxies_a_request_through_a_local_tunnel() {
    let broker = spawn_broker(Duration::from_secs(5), None).await;
    let mut info_rx = spawn_agent(broker.agent_addr).await;
    wait_for_presence(&broker.tracker, AGENT_ID).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/k8s/api/v1/namespaces/", broker.api_url))
        .header("authorization", format!("Bearer t:{AGENT_UUID}:tok"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(response.text().await.unwrap(), "{}");

    let info = info_rx.recv().await.expect("agent saw the request info");
    assert_eq!(info.method_name, KUBERNETES_PROXY_FULL_METHOD);
    assert_eq!(meta_first(&info.meta, ":method"), Some("GET"));
    assert_eq!(meta_first(&info.meta, ":path"), Some("/api/v1/namespaces/"));
    assert!(meta_first(&info.meta, "authorization").is_none());
    let imp =
        ImpersonationConfig::decode_from_extra(info.extra.as_deref().unwrap()).unwrap();
    assert_eq!(imp.username, "u1");
    assert_eq!(imp.groups, vec!["g".to_string()]);
    assert_eq!(imp.roles, vec!["r".to_string()]);

    broker.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_agent_yields_a_timeout_status() {
    let broker = spawn_broker(Duration::from_millis(200), None).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/k8s/api/v1/namespaces/", broker.api_url))
        .header("authorization", format!("Bearer t:{AGENT_ID}:tok"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "Status");
    assert_eq!(body["reason"], "Timeout");
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .to_ascii_lowercase()
            .contains("agent-server")
    );

    broker.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn forwards_to_the_peer_holding_the_tunnel() {
    // Peer B holds the agent's tunnel; peer A serves the HTTP request and
    // must discover B through presence and relay through it.
    let broker_b = spawn_broker(Duration::from_secs(5), None).await;
    let broker_a = spawn_broker(
        Duration::from_secs(5),
        Some(broker_b.tracker.clone() as Arc<dyn UrlQuerier>),
    )
    .await;

    let mut info_rx = spawn_agent(broker_b.agent_addr).await;
    wait_for_presence(&broker_b.tracker, AGENT_ID).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/k8s/api/v1/pods", broker_a.api_url))
        .header("authorization", format!("Bearer t:{AGENT_ID}:tok"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "{}");

    let info = info_rx.recv().await.expect("agent saw the forwarded request");
    assert_eq!(meta_first(&info.meta, ":path"), Some("/api/v1/pods"));

    broker_a.shutdown.cancel();
    broker_b.shutdown.cancel();
}
