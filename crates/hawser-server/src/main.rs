use std::sync::Arc;
use std::time::Duration;

use hawser_gateway::{GatewayConfig, GatewayState, HttpAuthorizer, RequestLimiter};
use hawser_presence::{AggregatingQuerier, RedisTracker, TokenLimiter, UrlQuerier};
use hawser_server::config::Config;
use hawser_server::connect::TunnelConnectService;
use hawser_server::limiter::RedisApiLimiter;
use hawser_tunnel::{
    GatewayTunnelServer, GatewayTunnelService, ReverseTunnelServer, TunnelRegistry, TunnelRouter,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let tracker = Arc::new(RedisTracker::new(
        redis_client.clone(),
        &config.redis_key_prefix,
        config.presence_ttl,
        config.own_private_url.clone(),
    ));
    let registry = TunnelRegistry::new(
        tracker.clone(),
        config.refresh_period(),
        config.presence_gc_period,
        config.max_connection_age,
    );
    let querier = AggregatingQuerier::new(
        tracker.clone() as Arc<dyn UrlQuerier>,
        config.poll_period,
        config.poll_gc_period,
    );
    let tunnel_router = Arc::new(TunnelRouter::new(
        registry.clone(),
        querier.clone(),
        config.own_private_url.clone(),
        config.find_tunnel_timeout,
        config.private_api_secret.clone(),
    ));
    let authorizer = Arc::new(HttpAuthorizer::new(
        config.authorizer_url.clone(),
        config.authorizer_secret.clone(),
    ));

    let limiter: Option<Arc<dyn RequestLimiter>> = (config.api_rate_limit_per_minute > 0)
        .then(|| {
            Arc::new(RedisApiLimiter::new(TokenLimiter::new(
                redis_client.clone(),
                &config.redis_key_prefix,
                config.api_rate_limit_per_minute,
            ))) as Arc<dyn RequestLimiter>
        });

    let gateway_state = GatewayState::new(
        GatewayConfig {
            url_path_prefix: config.url_path_prefix.clone(),
            allowed_origins: config.allowed_origins.clone(),
            server_name: config.server_name.clone(),
            auth_cache_ttl: config.auth_cache_ttl,
            auth_cache_err_ttl: config.auth_cache_err_ttl,
        },
        tunnel_router,
        authorizer.clone(),
        limiter,
    );
    let gateway_app = hawser_gateway::router(gateway_state.clone());

    let connect_service = TunnelConnectService::new(
        registry.clone(),
        authorizer,
        config.auth_cache_ttl,
        config.auth_cache_err_ttl,
        shutdown.clone(),
    );

    let registry_loop = tokio::spawn(registry.clone().run(shutdown.clone()));
    let querier_loop = tokio::spawn(querier.run(shutdown.clone()));
    tokio::spawn({
        let gateway_state = gateway_state.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => gateway_state.evict_expired_auth(),
                }
            }
        }
    });

    let agent_server = tonic::transport::Server::builder()
        .add_service(ReverseTunnelServer::new(connect_service))
        .serve_with_shutdown(config.agent_listen_addr, shutdown.clone().cancelled_owned());
    tracing::info!(addr = %config.agent_listen_addr, "agent tunnel server listening");

    let private_server = tonic::transport::Server::builder()
        .add_service(GatewayTunnelServer::new(GatewayTunnelService::new(
            registry.clone(),
            shutdown.clone(),
            config.private_api_secret.clone(),
        )))
        .serve_with_shutdown(config.private_listen_addr, shutdown.clone().cancelled_owned());
    tracing::info!(addr = %config.private_listen_addr, "private api server listening");

    let api_listener = tokio::net::TcpListener::bind(config.api_listen_addr).await?;
    tracing::info!(addr = %config.api_listen_addr, "kubernetes api gateway listening");
    let api_server = axum::serve(api_listener, gateway_app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::try_join!(
        async { agent_server.await.map_err(anyhow::Error::from) },
        async { private_server.await.map_err(anyhow::Error::from) },
        async { api_server.await.map_err(anyhow::Error::from) },
    )?;

    // The registry loop finishes its shutdown pass (closing tunnels and
    // retracting presence) before the process exits.
    let _ = registry_loop.await;
    let _ = querier_loop.await;
    Ok(())
}
