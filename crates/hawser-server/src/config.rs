use std::net::SocketAddr;
use std::time::Duration;

/// Broker configuration, read once at boot from `HAWSER_*` environment
/// variables. Missing authorizer settings and unparseable listen addresses
/// are fatal; everything else falls back to a sensible default.
#[derive(Debug, Clone)]
pub struct Config {
    pub agent_listen_addr: SocketAddr,
    pub api_listen_addr: SocketAddr,
    pub private_listen_addr: SocketAddr,
    /// This instance's private API URL as other peers reach it; advertised
    /// in presence.
    pub own_private_url: String,
    pub redis_url: String,
    pub redis_key_prefix: String,
    pub presence_ttl: Duration,
    pub presence_gc_period: Duration,
    pub url_path_prefix: String,
    pub allowed_origins: Vec<String>,
    pub authorizer_url: String,
    pub authorizer_secret: Vec<u8>,
    pub auth_cache_ttl: Duration,
    pub auth_cache_err_ttl: Duration,
    pub find_tunnel_timeout: Duration,
    pub poll_period: Duration,
    pub poll_gc_period: Duration,
    pub max_connection_age: Option<Duration>,
    pub server_name: String,
    /// Shared secret for broker-to-broker calls; unset disables private
    /// API auth (single-instance deployments).
    pub private_api_secret: Option<Vec<u8>>,
    /// Per-credential request budget per minute; 0 disables limiting.
    pub api_rate_limit_per_minute: u64,
}

const PRESENCE_REFRESH_OVERLAP: Duration = Duration::from_secs(5);

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let authorizer_url = std::env::var("HAWSER_AUTHORIZER_URL")
            .map_err(|_| anyhow::anyhow!("HAWSER_AUTHORIZER_URL is required"))?;
        let authorizer_secret = std::env::var("HAWSER_AUTHORIZER_SECRET")
            .map_err(|_| anyhow::anyhow!("HAWSER_AUTHORIZER_SECRET is required"))?
            .into_bytes();
        let max_connection_age =
            parse_u64("HAWSER_MAX_CONNECTION_AGE_SECS", 1800, 0, 24 * 3600);
        Ok(Self {
            agent_listen_addr: parse_addr("HAWSER_AGENT_LISTEN_ADDR", "0.0.0.0:8150")?,
            api_listen_addr: parse_addr("HAWSER_API_LISTEN_ADDR", "0.0.0.0:8151")?,
            private_listen_addr: parse_addr("HAWSER_PRIVATE_LISTEN_ADDR", "0.0.0.0:8155")?,
            own_private_url: env_or("HAWSER_PRIVATE_API_URL", "http://127.0.0.1:8155"),
            redis_url: env_or("HAWSER_REDIS_URL", "redis://127.0.0.1:6379"),
            redis_key_prefix: env_or("HAWSER_REDIS_KEY_PREFIX", "hawser"),
            presence_ttl: Duration::from_secs(parse_u64("HAWSER_PRESENCE_TTL_SECS", 300, 30, 3600)),
            presence_gc_period: Duration::from_secs(parse_u64(
                "HAWSER_PRESENCE_GC_PERIOD_SECS",
                60,
                10,
                3600,
            )),
            url_path_prefix: env_or("HAWSER_URL_PATH_PREFIX", "/"),
            allowed_origins: parse_origins("HAWSER_ALLOWED_ORIGINS"),
            authorizer_url,
            authorizer_secret,
            auth_cache_ttl: Duration::from_secs(parse_u64(
                "HAWSER_AUTH_CACHE_TTL_SECS",
                300,
                1,
                3600,
            )),
            auth_cache_err_ttl: Duration::from_secs(parse_u64(
                "HAWSER_AUTH_CACHE_ERR_TTL_SECS",
                10,
                1,
                3600,
            )),
            find_tunnel_timeout: Duration::from_millis(parse_u64(
                "HAWSER_FIND_TUNNEL_TIMEOUT_MS",
                15_000,
                100,
                600_000,
            )),
            poll_period: Duration::from_millis(parse_u64("HAWSER_POLL_PERIOD_MS", 250, 50, 60_000)),
            poll_gc_period: Duration::from_secs(parse_u64("HAWSER_POLL_GC_PERIOD_SECS", 40, 5, 3600)),
            max_connection_age: (max_connection_age > 0)
                .then(|| Duration::from_secs(max_connection_age)),
            server_name: env_or(
                "HAWSER_SERVER_NAME",
                concat!("hawser/", env!("CARGO_PKG_VERSION")),
            ),
            private_api_secret: std::env::var("HAWSER_PRIVATE_API_SECRET")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(String::into_bytes),
            api_rate_limit_per_minute: parse_u64("HAWSER_API_RATE_LIMIT_PER_MINUTE", 0, 0, 1_000_000),
        })
    }

    /// Presence refresh cadence: one overlap short of the TTL so entries
    /// never expire between refreshes.
    pub fn refresh_period(&self) -> Duration {
        self.presence_ttl
            .saturating_sub(PRESENCE_REFRESH_OVERLAP)
            .max(Duration::from_secs(1))
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_addr(name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    env_or(name, default)
        .parse()
        .map_err(|e| anyhow::anyhow!("{name}: invalid listen address: {e}"))
}

fn parse_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn parse_origins(name: &str) -> Vec<String> {
    // Example: HAWSER_ALLOWED_ORIGINS=https://ui.example,https://admin.example
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
