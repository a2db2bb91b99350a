use async_trait::async_trait;
use hawser_gateway::RequestLimiter;
use hawser_presence::TokenLimiter;

/// Gateway limiter backed by the fleet-wide Redis counter. Fails open: a
/// Redis hiccup must not turn into an API outage.
pub struct RedisApiLimiter {
    inner: TokenLimiter,
}

impl RedisApiLimiter {
    pub fn new(inner: TokenLimiter) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RequestLimiter for RedisApiLimiter {
    async fn allow(&self, key: &str) -> bool {
        match self.inner.is_allowed(key).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(error = %err, "rate limiter unavailable, allowing request");
                true
            }
        }
    }
}
