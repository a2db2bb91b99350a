use async_trait::async_trait;

/// Per-credential request limiter consulted after authorization. The
/// production implementation counts in Redis so the limit covers the whole
/// fleet; a backend failure lets the request through rather than taking
/// the API down with it.
#[async_trait]
pub trait RequestLimiter: Send + Sync + 'static {
    /// Counts the attempt and reports whether it is within the limit.
    async fn allow(&self, key: &str) -> bool;
}
