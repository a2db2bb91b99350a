use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::PresenceError;

/// Sliding-minute request limiter over Redis, shared by the whole broker
/// fleet. Each (key, minute) pair is one counter with a TTL slightly under
/// two windows; the raw key is hashed so credentials never land in Redis.
pub struct TokenLimiter {
    client: redis::Client,
    key_prefix: String,
    limit_per_minute: u64,
}

impl TokenLimiter {
    pub fn new(client: redis::Client, key_prefix: &str, limit_per_minute: u64) -> Self {
        Self {
            client,
            key_prefix: format!("{key_prefix}:api_limit:"),
            limit_per_minute,
        }
    }

    /// Counts this attempt and reports whether it is within the limit.
    pub async fn is_allowed(&self, raw_key: &str) -> Result<bool, PresenceError> {
        let key = self.window_key(raw_key, chrono::Utc::now().timestamp());
        let mut conn = self.client.get_async_connection().await?;
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(Duration::from_secs(119).as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count <= self.limit_per_minute)
    }

    fn window_key(&self, raw_key: &str, now_unix: i64) -> Vec<u8> {
        let minute = now_unix / 60;
        let digest = Sha256::digest(raw_key.as_bytes());
        let mut key = self.key_prefix.clone().into_bytes();
        key.extend_from_slice(minute.to_string().as_bytes());
        key.push(b':');
        key.extend_from_slice(&digest);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64) -> TokenLimiter {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        TokenLimiter::new(client, "hawser-test", limit)
    }

    #[test]
    fn window_key_changes_per_minute_and_per_token() {
        let l = limiter(10);
        let a0 = l.window_key("tok-a", 0);
        let a1 = l.window_key("tok-a", 61);
        let b0 = l.window_key("tok-b", 0);
        assert_ne!(a0, a1);
        assert_ne!(a0, b0);
        assert_eq!(a0, l.window_key("tok-a", 59));
    }

    #[test]
    fn raw_token_never_appears_in_the_key() {
        let l = limiter(10);
        let key = l.window_key("super-secret-token", 0);
        let key_str = String::from_utf8_lossy(&key);
        assert!(!key_str.contains("super-secret-token"));
    }

    // Behavior against a live Redis; skipped unless TEST_REDIS_URL is set.
    #[tokio::test]
    async fn counts_and_limits_within_a_window() {
        let Some(url) = std::env::var("TEST_REDIS_URL").ok() else { return };
        let client = redis::Client::open(url).unwrap();
        let prefix = format!("hawser-test-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let limiter = TokenLimiter::new(client, &prefix, 2);
        assert!(limiter.is_allowed("tok").await.unwrap());
        assert!(limiter.is_allowed("tok").await.unwrap());
        assert!(!limiter.is_allowed("tok").await.unwrap());
        // A different token has its own budget.
        assert!(limiter.is_allowed("other").await.unwrap());
    }
}
