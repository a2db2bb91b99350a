use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::{ExpiringHash, PresenceError, UrlQuerier};

/// Lifecycle seam between the tunnel registry and the presence store:
/// register on accept, unregister on teardown, refresh from the registry's
/// ticker, GC/clear for this instance's own entries.
#[async_trait]
pub trait TunnelTracker: Send + Sync {
    async fn register_tunnel(&self, agent_id: i64) -> Result<(), PresenceError>;
    async fn unregister_tunnel(&self, agent_id: i64) -> Result<(), PresenceError>;
    /// Rewrites every owned entry that would otherwise expire before
    /// `next_refresh` (unix seconds).
    async fn refresh(&self, next_refresh: i64) -> Result<(), PresenceError>;
    /// Snapshots the owned keys now; the returned future deletes their
    /// stale fields when driven.
    fn gc(&self) -> BoxFuture<'static, Result<usize, PresenceError>>;
    /// Retracts everything this instance wrote.
    async fn clear(&self) -> Result<(), PresenceError>;
}

/// Redis-backed tracker. One hash per agent id; the field name is the peer
/// URL holding a tunnel, the value only carries the embedded expiry.
pub struct RedisTracker {
    own_url: String,
    peers_by_agent_id: ExpiringHash<i64, String>,
}

impl RedisTracker {
    pub fn new(client: redis::Client, key_prefix: &str, ttl: Duration, own_url: String) -> Self {
        let prefix = format!("{key_prefix}:kas_by_agent_id:");
        Self {
            own_url,
            peers_by_agent_id: ExpiringHash::new(
                client,
                Box::new(move |agent_id: &i64| {
                    let mut key = prefix.clone().into_bytes();
                    key.extend_from_slice(&agent_id.to_le_bytes());
                    key
                }),
                Box::new(|url: &String| url.clone().into_bytes()),
                ttl,
            ),
        }
    }

    pub fn own_url(&self) -> &str {
        &self.own_url
    }
}

#[async_trait]
impl TunnelTracker for RedisTracker {
    async fn register_tunnel(&self, agent_id: i64) -> Result<(), PresenceError> {
        self.peers_by_agent_id
            .set(&agent_id, &self.own_url, Vec::new())
            .await
    }

    async fn unregister_tunnel(&self, agent_id: i64) -> Result<(), PresenceError> {
        self.peers_by_agent_id.unset(&agent_id, &self.own_url).await
    }

    async fn refresh(&self, next_refresh: i64) -> Result<(), PresenceError> {
        self.peers_by_agent_id.refresh(next_refresh).await
    }

    fn gc(&self) -> BoxFuture<'static, Result<usize, PresenceError>> {
        self.peers_by_agent_id.gc()
    }

    async fn clear(&self) -> Result<(), PresenceError> {
        self.peers_by_agent_id.clear().await
    }
}

#[async_trait]
impl UrlQuerier for RedisTracker {
    async fn urls_by_agent_id(&self, agent_id: i64) -> (Vec<String>, Option<PresenceError>) {
        let mut urls = Vec::new();
        let mut first_err = None;
        let res = self
            .peers_by_agent_id
            .scan(&agent_id, |item| {
                match item {
                    Ok((field, _value)) => urls.push(String::from_utf8_lossy(&field).into_owned()),
                    Err(err) => {
                        tracing::warn!(agent_id, error = %err, "skipping bad presence entry");
                        first_err.get_or_insert(err);
                    }
                }
                false
            })
            .await;
        if let Err(err) = res {
            first_err.get_or_insert(err);
        }
        (urls, first_err)
    }
}

/// Process-local tracker for tests and single-instance deployments without
/// Redis: presence lookups only ever see this instance.
#[derive(Default)]
pub struct InMemoryTracker {
    own_url: String,
    agents: Mutex<HashMap<i64, HashSet<String>>>,
}

impl InMemoryTracker {
    pub fn new(own_url: String) -> Self {
        Self {
            own_url,
            agents: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TunnelTracker for InMemoryTracker {
    async fn register_tunnel(&self, agent_id: i64) -> Result<(), PresenceError> {
        self.agents
            .lock()
            .entry(agent_id)
            .or_default()
            .insert(self.own_url.clone());
        Ok(())
    }

    async fn unregister_tunnel(&self, agent_id: i64) -> Result<(), PresenceError> {
        let mut agents = self.agents.lock();
        if let Some(urls) = agents.get_mut(&agent_id) {
            urls.remove(&self.own_url);
            if urls.is_empty() {
                agents.remove(&agent_id);
            }
        }
        Ok(())
    }

    async fn refresh(&self, _next_refresh: i64) -> Result<(), PresenceError> {
        Ok(())
    }

    fn gc(&self) -> BoxFuture<'static, Result<usize, PresenceError>> {
        Box::pin(async { Ok(0) })
    }

    async fn clear(&self) -> Result<(), PresenceError> {
        self.agents.lock().clear();
        Ok(())
    }
}

#[async_trait]
impl UrlQuerier for InMemoryTracker {
    async fn urls_by_agent_id(&self, agent_id: i64) -> (Vec<String>, Option<PresenceError>) {
        let urls = self
            .agents
            .lock()
            .get(&agent_id)
            .map(|urls| urls.iter().cloned().collect())
            .unwrap_or_default();
        (urls, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run against a real Redis and are skipped unless TEST_REDIS_URL
    // is set, e.g. TEST_REDIS_URL=redis://127.0.0.1:6379.
    fn test_client() -> Option<redis::Client> {
        let url = std::env::var("TEST_REDIS_URL").ok()?;
        redis::Client::open(url).ok()
    }

    fn unique_prefix(tag: &str) -> String {
        format!("hawser-test:{tag}:{}", uuid_like())
    }

    fn uuid_like() -> String {
        format!("{:x}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0))
    }

    #[tokio::test]
    async fn register_scan_unregister_round_trip() {
        let Some(client) = test_client() else { return };
        let tracker = RedisTracker::new(
            client,
            &unique_prefix("round-trip"),
            Duration::from_secs(60),
            "https://p1.example".into(),
        );

        tracker.register_tunnel(9).await.unwrap();
        let (urls, err) = tracker.urls_by_agent_id(9).await;
        assert!(err.is_none());
        assert_eq!(urls, vec!["https://p1.example".to_string()]);

        // Unset followed by scan behaves as if set never happened.
        tracker.unregister_tunnel(9).await.unwrap();
        let (urls, err) = tracker.urls_by_agent_id(9).await;
        assert!(err.is_none());
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn refresh_keeps_entries_alive_past_original_expiry() {
        let Some(client) = test_client() else { return };
        let ttl = Duration::from_secs(60);
        let writer = RedisTracker::new(
            client.clone(),
            &unique_prefix("refresh"),
            ttl,
            "https://p.example".into(),
        );
        writer.register_tunnel(9).await.unwrap();

        // Refresh as if the next tick were one period past the entry's
        // expiry; the entry must be rewritten with a fresh deadline.
        let far = chrono::Utc::now().timestamp() + 2 * ttl.as_secs() as i64;
        writer.refresh(far).await.unwrap();

        let (urls, err) = writer.urls_by_agent_id(9).await;
        assert!(err.is_none());
        assert_eq!(urls, vec!["https://p.example".to_string()]);
    }

    #[tokio::test]
    async fn gc_removes_only_expired_fields() {
        let Some(client) = test_client() else { return };
        let prefix = unique_prefix("gc");
        // A tracker with a 1s TTL writes an entry that goes stale almost
        // immediately; the live tracker's later register bumps the shared
        // hash TTL so the key itself survives.
        let stale = RedisTracker::new(
            client.clone(),
            &prefix,
            Duration::from_secs(1),
            "https://stale.example".into(),
        );
        let live = RedisTracker::new(
            client.clone(),
            &prefix,
            Duration::from_secs(60),
            "https://live.example".into(),
        );
        stale.register_tunnel(5).await.unwrap();
        live.register_tunnel(5).await.unwrap();

        // Wait past the stale entry's embedded expiry (1s resolution).
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let deleted = stale.gc().await.unwrap();
        assert_eq!(deleted, 1);

        let (urls, err) = live.urls_by_agent_id(5).await;
        assert!(err.is_none());
        assert_eq!(urls, vec!["https://live.example".to_string()]);
    }

    #[tokio::test]
    async fn clear_retracts_everything_this_instance_wrote() {
        let Some(client) = test_client() else { return };
        let tracker = RedisTracker::new(
            client,
            &unique_prefix("clear"),
            Duration::from_secs(60),
            "https://p.example".into(),
        );
        tracker.register_tunnel(1).await.unwrap();
        tracker.register_tunnel(2).await.unwrap();
        tracker.clear().await.unwrap();
        for agent_id in [1, 2] {
            let (urls, _) = tracker.urls_by_agent_id(agent_id).await;
            assert!(urls.is_empty());
        }
    }

    #[tokio::test]
    async fn in_memory_tracker_tracks_own_url() {
        let tracker = InMemoryTracker::new("https://self.example".into());
        tracker.register_tunnel(3).await.unwrap();
        let (urls, _) = tracker.urls_by_agent_id(3).await;
        assert_eq!(urls, vec!["https://self.example".to_string()]);
        tracker.unregister_tunnel(3).await.unwrap();
        let (urls, _) = tracker.urls_by_agent_id(3).await;
        assert!(urls.is_empty());
    }
}
