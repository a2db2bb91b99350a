use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::AuthorizeError;

struct Slot<V> {
    value: Option<(Instant, Result<V, AuthorizeError>)>,
}

/// Authorization cache with separate lifetimes for successes and for
/// cacheable denials; non-cacheable failures are never stored, so the next
/// caller re-queries (scenario: a transient authorizer 500). Concurrent
/// lookups of one key are collapsed into a single fetch.
pub struct CacheWithErr<K, V> {
    ttl: Duration,
    err_ttl: Duration,
    entries: Mutex<HashMap<K, Arc<tokio::sync::Mutex<Slot<V>>>>>,
}

impl<K, V> CacheWithErr<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, err_ttl: Duration) -> Self {
        Self {
            ttl,
            err_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, AuthorizeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AuthorizeError>>,
    {
        let slot = self
            .entries
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Slot { value: None })))
            .clone();
        // Per-key lock: one fetch in flight, followers reuse its result.
        let mut slot = slot.lock().await;
        if let Some((stored_at, result)) = &slot.value {
            let ttl = match result {
                Ok(_) => self.ttl,
                Err(_) => self.err_ttl,
            };
            if stored_at.elapsed() < ttl {
                return result.clone();
            }
        }
        let result = fetch().await;
        let cacheable = match &result {
            Ok(_) => true,
            Err(err) => err.is_cacheable(),
        };
        slot.value = cacheable.then(|| (Instant::now(), result.clone()));
        result
    }

    /// Drops entries past their lifetime. Busy entries are skipped and
    /// picked up next sweep.
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        let err_ttl = self.err_ttl;
        self.entries.lock().retain(|_, slot| {
            let Ok(slot) = slot.try_lock() else { return true };
            match &slot.value {
                None => false,
                Some((stored_at, Ok(_))) => stored_at.elapsed() < ttl,
                Some((stored_at, Err(_))) => stored_at.elapsed() < err_ttl,
            }
        });
    }
}
