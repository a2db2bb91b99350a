use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use futures_util::future::{BoxFuture, try_join_all};
use hawser_proto::{ExpiringValue, ExpiringValueTimestamp};
use parking_lot::Mutex;
use prost::Message as _;

use crate::PresenceError;

/// Bound on optimistic-transaction retries; a conflicted cycle is retried
/// once and then left for the next tick.
const TX_MAX_ATTEMPTS: usize = 2;

type KeyFn<K> = Box<dyn Fn(&K) -> Vec<u8> + Send + Sync>;

/// Two-level expiring map `K1 -> (K2 -> value)` backed by one Redis hash
/// per outer key.
///
/// Every inner value is stored as an [`ExpiringValue`] carrying its own
/// expiry next to the hash-level TTL, so scans can filter entries whose
/// owner stopped refreshing before Redis sweeps the whole hash. The hash
/// additionally keeps an in-process copy of the entries written through it,
/// scoping `refresh`, `gc` and `clear` to entries this instance owns; other
/// instances maintain their own.
pub struct ExpiringHash<K1, K2> {
    client: redis::Client,
    key_fn: KeyFn<K1>,
    field_fn: KeyFn<K2>,
    ttl: Duration,
    data: Mutex<HashMap<K1, HashMap<K2, ExpiringValue>>>,
}

impl<K1, K2> ExpiringHash<K1, K2>
where
    K1: Eq + Hash + Clone + Send + Sync,
    K2: Eq + Hash + Clone + Send + Sync,
{
    pub fn new(client: redis::Client, key_fn: KeyFn<K1>, field_fn: KeyFn<K2>, ttl: Duration) -> Self {
        Self {
            client,
            key_fn,
            field_fn,
            ttl,
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Writes the inner field and refreshes the hash TTL. The entry is
    /// remembered locally so later `refresh`/`gc`/`clear` cover it.
    pub async fn set(&self, k1: &K1, k2: &K2, value: Vec<u8>) -> Result<(), PresenceError> {
        let ev = ExpiringValue {
            expires_at: unix_now() + self.ttl.as_secs() as i64,
            value,
        };
        self.data
            .lock()
            .entry(k1.clone())
            .or_default()
            .insert(k2.clone(), ev.clone());
        let key = (self.key_fn)(k1);
        let field = (self.field_fn)(k2);
        self.write_fields(&key, vec![(field, ev.encode_to_vec())]).await
    }

    /// Deletes the inner field and drops it from the local map.
    pub async fn unset(&self, k1: &K1, k2: &K2) -> Result<(), PresenceError> {
        self.forget(k1, k2);
        let key = (self.key_fn)(k1);
        let field = (self.field_fn)(k2);
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("HDEL")
            .arg(&key)
            .arg(&field)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Removes the entry from the local map only.
    pub fn forget(&self, k1: &K1, k2: &K2) {
        let mut data = self.data.lock();
        if let Some(fields) = data.get_mut(k1) {
            fields.remove(k2);
            if fields.is_empty() {
                data.remove(k1);
            }
        }
    }

    pub async fn len(&self, k1: &K1) -> Result<i64, PresenceError> {
        let key = (self.key_fn)(k1);
        let mut conn = self.client.get_async_connection().await?;
        let n: i64 = redis::cmd("HLEN").arg(&key).query_async(&mut conn).await?;
        Ok(n)
    }

    /// Scans the hash for `k1`, invoking `cb` for every live entry with its
    /// raw field bytes and the stored value payload. Entries whose embedded
    /// expiry has passed are skipped and opportunistically deleted. Decode
    /// failures are reported to `cb` as errors and left in place. `cb`
    /// returns `true` to stop early. Returns the number of fields deleted.
    pub async fn scan<F>(&self, k1: &K1, mut cb: F) -> Result<usize, PresenceError>
    where
        F: FnMut(Result<(Vec<u8>, Vec<u8>), PresenceError>) -> bool,
    {
        let key = (self.key_fn)(k1);
        let mut conn = self.client.get_async_connection().await?;
        let entries = hscan_all(&mut conn, &key).await?;
        let now = unix_now();
        let mut saw_stale = false;
        for (field, raw) in entries {
            match ExpiringValue::decode(raw.as_slice()) {
                Ok(ev) if ev.expires_at < now => saw_stale = true,
                Ok(ev) => {
                    if cb(Ok((field, ev.value))) {
                        break;
                    }
                }
                Err(source) => {
                    let field = String::from_utf8_lossy(&field).into_owned();
                    if cb(Err(PresenceError::Decode { field, source })) {
                        break;
                    }
                }
            }
        }
        if !saw_stale {
            return Ok(0);
        }
        delete_stale_fields(&self.client, key).await
    }

    /// Rewrites every locally owned entry that would expire before
    /// `next_refresh` (unix seconds) and bumps the affected hash TTLs.
    pub async fn refresh(&self, next_refresh: i64) -> Result<(), PresenceError> {
        let expires_at = unix_now() + self.ttl.as_secs() as i64;
        let mut writes: Vec<(Vec<u8>, Vec<(Vec<u8>, Vec<u8>)>)> = Vec::new();
        {
            let mut data = self.data.lock();
            for (k1, fields) in data.iter_mut() {
                let mut due = Vec::new();
                for (k2, ev) in fields.iter_mut() {
                    if ev.expires_at > next_refresh {
                        // Still fresh at the next tick, skip this round.
                        continue;
                    }
                    ev.expires_at = expires_at;
                    due.push(((self.field_fn)(k2), ev.encode_to_vec()));
                }
                if !due.is_empty() {
                    writes.push(((self.key_fn)(k1), due));
                }
            }
        }
        try_join_all(
            writes
                .into_iter()
                .map(|(key, fields)| async move { self.write_fields(&key, fields).await }),
        )
        .await?;
        Ok(())
    }

    /// Returns a future over a snapshot of the locally known outer keys
    /// that deletes their stale fields. The future borrows nothing, so the
    /// caller can run it without holding any registry lock.
    pub fn gc(&self) -> BoxFuture<'static, Result<usize, PresenceError>> {
        let keys: Vec<Vec<u8>> = self.data.lock().keys().map(|k1| (self.key_fn)(k1)).collect();
        let client = self.client.clone();
        Box::pin(async move {
            let mut deleted = 0;
            for key in keys {
                deleted += delete_stale_fields(&client, key).await?;
            }
            Ok(deleted)
        })
    }

    /// Deletes every locally known field and empties the local map.
    pub async fn clear(&self) -> Result<(), PresenceError> {
        let snapshot: Vec<(Vec<u8>, Vec<Vec<u8>>)> = {
            let mut data = self.data.lock();
            let out = data
                .iter()
                .map(|(k1, fields)| {
                    (
                        (self.key_fn)(k1),
                        fields.keys().map(|k2| (self.field_fn)(k2)).collect(),
                    )
                })
                .collect();
            data.clear();
            out
        };
        if snapshot.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_async_connection().await?;
        let mut pipe = redis::pipe();
        for (key, fields) in &snapshot {
            pipe.cmd("HDEL").arg(key).arg(fields).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn write_fields(
        &self,
        key: &[u8],
        fields: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), PresenceError> {
        let mut conn = self.client.get_async_connection().await?;
        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in &fields {
            hset.arg(field).arg(value);
        }
        redis::pipe()
            .atomic()
            .add_command(hset)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(self.ttl.as_millis() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Deletes expired fields of one hash under optimistic concurrency: the
/// hash is WATCHed, rescanned, and the deletions applied in MULTI/EXEC so a
/// concurrent rewrite aborts the transaction instead of being clobbered.
async fn delete_stale_fields(client: &redis::Client, key: Vec<u8>) -> Result<usize, PresenceError> {
    // Dedicated connection: WATCH state is per connection.
    let mut conn = client.get_async_connection().await?;
    for _ in 0..TX_MAX_ATTEMPTS {
        redis::cmd("WATCH")
            .arg(&key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        let entries = hscan_all(&mut conn, &key).await?;
        let now = unix_now();
        let stale: Vec<Vec<u8>> = entries
            .into_iter()
            .filter(|(_, raw)| match ExpiringValueTimestamp::decode(raw.as_slice()) {
                Ok(ts) => ts.expires_at < now,
                // Leave undecodable values alone; Scan reports them.
                Err(_) => false,
            })
            .map(|(field, _)| field)
            .collect();
        if stale.is_empty() {
            redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
            return Ok(0);
        }
        let deleted: Option<redis::Value> = redis::pipe()
            .atomic()
            .cmd("HDEL")
            .arg(&key)
            .arg(&stale)
            .query_async(&mut conn)
            .await?;
        match deleted {
            Some(_) => return Ok(stale.len()),
            // EXEC aborted because the hash changed under us; retry.
            None => continue,
        }
    }
    Err(PresenceError::TxAttemptsExceeded {
        attempts: TX_MAX_ATTEMPTS,
    })
}

async fn hscan_all(
    conn: &mut redis::aio::Connection,
    key: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PresenceError> {
    let mut out = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, items): (u64, Vec<Vec<u8>>) = redis::cmd("HSCAN")
            .arg(key)
            .arg(cursor)
            .query_async(conn)
            .await?;
        let mut it = items.into_iter();
        while let (Some(field), Some(value)) = (it.next(), it.next()) {
            out.push((field, value));
        }
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(out)
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// Redis-backed behavior is covered by the integration tests in tracker.rs
// (gated on TEST_REDIS_URL); the pure parts are tested here.
#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> ExpiringHash<i64, String> {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        ExpiringHash::new(
            client,
            Box::new(|k1: &i64| k1.to_le_bytes().to_vec()),
            Box::new(|k2: &String| k2.clone().into_bytes()),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn forget_drops_entry_and_empty_outer_key() {
        let h = hash();
        h.data.lock().entry(7).or_default().insert(
            "a".to_string(),
            ExpiringValue { expires_at: 1, value: vec![] },
        );
        h.forget(&7, &"a".to_string());
        assert!(h.data.lock().is_empty());
    }
}
