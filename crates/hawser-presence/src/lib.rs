// Redis-backed presence: which broker instance currently holds a tunnel to
// which agent. The expiring hash is the storage primitive, the tracker ties
// tunnel lifecycle to it, and the aggregating querier shares poll loops
// between concurrent lookups.

mod expiring_hash;
mod querier;
mod token_limiter;
mod tracker;

pub use expiring_hash::ExpiringHash;
pub use querier::{AggregatingQuerier, UrlQuerier};
pub use token_limiter::TokenLimiter;
pub use tracker::{InMemoryTracker, RedisTracker, TunnelTracker};

/// Errors from the presence layer. Transient Redis failures are recovered
/// locally by the refresh/GC tickers; callers only see errors for
/// operations they drive directly.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to decode presence value for field {field:?}: {source}")]
    Decode {
        field: String,
        #[source]
        source: prost::DecodeError,
    },
    #[error("redis transaction conflicted {attempts} times, giving up for this cycle")]
    TxAttemptsExceeded { attempts: usize },
}
