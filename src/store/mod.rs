//! Shared key-value store seam.
//!
//! Locks, trigger indices and worker queues all live in one shared store.
//! `RedisStore` is the production backend; `MemoryStore` backs tests and
//! paper runs. The trait only exposes the handful of atomic operations the
//! coordination layer actually relies on.

pub mod memory;
pub mod positions;
pub mod redis;

pub use memory::MemoryStore;
pub use positions::{MemoryPositionStore, PositionStore};
pub use redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Atomic operations over the shared store.
///
/// Implementations must guarantee that `set_nx`, `del_if_value` and `zswap`
/// are atomic with respect to concurrent callers; the lock manager's safety
/// rests on exactly these three.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Create-if-absent with TTL. Returns true when the key was created.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete only when the stored value matches. Returns true when deleted.
    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool>;

    /// Insert or update a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove a member. Returns true when it existed.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Zero-based rank of a member by ascending score, if present.
    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>>;

    /// Members with `min <= score <= max`, ascending.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<(String, f64)>>;

    /// All members with scores, ascending.
    async fn zmembers(&self, key: &str) -> Result<Vec<(String, f64)>>;

    /// Atomically replace `old_member` with `new_member` at `score`.
    ///
    /// Returns false (and inserts nothing) when `old_member` is gone - the
    /// caller lost its queue slot to a pruning waiter.
    async fn zswap(&self, key: &str, old_member: &str, new_member: &str, score: f64)
        -> Result<bool>;

    /// Append a payload to a list-backed queue.
    async fn queue_push(&self, queue: &str, payload: &str) -> Result<()>;

    /// Blocking pop from a list-backed queue, bounded by `timeout`.
    async fn queue_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>>;
}

/// Key layout shared by both backends.
pub(crate) mod keys {
    /// Exclusive lock key: `hardLock_<Collection>:<id>`
    pub fn hard_lock(collection: &str, id: &str) -> String {
        format!("hardLock_{collection}:{id}")
    }

    /// Turn queue key: `lockingTurn_<Collection>:<id>`
    pub fn turn_queue(collection: &str, id: &str) -> String {
        format!("lockingTurn_{collection}:{id}")
    }

    /// Advisory lock key: `softLock_<Collection>:<id>`
    pub fn soft_lock(collection: &str, id: &str) -> String {
        format!("softLock_{collection}:{id}")
    }

    /// Trigger index key: `<exchange>:<type>:<symbol>:gte|lte`
    pub fn trigger_index(exchange: &str, market_type: &str, symbol: &str, class: &str) -> String {
        format!("{exchange}:{market_type}:{symbol}:{class}")
    }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn test_key_formats() {
        assert_eq!(keys::hard_lock("positions", "abc"), "hardLock_positions:abc");
        assert_eq!(
            keys::turn_queue("positions", "abc"),
            "lockingTurn_positions:abc"
        );
        assert_eq!(keys::soft_lock("positions", "abc"), "softLock_positions:abc");
        assert_eq!(
            keys::trigger_index("binance", "spot", "BTC/USDT", "gte"),
            "binance:spot:BTC/USDT:gte"
        );
    }
}
