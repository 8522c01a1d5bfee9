//! Fair, renewable, crash-tolerant distributed locks.
//!
//! Exclusive ("hard") locks are a create-if-absent key with TTL plus a
//! per-resource sorted-set turn queue that grants waiters approximate FIFO
//! progress. Every waiter polls its own rank and opportunistically evicts
//! queue members whose deadline has passed, so a crashed holder or waiter
//! never wedges the queue. "Soft" locks are a single best-effort
//! create-if-absent write with no queue.
//!
//! Failure to acquire is not exceptional: callers get `None` and are
//! expected to requeue the outer work item.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::Result;
use crate::store::{keys, KvStore};

/// Which locks a release call tears down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Hard,
    Soft,
    All,
}

/// Granted exclusive lock. Release explicitly on every exit path; there is
/// no async drop.
#[derive(Debug, Clone)]
pub struct HardLock {
    pub collection: String,
    pub id: String,
    token: String,
}

impl HardLock {
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Granted advisory lock
#[derive(Debug, Clone)]
pub struct SoftLock {
    pub collection: String,
    pub id: String,
    token: String,
}

/// One waiter's entry in the turn queue: `processName:uniqueToken:ttl:expireAt`
#[derive(Debug, Clone, PartialEq, Eq)]
struct TurnEntry {
    process: String,
    token: String,
    ttl_secs: u64,
    expire_at_ms: i64,
}

impl TurnEntry {
    fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.process, self.token, self.ttl_secs, self.expire_at_ms
        )
    }

    fn decode(member: &str) -> Option<Self> {
        // Rightmost two fields are numeric; the process name must not
        // contain ':' but the parse does not depend on the token shape.
        let mut tail = member.rsplitn(3, ':');
        let expire_at_ms: i64 = tail.next()?.parse().ok()?;
        let ttl_secs: u64 = tail.next()?.parse().ok()?;
        let (process, token) = tail.next()?.split_once(':')?;
        Some(Self {
            process: process.to_string(),
            token: token.to_string(),
            ttl_secs,
            expire_at_ms,
        })
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at_ms < now_ms
    }
}

/// Fair distributed lock manager over the shared store.
pub struct LockManager {
    store: Arc<dyn KvStore>,
    process_name: String,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>, process_name: impl Into<String>, config: LockConfig) -> Self {
        Self {
            store,
            process_name: process_name.into(),
            config,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn new_token(&self) -> String {
        format!("{}:{}", self.process_name, Uuid::new_v4())
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Acquire the exclusive lock for `(collection, id)`, waiting fairly in
    /// the turn queue. Returns `None` when the poll budget is exhausted.
    pub async fn acquire_hard(&self, collection: &str, id: &str) -> Result<Option<HardLock>> {
        let hard_key = keys::hard_lock(collection, id);
        let turn_key = keys::turn_queue(collection, id);
        let token = self.new_token();

        // Fast path: nobody holds it and nobody waits ahead of us.
        if self.store.set_nx(&hard_key, &token, self.ttl()).await? {
            self.purge_turn_entries(&turn_key, &token).await?;
            return Ok(Some(HardLock {
                collection: collection.to_string(),
                id: id.to_string(),
                token,
            }));
        }

        // Join the turn queue and poll our rank. The enqueue-time score is
        // our place in line and must survive expiry extensions.
        let mut entry = TurnEntry {
            process: self.process_name.clone(),
            token: token.clone(),
            ttl_secs: self.config.ttl_secs,
            expire_at_ms: Self::now_ms() + (self.config.ttl_secs as i64) * 1_000,
        };
        let mut score = Self::now_ms() as f64;
        self.store.zadd(&turn_key, &entry.encode(), score).await?;

        for attempt in 0..self.config.max_attempts {
            self.evict_expired_waiters(&turn_key, &entry).await?;

            match self.store.zrank(&turn_key, &entry.encode()).await? {
                None => {
                    // A racing waiter pruned us; rejoin at the back.
                    warn!(
                        resource = %format!("{collection}:{id}"),
                        "turn-queue entry was evicted while waiting, rejoining"
                    );
                    entry.expire_at_ms =
                        Self::now_ms() + (self.config.ttl_secs as i64) * 1_000;
                    score = Self::now_ms() as f64;
                    self.store.zadd(&turn_key, &entry.encode(), score).await?;
                }
                Some(0) => {
                    // Our turn. Extend our own expiry atomically so a racing
                    // waiter cannot prune us mid-transition, then go for the
                    // exclusive key.
                    let extended = TurnEntry {
                        expire_at_ms: Self::now_ms()
                            + (self.config.ttl_secs as i64) * 1_000,
                        ..entry.clone()
                    };
                    if self
                        .store
                        .zswap(&turn_key, &entry.encode(), &extended.encode(), score)
                        .await?
                    {
                        entry = extended;
                    } else {
                        // Lost the slot between rank check and extend.
                        score = Self::now_ms() as f64;
                        self.store.zadd(&turn_key, &entry.encode(), score).await?;
                        continue;
                    }

                    if self.store.set_nx(&hard_key, &token, self.ttl()).await? {
                        self.purge_turn_entries(&turn_key, &token).await?;
                        debug!(
                            resource = %format!("{collection}:{id}"),
                            attempt, "hard lock granted from turn queue"
                        );
                        return Ok(Some(HardLock {
                            collection: collection.to_string(),
                            id: id.to_string(),
                            token,
                        }));
                    }
                    // Holder still alive; its TTL bounds our wait.
                }
                Some(_) => {}
            }

            tokio::time::sleep(self.poll_interval_with_jitter()).await;
        }

        // Budget exhausted: leave no residue and let the caller requeue.
        self.purge_turn_entries(&turn_key, &token).await?;
        debug!(
            resource = %format!("{collection}:{id}"),
            attempts = self.config.max_attempts,
            "hard lock acquisition timed out"
        );
        Ok(None)
    }

    /// Single best-effort create-if-absent write; no queue, no retry.
    pub async fn acquire_soft(&self, collection: &str, id: &str) -> Result<Option<SoftLock>> {
        let soft_key = keys::soft_lock(collection, id);
        let token = self.new_token();
        if self.store.set_nx(&soft_key, &token, self.ttl()).await? {
            Ok(Some(SoftLock {
                collection: collection.to_string(),
                id: id.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release a hard lock. Deletes the exclusive key only when it still
    /// carries our token, so a lock re-acquired by someone else after TTL
    /// expiry is never torn down.
    pub async fn release_hard(&self, lock: &HardLock) -> Result<()> {
        self.release(&lock.collection, &lock.id, &lock.token, LockKind::Hard)
            .await
    }

    pub async fn release_soft(&self, lock: &SoftLock) -> Result<()> {
        self.release(&lock.collection, &lock.id, &lock.token, LockKind::Soft)
            .await
    }

    /// Token-checked release of hard and/or soft locks plus residual
    /// turn-queue entries.
    pub async fn release(
        &self,
        collection: &str,
        id: &str,
        token: &str,
        kind: LockKind,
    ) -> Result<()> {
        if matches!(kind, LockKind::Hard | LockKind::All) {
            let hard_key = keys::hard_lock(collection, id);
            let deleted = self.store.del_if_value(&hard_key, token).await?;
            if !deleted {
                debug!(
                    resource = %format!("{collection}:{id}"),
                    "hard lock already expired or held by another token at release"
                );
            }
            self.purge_turn_entries(&keys::turn_queue(collection, id), token)
                .await?;
        }
        if matches!(kind, LockKind::Soft | LockKind::All) {
            let soft_key = keys::soft_lock(collection, id);
            self.store.del_if_value(&soft_key, token).await?;
        }
        Ok(())
    }

    /// Evict queue members whose deadline passed (crashed or stalled
    /// waiters). Our own entry is extended elsewhere, never evicted here.
    async fn evict_expired_waiters(&self, turn_key: &str, own: &TurnEntry) -> Result<()> {
        let now_ms = Self::now_ms();
        for (member, _) in self.store.zmembers(turn_key).await? {
            let Some(decoded) = TurnEntry::decode(&member) else {
                warn!(turn_key, member, "unparseable turn-queue member, evicting");
                self.store.zrem(turn_key, &member).await?;
                continue;
            };
            if decoded.token == own.token {
                continue;
            }
            if decoded.is_expired(now_ms) {
                debug!(
                    turn_key,
                    process = decoded.process,
                    "evicting expired turn-queue waiter"
                );
                self.store.zrem(turn_key, &member).await?;
            }
        }
        Ok(())
    }

    /// Remove every queue entry carrying our token.
    async fn purge_turn_entries(&self, turn_key: &str, token: &str) -> Result<()> {
        for (member, _) in self.store.zmembers(turn_key).await? {
            if TurnEntry::decode(&member).is_some_and(|e| e.token == token) {
                self.store.zrem(turn_key, &member).await?;
            }
        }
        Ok(())
    }

    fn poll_interval_with_jitter(&self) -> Duration {
        // +-10% so waiters polling the same resource do not herd.
        let base = self.config.poll_interval_ms as i64;
        let spread = (base / 10).max(1);
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base + jitter).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn fast_config(ttl_secs: u64, poll_ms: u64, attempts: u32) -> LockConfig {
        LockConfig {
            ttl_secs,
            poll_interval_ms: poll_ms,
            max_attempts: attempts,
        }
    }

    fn manager(store: &MemoryStore, name: &str, config: LockConfig) -> LockManager {
        LockManager::new(Arc::new(store.clone()), name, config)
    }

    #[test]
    fn test_turn_entry_codec() {
        let entry = TurnEntry {
            process: "worker-1".to_string(),
            token: "worker-1:2f9d0a7e-1111-2222-3333-444455556666".to_string(),
            ttl_secs: 90,
            expire_at_ms: 1_700_000_000_000,
        };
        let decoded = TurnEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
        assert!(TurnEntry::decode("garbage").is_none());
    }

    #[tokio::test]
    async fn test_exclusive_grant_and_release() {
        let store = MemoryStore::new();
        let a = manager(&store, "a", fast_config(5, 10, 3));
        let b = manager(&store, "b", fast_config(5, 10, 3));

        let lock = a.acquire_hard("positions", "p1").await.unwrap().unwrap();
        assert!(b.acquire_hard("positions", "p1").await.unwrap().is_none());

        a.release_hard(&lock).await.unwrap();
        assert!(b.acquire_hard("positions", "p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let store = MemoryStore::new();
        let in_section = Arc::new(AtomicBool::new(false));
        let acquisitions = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            let in_section = in_section.clone();
            let acquisitions = acquisitions.clone();
            handles.push(tokio::spawn(async move {
                let mgr = manager(
                    &store,
                    &format!("w{worker}"),
                    fast_config(5, 5, 400),
                );
                for _ in 0..5 {
                    let lock = mgr
                        .acquire_hard("positions", "contended")
                        .await
                        .unwrap()
                        .expect("acquisition within budget");
                    assert!(
                        !in_section.swap(true, Ordering::SeqCst),
                        "two holders inside the critical section"
                    );
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_section.store(false, Ordering::SeqCst);
                    acquisitions.fetch_add(1, Ordering::SeqCst);
                    mgr.release_hard(&lock).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(acquisitions.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_liveness_after_holder_crash() {
        let store = MemoryStore::new();
        // Holder with a short TTL that never releases.
        let crasher = manager(&store, "crasher", fast_config(1, 10, 5));
        let _abandoned = crasher
            .acquire_hard("positions", "p1")
            .await
            .unwrap()
            .unwrap();

        // Waiter polls past the holder's TTL and must get the lock.
        let waiter = manager(&store, "waiter", fast_config(1, 50, 40));
        let lock = waiter.acquire_hard("positions", "p1").await.unwrap();
        assert!(lock.is_some(), "waiter must acquire within ttl + poll budget");
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = MemoryStore::new();
        let a = manager(&store, "a", fast_config(1, 10, 2));
        let b = manager(&store, "b", fast_config(1, 30, 50));

        let stale = a.acquire_hard("positions", "p1").await.unwrap().unwrap();
        // TTL lapses and another process re-acquires.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let fresh = b.acquire_hard("positions", "p1").await.unwrap().unwrap();

        // The stale holder's release must not tear down the new lock.
        a.release_hard(&stale).await.unwrap();
        let held = store
            .get(&keys::hard_lock("positions", "p1"))
            .await
            .unwrap();
        assert_eq!(held.as_deref(), Some(fresh.token()));
    }

    #[tokio::test]
    async fn test_waiters_evict_expired_queue_members() {
        let store = MemoryStore::new();
        let turn_key = keys::turn_queue("positions", "p1");

        // A dead waiter from a crashed process, deadline long past.
        let dead = TurnEntry {
            process: "dead".to_string(),
            token: "dead:00000000-0000-0000-0000-000000000000".to_string(),
            ttl_secs: 1,
            expire_at_ms: LockManager::now_ms() - 60_000,
        };
        store.zadd(&turn_key, &dead.encode(), 1.0).await.unwrap();

        // Occupy the lock so the next acquirer has to go through the queue.
        let holder = manager(&store, "holder", fast_config(5, 10, 3));
        let lock = holder.acquire_hard("positions", "p1").await.unwrap().unwrap();

        // One failed acquisition attempt is enough to trigger eviction.
        let waiter = manager(&store, "waiter", fast_config(5, 10, 3));
        let _ = waiter.acquire_hard("positions", "p1").await.unwrap();

        let members = store.zmembers(&turn_key).await.unwrap();
        assert!(
            !members.iter().any(|(m, _)| m == &dead.encode()),
            "expired member must be evicted by polling waiters"
        );

        holder.release_hard(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_soft_lock_is_best_effort() {
        let store = MemoryStore::new();
        let a = manager(&store, "a", fast_config(5, 10, 3));
        let b = manager(&store, "b", fast_config(5, 10, 3));

        let soft = a.acquire_soft("positions", "p1").await.unwrap().unwrap();
        // No queue, no retry: immediate None.
        assert!(b.acquire_soft("positions", "p1").await.unwrap().is_none());

        a.release_soft(&soft).await.unwrap();
        assert!(b.acquire_soft("positions", "p1").await.unwrap().is_some());

        // Soft locks never block the hard lock.
        assert!(a.acquire_hard("positions", "p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_queue_residue() {
        let store = MemoryStore::new();
        let holder = manager(&store, "holder", fast_config(30, 10, 3));
        let _lock = holder.acquire_hard("positions", "p1").await.unwrap().unwrap();

        let waiter = manager(&store, "waiter", fast_config(30, 5, 3));
        assert!(waiter.acquire_hard("positions", "p1").await.unwrap().is_none());

        let members = store
            .zmembers(&keys::turn_queue("positions", "p1"))
            .await
            .unwrap();
        assert!(members.is_empty(), "timed-out waiter must purge its entries");
    }
}
