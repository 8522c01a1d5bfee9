//! In-memory `KvStore` for tests and paper runs.
//!
//! Every operation takes one mutex guard, which makes the compare-ops
//! (`set_nx`, `del_if_value`, `zswap`) trivially atomic. TTLs are honoured
//! lazily on read.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::KvStore;
use crate::error::Result;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, HashMap<String, f64>>,
    queues: HashMap<String, VecDeque<String>>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        if let Some((_, Some(expires_at))) = self.strings.get(key) {
            if *expires_at <= Instant::now() {
                self.strings.remove(key);
                return None;
            }
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn sorted_members(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

/// Shared in-memory store; clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_value(key).cloned())
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.live_value(key) {
            Some(current) if current == value => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sorted_members(key)
            .iter()
            .position(|(m, _)| m == member)
            .map(|rank| rank as u64))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sorted_members(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .collect())
    }

    async fn zmembers(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let inner = self.inner.lock().await;
        Ok(inner.sorted_members(key))
    }

    async fn zswap(
        &self,
        key: &str,
        old_member: &str,
        new_member: &str,
        score: f64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let set = inner.zsets.entry(key.to_string()).or_default();
        if set.remove(old_member).is_none() {
            return Ok(false);
        }
        set.insert(new_member.to_string(), score);
        Ok(true)
    }

    async fn queue_push(&self, queue: &str, payload: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn queue_pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(payload) = inner
                    .queues
                    .get_mut(queue)
                    .and_then(|items| items.pop_front())
                {
                    return Ok(Some(payload));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
