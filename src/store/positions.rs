//! Position document store collaborator.
//!
//! Schema and migrations live outside this crate; the engine only needs
//! typed reads, partial updates, and the legacy document-level lock flag
//! that is kept alongside the store-backed hard lock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::{Position, PositionUpdate};
use crate::error::{EngineError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Position>>;

    /// Apply a partial update and return the updated document.
    async fn update(
        &self,
        id: &str,
        update: PositionUpdate,
        touch_last_update: bool,
    ) -> Result<Position>;

    /// Fetch and set the legacy `locked_by` flag in one step. Returns None
    /// when the position does not exist or is flagged by another owner.
    async fn get_and_lock(&self, id: &str, owner: &str) -> Result<Option<Position>>;

    /// Clear the legacy flag if held by `owner`.
    async fn unlock(&self, id: &str, owner: &str) -> Result<()>;

    /// Ids of open positions under an exchange connection (used by the
    /// close-all path on authentication failure).
    async fn open_position_ids_for_connection(&self, connection_id: &str) -> Result<Vec<String>>;
}

/// Reference in-memory implementation for tests and paper runs.
#[derive(Clone, Default)]
pub struct MemoryPositionStore {
    positions: Arc<Mutex<HashMap<String, Position>>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, position: Position) {
        self.positions
            .lock()
            .await
            .insert(position.id.clone(), position);
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn get(&self, id: &str) -> Result<Option<Position>> {
        Ok(self.positions.lock().await.get(id).cloned())
    }

    async fn update(
        &self,
        id: &str,
        update: PositionUpdate,
        touch_last_update: bool,
    ) -> Result<Position> {
        let mut positions = self.positions.lock().await;
        let position = positions
            .get_mut(id)
            .ok_or_else(|| EngineError::PositionNotFound(id.to_string()))?;
        update.apply(position, touch_last_update);
        Ok(position.clone())
    }

    async fn get_and_lock(&self, id: &str, owner: &str) -> Result<Option<Position>> {
        let mut positions = self.positions.lock().await;
        let Some(position) = positions.get_mut(id) else {
            return Ok(None);
        };
        match &position.locked_by {
            Some(holder) if holder != owner => Ok(None),
            _ => {
                position.locked_by = Some(owner.to_string());
                Ok(Some(position.clone()))
            }
        }
    }

    async fn unlock(&self, id: &str, owner: &str) -> Result<()> {
        let mut positions = self.positions.lock().await;
        if let Some(position) = positions.get_mut(id) {
            if position.locked_by.as_deref() == Some(owner) {
                position.locked_by = None;
            }
        }
        Ok(())
    }

    async fn open_position_ids_for_connection(&self, connection_id: &str) -> Result<Vec<String>> {
        Ok(self
            .positions
            .lock()
            .await
            .values()
            .filter(|p| p.connection_id == connection_id && !p.closed)
            .map(|p| p.id.clone())
            .collect())
    }
}
