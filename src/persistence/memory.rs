//! In-memory position store.

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{HedgeFilter, PositionStore, TriangularFilter};
use crate::error::{ArbError, Result};
use crate::position::{HedgePosition, TriangularPosition};

#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    hedges: RwLock<HashMap<Uuid, HedgePosition>>,
    triangular: RwLock<HashMap<Uuid, TriangularPosition>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create_hedge(&self, position: &HedgePosition) -> Result<()> {
        let mut hedges = self.hedges.write().await;
        if hedges.contains_key(&position.id) {
            return Err(ArbError::Store(anyhow!("hedge position {} already exists", position.id)));
        }
        hedges.insert(position.id, position.clone());
        Ok(())
    }

    async fn update_hedge(&self, position: &HedgePosition) -> Result<()> {
        match self.hedges.write().await.get_mut(&position.id) {
            Some(slot) => {
                *slot = position.clone();
                Ok(())
            }
            None => Err(ArbError::NotFound(format!("hedge position {}", position.id))),
        }
    }

    async fn get_hedge(&self, id: Uuid) -> Result<Option<HedgePosition>> {
        Ok(self.hedges.read().await.get(&id).cloned())
    }

    async fn find_hedges(&self, filter: &HedgeFilter) -> Result<Vec<HedgePosition>> {
        let mut found: Vec<HedgePosition> = self
            .hedges
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn create_triangular(&self, position: &TriangularPosition) -> Result<()> {
        let mut positions = self.triangular.write().await;
        if positions.contains_key(&position.id) {
            return Err(ArbError::Store(anyhow!(
                "triangular position {} already exists",
                position.id
            )));
        }
        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn update_triangular(&self, position: &TriangularPosition) -> Result<()> {
        match self.triangular.write().await.get_mut(&position.id) {
            Some(slot) => {
                *slot = position.clone();
                Ok(())
            }
            None => Err(ArbError::NotFound(format!("triangular position {}", position.id))),
        }
    }

    async fn get_triangular(&self, id: Uuid) -> Result<Option<TriangularPosition>> {
        Ok(self.triangular.read().await.get(&id).cloned())
    }

    async fn find_triangular(&self, filter: &TriangularFilter) -> Result<Vec<TriangularPosition>> {
        let mut found: Vec<TriangularPosition> = self
            .triangular
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn delete_triangular(&self, id: Uuid) -> Result<bool> {
        Ok(self.triangular.write().await.remove(&id).is_some())
    }
}
