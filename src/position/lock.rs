//! Single-writer ownership of positions.

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ArbError, Result};

/// Tracks which positions are owned by an in-flight operation.
///
/// Shared by the executor and the monitor so that no two operations mutate
/// the same position at once. A second claim is refused, never queued.
#[derive(Debug, Clone, Default)]
pub struct PositionLocks {
    held: Arc<DashMap<Uuid, &'static str>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for `operation`. Fails with `Busy` if already claimed.
    pub fn try_acquire(&self, id: Uuid, operation: &'static str) -> Result<PositionGuard> {
        match self.held.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(ArbError::Busy(format!(
                "position {id} is locked by {}",
                e.get()
            ))),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(operation);
                Ok(PositionGuard {
                    id,
                    held: self.held.clone(),
                })
            }
        }
    }

    pub fn is_held(&self, id: Uuid) -> bool {
        self.held.contains_key(&id)
    }
}

/// Releases the claim on drop.
#[derive(Debug)]
pub struct PositionGuard {
    id: Uuid,
    held: Arc<DashMap<Uuid, &'static str>>,
}

impl Drop for PositionGuard {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}
