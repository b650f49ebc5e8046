// src/toolpath/mod.rs - Toolpath entity cache

pub mod decoder;
pub mod entity;

pub use decoder::{GcodeToolpathDecoder, ToolpathDecoder};
pub use entity::{MAX_REFERENCE_COUNT, ToolpathEntity};

use foundry_shared::{StorageError, StorageStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ToolpathError {
    #[error("Invalid toolpath file: {0}")]
    InvalidFile(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Layer {index} out of range (layer count {count})")]
    LayerOutOfRange { index: usize, count: usize },
    #[error("Reference count overflow for toolpath {0}")]
    ReferenceCountOverflow(Uuid),
    #[error("Reference count underflow for toolpath {0}")]
    ReferenceCountUnderflow(Uuid),
    #[error("Toolpath not loaded: {0}")]
    NotLoaded(Uuid),
}

/// Process-wide cache: one decoded entity per stream, shared by every loader.
#[derive(Default)]
pub struct ToolpathHandler {
    entities: Mutex<HashMap<Uuid, Arc<ToolpathEntity>>>,
}

impl ToolpathHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn entities(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<ToolpathEntity>>> {
        self.entities.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load (or reuse) the entity for `stream` and take one reference on it.
    pub fn load(&self, stream: Arc<dyn StorageStream>) -> Result<Arc<ToolpathEntity>, ToolpathError> {
        let uuid = stream.uuid();
        {
            let entities = self.entities();
            if let Some(existing) = entities.get(&uuid) {
                existing.inc_ref()?;
                return Ok(existing.clone());
            }
        }

        // Decode without holding the map lock; a racing loader may win, in which case
        // its entity is used and ours is dropped.
        let decoded = Arc::new(ToolpathEntity::open(stream)?);
        let entity = {
            let mut entities = self.entities();
            let entity = entities.entry(uuid).or_insert_with(|| decoded.clone()).clone();
            entity.inc_ref()?;
            entity
        };
        if Arc::ptr_eq(&entity, &decoded) {
            tracing::info!(
                subsystem = "toolpath",
                "loaded toolpath {} ({} layers)",
                uuid,
                entity.layer_count()
            );
        }
        Ok(entity)
    }

    /// Drop one reference. Returns true when the entity was evicted.
    pub fn unload(&self, uuid: Uuid) -> Result<bool, ToolpathError> {
        let mut entities = self.entities();
        let entity = entities.get(&uuid).ok_or(ToolpathError::NotLoaded(uuid))?;
        let released = entity.dec_ref()?;
        if released {
            entities.remove(&uuid);
            tracing::info!(subsystem = "toolpath", "unloaded toolpath {}", uuid);
        }
        Ok(released)
    }

    pub fn find(&self, uuid: Uuid) -> Option<Arc<ToolpathEntity>> {
        self.entities().get(&uuid).cloned()
    }

    pub fn is_loaded(&self, uuid: Uuid) -> bool {
        self.entities().contains_key(&uuid)
    }

    pub fn loaded_count(&self) -> usize {
        self.entities().len()
    }
}
