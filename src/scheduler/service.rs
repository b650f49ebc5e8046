// src/scheduler/service.rs - Service trait, handles and the execution context

use super::{SchedulerError, ServiceHandler};
use crate::persistence::PersistenceError;
use crate::signal::SignalError;
use crate::toolpath::ToolpathError;
use foundry_shared::StorageError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Toolpath error: {0}")]
    Toolpath(#[from] ToolpathError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("{0}")]
    Failed(String),
}

/// A unit of background work. `execute` runs once, on its own worker thread.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, ctx: &ServiceContext) -> Result<(), ServiceError>;
}

pub(super) struct ServiceEntry {
    pub(super) id: Uuid,
    pub(super) owner: Uuid,
    pub(super) service: Box<dyn Service>,
    pub(super) submitted: AtomicBool,
    pub(super) running: AtomicBool,
    pub(super) executed: AtomicBool,
}

/// Shared handle to a service created by a [`ServiceHandler`].
#[derive(Clone)]
pub struct ServiceHandle {
    pub(super) entry: Arc<ServiceEntry>,
}

impl ServiceHandle {
    pub(super) fn new(owner: Uuid, service: Box<dyn Service>) -> Self {
        Self {
            entry: Arc::new(ServiceEntry {
                id: Uuid::new_v4(),
                owner,
                service,
                submitted: AtomicBool::new(false),
                running: AtomicBool::new(false),
                executed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    pub fn name(&self) -> &str {
        self.entry.service.name()
    }

    pub fn is_running(&self) -> bool {
        self.entry.running.load(Ordering::Acquire)
    }

    /// True once the body has returned, whether it succeeded, failed or panicked.
    pub fn has_executed(&self) -> bool {
        self.entry.executed.load(Ordering::Acquire)
    }

    pub(super) fn owner(&self) -> Uuid {
        self.entry.owner
    }

    /// Marks the handle as queued. Only the first call succeeds; a handle runs once.
    pub(super) fn mark_submitted(&self) -> bool {
        self.entry
            .submitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(super) fn set_running(&self, running: bool) {
        self.entry.running.store(running, Ordering::Release);
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.entry.id)
            .field("name", &self.name())
            .field("running", &self.is_running())
            .finish()
    }
}

/// What a running service sees of its surroundings.
pub struct ServiceContext {
    pub(super) handler: Arc<ServiceHandler>,
    pub(super) service_id: Uuid,
}

impl ServiceContext {
    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    pub fn handler(&self) -> &Arc<ServiceHandler> {
        &self.handler
    }

    /// Create and enqueue a follow-up service on the same handler.
    pub fn add_service(&self, service: impl Service + 'static) -> Result<ServiceHandle, SchedulerError> {
        let handle = self.handler.create_service(service);
        self.handler.add_service_to_queue(&handle)?;
        Ok(handle)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.handler.is_shutting_down()
    }
}
