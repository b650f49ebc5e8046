// src/statemachine/mod.rs - State-machine instance runtime

pub mod definition;
pub mod environment;
mod instance;
pub mod runtime;

pub use definition::{DEFAULT_FAILED_STATE, DEFAULT_INIT_STATE, InstanceDefinition, MAX_REPEAT_DELAY_MS, State};
pub use environment::StateEnvironment;
pub use runtime::{InstanceStatus, Runtime, SystemContext};

use crate::archive::ArchiveError;
use crate::persistence::PersistenceError;
use crate::scheduler::SchedulerError;
use crate::signal::SignalError;
use crate::toolpath::ToolpathError;
use foundry_shared::{DriverError, ParameterError, StorageError};
use thiserror::Error;
use uuid::Uuid;

/// Anything a state body can fail with. Returning any of these sends the instance
/// to its failed state, except termination.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
    #[error("Toolpath error: {0}")]
    Toolpath(#[from] ToolpathError),
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("No signal stored under '{0}'")]
    SignalNotStored(String),
    #[error("Unknown build job: {0}")]
    UnknownBuildJob(Uuid),
    #[error("Terminated")]
    Terminated,
    #[error("{0}")]
    Failed(String),
}

impl StateError {
    pub fn failed(message: impl Into<String>) -> Self {
        StateError::Failed(message.into())
    }

    /// True when the error only reports that the runtime is stopping.
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            StateError::Terminated | StateError::Signal(SignalError::Terminated) | StateError::Signal(SignalError::ShuttingDown)
        )
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Instance '{0}' has no states")]
    NoStates(String),
    #[error("Instance '{instance}' defines state '{state}' twice")]
    DuplicateState { instance: String, state: String },
    #[error("Instance '{instance}' references unknown state '{state}'")]
    UnknownState { instance: String, state: String },
    #[error("Invalid repeat delay {delay_ms} ms for state '{state}' (1..={max} ms)", max = MAX_REPEAT_DELAY_MS)]
    InvalidRepeatDelay { state: String, delay_ms: u64 },
    #[error("Instance '{0}' defined twice")]
    DuplicateInstance(String),
    #[error("Unknown state set '{0}'")]
    UnknownStateSet(String),
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Failed to spawn instance thread: {0}")]
    Spawn(#[from] std::io::Error),
}
