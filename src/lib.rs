// src/lib.rs - Machine control runtime: state machine instances, signals, services, toolpaths and archives

pub mod archive;
pub mod drivers;
pub mod file_manager;
pub mod machine;
pub mod persistence;
pub mod scheduler;
pub mod signal;
pub mod statemachine;
pub mod storage;
pub mod toolpath;

pub use archive::{ArchiveError, ZipStreamWriter};
pub use persistence::{BuildJobPersistence, BuildJobRecord, InMemoryPersistence, JsonFilePersistence};
pub use scheduler::{Service, ServiceContext, ServiceHandle, ServiceHandler};
pub use signal::{SignalBus, SignalDefinition, SignalError, SignalHandler, SignalTrigger};
pub use statemachine::{InstanceDefinition, Runtime, StateEnvironment, StateError, SystemContext};
pub use toolpath::{ToolpathEntity, ToolpathHandler};
