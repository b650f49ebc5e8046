// src/statemachine/runtime.rs - Starting, observing and stopping instances

use super::definition::InstanceDefinition;
use super::instance::{self, InstanceShared};
use super::RuntimeError;
use crate::drivers::DriverRegistry;
use crate::persistence::BuildJobPersistence;
use crate::scheduler::{SchedulerError, ServiceHandler};
use crate::signal::SignalBus;
use crate::storage::StorageProvider;
use crate::toolpath::ToolpathHandler;
use foundry_shared::{ParameterGroup, ParameterHandler};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Process-wide collaborators shared by every instance and service.
pub struct SystemContext {
    pub signals: Arc<SignalBus>,
    pub drivers: Arc<DriverRegistry>,
    pub scheduler: Arc<ServiceHandler>,
    pub toolpaths: Arc<ToolpathHandler>,
    pub storage: Arc<StorageProvider>,
    pub persistence: Arc<dyn BuildJobPersistence>,
}

impl SystemContext {
    pub fn new(
        storage: StorageProvider,
        persistence: Arc<dyn BuildJobPersistence>,
        drivers: DriverRegistry,
        max_service_threads: usize,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            signals: Arc::new(SignalBus::new()),
            drivers: Arc::new(drivers),
            scheduler: ServiceHandler::new(max_service_threads)?,
            toolpaths: Arc::new(ToolpathHandler::new()),
            storage: Arc::new(storage),
            persistence,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub state: String,
    pub steps: u64,
    pub running: bool,
    pub parameters: Vec<ParameterGroup>,
}

struct InstanceHandle {
    shared: Arc<InstanceShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct Runtime {
    context: Arc<SystemContext>,
    instances: Vec<InstanceHandle>,
    stopped: AtomicBool,
}

impl Runtime {
    /// Validate every definition, register its signals and start one thread per instance.
    pub fn start(context: Arc<SystemContext>, definitions: Vec<InstanceDefinition>) -> Result<Self, RuntimeError> {
        let mut names = HashSet::new();
        let mut validated = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !names.insert(definition.name().to_string()) {
                return Err(RuntimeError::DuplicateInstance(definition.name().to_string()));
            }
            validated.push(definition.validate()?);
        }

        let mut prepared = Vec::with_capacity(validated.len());
        for definition in validated {
            for signal in &definition.signals {
                context.signals.define(&definition.name, signal.clone())?;
            }
            let mut parameters = ParameterHandler::new();
            for group in &definition.parameters {
                parameters.add_group(group.clone())?;
            }
            let shared = Arc::new(InstanceShared::new(&definition.name, &definition.init_state, parameters));
            prepared.push((definition, shared));
        }

        let mut runtime = Self {
            context: context.clone(),
            instances: Vec::with_capacity(prepared.len()),
            stopped: AtomicBool::new(false),
        };
        for (definition, shared) in prepared {
            let thread_shared = shared.clone();
            let thread_context = context.clone();
            let spawned = thread::Builder::new()
                .name(format!("instance-{}", definition.name))
                .spawn(move || instance::run(definition, thread_shared, thread_context));
            match spawned {
                Ok(thread) => runtime.instances.push(InstanceHandle {
                    shared,
                    thread: Mutex::new(Some(thread)),
                }),
                Err(e) => {
                    runtime.shutdown();
                    return Err(e.into());
                }
            }
        }
        tracing::info!(subsystem = "statemachine", "started {} instance(s)", runtime.instances.len());
        Ok(runtime)
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.context
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.shared.name.clone()).collect()
    }

    pub fn status(&self) -> Vec<InstanceStatus> {
        self.instances
            .iter()
            .map(|i| InstanceStatus {
                name: i.shared.name.clone(),
                state: i.shared.state(),
                steps: i.shared.steps.load(Ordering::Acquire),
                running: !i.shared.stopped.load(Ordering::Acquire),
                parameters: i
                    .shared
                    .parameters
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .groups()
                    .to_vec(),
            })
            .collect()
    }

    pub fn instance_status(&self, name: &str) -> Option<InstanceStatus> {
        self.status().into_iter().find(|s| s.name == name)
    }

    /// Poll the status until `instance` reports `state`.
    pub fn wait_for_state(&self, instance: &str, state: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.instance_status(instance).is_some_and(|s| s.state == state) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stop signals and services, then join every instance thread. Safe to call twice.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(subsystem = "statemachine", "shutting down runtime");
        self.context.signals.shutdown();
        self.context.scheduler.shutdown();
        for instance in &self.instances {
            let thread = instance.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    tracing::error!(subsystem = "statemachine", "{}: instance thread panicked", instance.shared.name);
                }
            }
        }
        self.context.drivers.disconnect_all();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
