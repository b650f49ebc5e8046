// Shared fixtures for the integration tests
#![allow(dead_code)]

use foundry_rs::drivers::DriverRegistry;
use foundry_rs::persistence::InMemoryPersistence;
use foundry_rs::statemachine::{Runtime, SystemContext};
use foundry_rs::storage::StorageProvider;
use foundry_shared::ParameterValue;
use std::path::Path;
use std::sync::Arc;

pub fn context_with(dir: &Path, drivers: DriverRegistry) -> Arc<SystemContext> {
    Arc::new(
        SystemContext::new(
            StorageProvider::new(dir.join("data")).unwrap(),
            Arc::new(InMemoryPersistence::new()),
            drivers,
            2,
        )
        .unwrap(),
    )
}

pub fn context(dir: &Path) -> Arc<SystemContext> {
    context_with(dir, DriverRegistry::new())
}

/// Current value of a parameter as reported by the status query.
pub fn parameter(runtime: &Runtime, instance: &str, group: &str, name: &str) -> Option<ParameterValue> {
    let status = runtime.instance_status(instance)?;
    let group = status.parameters.iter().find(|g| g.name == group)?;
    group.get(name).ok().cloned()
}
