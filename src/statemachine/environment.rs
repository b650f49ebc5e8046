// src/statemachine/environment.rs - What a state body can reach

use super::{StateError, SystemContext};
use crate::archive::ZipStreamWriter;
use crate::drivers::DriverLease;
use crate::persistence::BuildJobRecord;
use crate::scheduler::{Service, ServiceHandle};
use crate::signal::{SignalHandler, SignalTrigger};
use crate::storage::{StorageProvider, StorageSink};
use crate::toolpath::{ToolpathEntity, ToolpathError};
use crossbeam_channel::{after, select};
use foundry_shared::{ParameterGroup, ParameterHandler, ParameterValue, StorageStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Per-instance environment. It lives as long as the instance thread; the runtime
/// resets the step fields before each state runs.
pub struct StateEnvironment {
    instance: String,
    current_state: String,
    next_state: Option<String>,
    context: Arc<SystemContext>,
    parameters: Arc<Mutex<ParameterHandler>>,
    stored_signals: HashMap<String, SignalHandler>,
    values: ParameterGroup,
    lists: HashMap<String, Vec<ParameterValue>>,
    toolpaths: Vec<Uuid>,
}

impl StateEnvironment {
    pub(crate) fn new(instance: &str, context: Arc<SystemContext>, parameters: Arc<Mutex<ParameterHandler>>) -> Self {
        Self {
            instance: instance.to_string(),
            current_state: String::new(),
            next_state: None,
            context,
            parameters,
            stored_signals: HashMap::new(),
            values: ParameterGroup::new("datastore", ""),
            lists: HashMap::new(),
            toolpaths: Vec::new(),
        }
    }

    pub(crate) fn begin_step(&mut self, state: &str) {
        self.current_state.clear();
        self.current_state.push_str(state);
        self.next_state = None;
    }

    pub(crate) fn take_next_state(&mut self) -> Option<String> {
        self.next_state.take()
    }

    /// Release everything the instance still holds. Stored signals are dropped,
    /// which their raisers observe as abandoned.
    pub(crate) fn release_all(&mut self) {
        if !self.stored_signals.is_empty() {
            tracing::warn!(
                subsystem = "statemachine",
                "{}: dropping {} stored signal(s)",
                self.instance,
                self.stored_signals.len()
            );
            self.stored_signals.clear();
        }
        self.unload_all_toolpaths();
    }

    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn set_next_state(&mut self, state: &str) {
        self.next_state = Some(state.to_string());
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.context
    }

    // Signals

    /// Take a pending signal addressed to this instance. A zero timeout does not block.
    pub fn wait_for_signal(&self, signal: &str, timeout_ms: u64) -> Result<Option<SignalHandler>, StateError> {
        Ok(self.context.signals.wait(&self.instance, signal, timeout_ms)?)
    }

    pub fn prepare_signal(&self, instance: &str, signal: &str) -> Result<SignalTrigger, StateError> {
        Ok(self.context.signals.prepare(instance, signal)?)
    }

    /// Keep a handler across state changes. Replacing a stored handler drops the old one.
    pub fn store_signal(&mut self, key: &str, handler: SignalHandler) {
        self.stored_signals.insert(key.to_string(), handler);
    }

    pub fn retrieve_signal(&mut self, key: &str) -> Result<SignalHandler, StateError> {
        self.stored_signals
            .remove(key)
            .ok_or_else(|| StateError::SignalNotStored(key.to_string()))
    }

    pub fn has_stored_signal(&self, key: &str) -> bool {
        self.stored_signals.contains_key(key)
    }

    // Data store, private to the instance and kept across states

    pub fn store_string(&mut self, key: &str, value: &str) {
        self.values.add(key, "", value);
    }

    pub fn store_uuid(&mut self, key: &str, value: Uuid) {
        self.values.add(key, "", value);
    }

    pub fn store_int(&mut self, key: &str, value: i64) {
        self.values.add(key, "", value);
    }

    pub fn store_double(&mut self, key: &str, value: f64) {
        self.values.add(key, "", value);
    }

    pub fn store_bool(&mut self, key: &str, value: bool) {
        self.values.add(key, "", value);
    }

    pub fn retrieve_string(&self, key: &str) -> Result<String, StateError> {
        Ok(self.values.get_string(key)?)
    }

    pub fn retrieve_uuid(&self, key: &str) -> Result<Uuid, StateError> {
        Ok(self.values.get_uuid(key)?)
    }

    pub fn retrieve_int(&self, key: &str) -> Result<i64, StateError> {
        Ok(self.values.get_int(key)?)
    }

    pub fn retrieve_double(&self, key: &str) -> Result<f64, StateError> {
        Ok(self.values.get_double(key)?)
    }

    pub fn retrieve_bool(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.values.get_bool(key)?)
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.values.has(key)
    }

    pub fn clear_stored_value(&mut self, key: &str) -> bool {
        let list = self.lists.remove(key).is_some();
        self.values.remove(key).is_some() || list
    }

    /// Append to the list stored under `key`, creating it if missing.
    pub fn append_stored_value(&mut self, key: &str, value: impl Into<ParameterValue>) {
        self.lists.entry(key.to_string()).or_default().push(value.into());
    }

    pub fn stored_list_len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, Vec::len)
    }

    /// Remove and return the list stored under `key`; empty when there is none.
    pub fn take_stored_list(&mut self, key: &str) -> Vec<ParameterValue> {
        self.lists.remove(key).unwrap_or_default()
    }

    // Parameters, visible through the status query

    fn parameters(&self) -> MutexGuard<'_, ParameterHandler> {
        self.parameters.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Set a value in `group`, adding it if missing.
    pub fn set_parameter(&self, group: &str, name: &str, value: impl Into<ParameterValue>) -> Result<(), StateError> {
        let mut parameters = self.parameters();
        let group = parameters.group_mut(group)?;
        if group.has(name) {
            group.set(name, value)?;
        } else {
            group.add(name, "", value);
        }
        Ok(())
    }

    pub fn get_parameter_string(&self, group: &str, name: &str) -> Result<String, StateError> {
        Ok(self.parameters().group(group)?.get_string(name)?)
    }

    pub fn get_parameter_uuid(&self, group: &str, name: &str) -> Result<Uuid, StateError> {
        Ok(self.parameters().group(group)?.get_uuid(name)?)
    }

    pub fn get_parameter_int(&self, group: &str, name: &str) -> Result<i64, StateError> {
        Ok(self.parameters().group(group)?.get_int(name)?)
    }

    pub fn get_parameter_double(&self, group: &str, name: &str) -> Result<f64, StateError> {
        Ok(self.parameters().group(group)?.get_double(name)?)
    }

    pub fn get_parameter_bool(&self, group: &str, name: &str) -> Result<bool, StateError> {
        Ok(self.parameters().group(group)?.get_bool(name)?)
    }

    // Drivers and services

    /// Lease a driver for this instance. Dropping the lease releases it.
    pub fn acquire_driver(&self, identifier: &str) -> Result<DriverLease, StateError> {
        Ok(self.context.drivers.acquire(identifier, &self.instance)?)
    }

    pub fn add_service(&self, service: impl Service + 'static) -> Result<ServiceHandle, StateError> {
        let handle = self.context.scheduler.create_service(service);
        self.context.scheduler.add_service_to_queue(&handle)?;
        Ok(handle)
    }

    pub fn build_job(&self, uuid: Uuid) -> Result<BuildJobRecord, StateError> {
        self.context
            .persistence
            .build_job(uuid)?
            .ok_or(StateError::UnknownBuildJob(uuid))
    }

    // Toolpaths

    /// Load the toolpath stored under `stream` and hold one reference for this instance.
    pub fn load_toolpath(&mut self, stream: Uuid) -> Result<Arc<ToolpathEntity>, StateError> {
        let stream = self.context.storage.retrieve(stream)?;
        let entity = self.context.toolpaths.load(stream)?;
        self.toolpaths.push(entity.uuid());
        Ok(entity)
    }

    pub fn unload_toolpath(&mut self, stream: Uuid) -> Result<bool, StateError> {
        let pos = self
            .toolpaths
            .iter()
            .position(|u| *u == stream)
            .ok_or(ToolpathError::NotLoaded(stream))?;
        self.toolpaths.remove(pos);
        Ok(self.context.toolpaths.unload(stream)?)
    }

    pub fn unload_all_toolpaths(&mut self) {
        for uuid in std::mem::take(&mut self.toolpaths) {
            if let Err(e) = self.context.toolpaths.unload(uuid) {
                tracing::warn!(subsystem = "toolpath", "{}: failed to unload {}: {}", self.instance, uuid, e);
            }
        }
    }

    /// A toolpath this instance has loaded.
    pub fn toolpath(&self, stream: Uuid) -> Result<Arc<ToolpathEntity>, StateError> {
        if !self.toolpaths.contains(&stream) {
            return Err(ToolpathError::NotLoaded(stream).into());
        }
        Ok(self
            .context
            .toolpaths
            .find(stream)
            .ok_or(ToolpathError::NotLoaded(stream))?)
    }

    // Storage

    pub fn storage(&self) -> &Arc<StorageProvider> {
        &self.context.storage
    }

    /// Start an archive that becomes a storage stream once finished with `finish_archive`.
    pub fn create_archive(&self, name: &str) -> Result<ZipStreamWriter<StorageSink>, StateError> {
        let sink = self.context.storage.create_sink(name)?;
        Ok(ZipStreamWriter::new(sink))
    }

    pub fn finish_archive(&self, mut archive: ZipStreamWriter<StorageSink>) -> Result<Arc<dyn StorageStream>, StateError> {
        if !archive.is_finished() {
            archive.finish()?;
        }
        Ok(archive.into_inner().finish()?)
    }

    // Timing

    /// Sleep, waking early with `Terminated` when the runtime shuts down.
    pub fn sleep(&self, ms: u64) -> Result<(), StateError> {
        let shutdown = self.context.signals.shutdown_receiver();
        if self.context.signals.is_shutdown() {
            return Err(StateError::Terminated);
        }
        select! {
            recv(shutdown) -> _ => Err(StateError::Terminated),
            recv(after(Duration::from_millis(ms))) -> _ => Ok(()),
        }
    }

    pub fn check_for_termination(&self) -> Result<(), StateError> {
        if self.context.signals.is_shutdown() {
            Err(StateError::Terminated)
        } else {
            Ok(())
        }
    }
}
