// src/signal/mod.rs - Cross-instance signal bus
//
// Every (instance, signal) pair owns a mailbox of capacity one plus an outstanding flag.
// A raiser gets a completion channel back; the handler side answers on it exactly once,
// or drops it, which the raiser sees as an abandoned signal.

use crossbeam_channel::{Receiver, RecvError, Sender, TryRecvError, after, bounded, select};
use foundry_shared::{ParameterError, ParameterGroup, ParameterValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SignalError {
    #[error("Unknown signal '{signal}' for instance '{instance}'")]
    UnknownSignal { instance: String, signal: String },
    #[error("Signal '{signal}' already defined for instance '{instance}'")]
    DuplicateSignal { instance: String, signal: String },
    #[error("Signal '{0}' is already triggered and not yet handled")]
    AlreadyTriggered(String),
    #[error("Signal '{0}' has not been triggered")]
    NotTriggered(String),
    #[error("Signal '{0}' has not been handled")]
    NotHandled(String),
    #[error("Signal '{0}' was dropped without being handled")]
    Abandoned(String),
    #[error("Unknown parameter '{parameter}' for signal '{signal}'")]
    UnknownParameter { signal: String, parameter: String },
    #[error("Unknown result '{result}' for signal '{signal}'")]
    UnknownResult { signal: String, result: String },
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
    #[error("Signal bus is shutting down")]
    ShuttingDown,
    #[error("Terminated")]
    Terminated,
}

/// Declared shape of a signal: the parameter names a raiser may set and the result
/// names a handler may set.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    pub name: String,
    pub parameters: Vec<String>,
    pub results: Vec<String>,
}

impl SignalDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn parameter(mut self, name: &str) -> Self {
        self.parameters.push(name.to_string());
        self
    }

    pub fn result(mut self, name: &str) -> Self {
        self.results.push(name.to_string());
        self
    }
}

/// Clears the slot's outstanding flag when the message it travels with is gone.
struct OutstandingGuard(Arc<AtomicBool>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SignalMessage {
    id: Uuid,
    parameters: ParameterGroup,
    completion: Sender<ParameterGroup>,
    guard: Option<OutstandingGuard>,
}

struct SignalSlot {
    instance: String,
    definition: SignalDefinition,
    mailbox_tx: Sender<SignalMessage>,
    mailbox_rx: Receiver<SignalMessage>,
    outstanding: Arc<AtomicBool>,
}

pub struct SignalBus {
    slots: RwLock<HashMap<(String, String), Arc<SignalSlot>>>,
    accepting: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            slots: RwLock::new(HashMap::new()),
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    pub fn define(&self, instance: &str, definition: SignalDefinition) -> Result<(), SignalError> {
        let key = (instance.to_string(), definition.name.clone());
        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        if slots.contains_key(&key) {
            return Err(SignalError::DuplicateSignal {
                instance: instance.to_string(),
                signal: definition.name,
            });
        }
        let (mailbox_tx, mailbox_rx) = bounded(1);
        slots.insert(
            key,
            Arc::new(SignalSlot {
                instance: instance.to_string(),
                definition,
                mailbox_tx,
                mailbox_rx,
                outstanding: Arc::new(AtomicBool::new(false)),
            }),
        );
        Ok(())
    }

    fn slot(&self, instance: &str, signal: &str) -> Result<Arc<SignalSlot>, SignalError> {
        let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
        slots
            .get(&(instance.to_string(), signal.to_string()))
            .cloned()
            .ok_or_else(|| SignalError::UnknownSignal {
                instance: instance.to_string(),
                signal: signal.to_string(),
            })
    }

    pub fn is_defined(&self, instance: &str, signal: &str) -> bool {
        self.slot(instance, signal).is_ok()
    }

    /// Prepare a signal addressed to `instance`.
    pub fn prepare(&self, instance: &str, signal: &str) -> Result<SignalTrigger, SignalError> {
        let slot = self.slot(instance, signal)?;
        Ok(SignalTrigger {
            parameters: ParameterGroup::new(signal, ""),
            slot,
            accepting: self.accepting.clone(),
            shutdown: self.shutdown_rx.clone(),
            pending: None,
            results: None,
        })
    }

    /// Take the pending signal, if any, without blocking.
    pub fn poll(&self, instance: &str, signal: &str) -> Result<Option<SignalHandler>, SignalError> {
        if self.is_shutdown() {
            return Err(SignalError::Terminated);
        }
        let slot = self.slot(instance, signal)?;
        match slot.mailbox_rx.try_recv() {
            Ok(message) => Ok(Some(SignalHandler::new(&slot, message))),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Wait up to `timeout_ms` for a signal. A zero timeout polls.
    pub fn wait(&self, instance: &str, signal: &str, timeout_ms: u64) -> Result<Option<SignalHandler>, SignalError> {
        if timeout_ms == 0 {
            return self.poll(instance, signal);
        }
        if self.is_shutdown() {
            return Err(SignalError::Terminated);
        }
        let slot = self.slot(instance, signal)?;
        let timeout = after(Duration::from_millis(timeout_ms));
        select! {
            recv(slot.mailbox_rx) -> message => Ok(message.ok().map(|m| SignalHandler::new(&slot, m))),
            recv(self.shutdown_rx) -> _ => Err(SignalError::Terminated),
            recv(timeout) -> _ => Ok(None),
        }
    }

    /// Stop accepting triggers and wake every waiter.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let sender = self.shutdown_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        if sender.is_some() {
            tracing::info!(subsystem = "signal", "signal bus shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    /// Receiver that disconnects when the bus shuts down. Usable in `select!` for
    /// interruptible sleeps.
    pub fn shutdown_receiver(&self) -> Receiver<()> {
        self.shutdown_rx.clone()
    }

    /// Signals currently raised but not yet handled, as (instance, signal) pairs.
    pub fn outstanding(&self) -> Vec<(String, String)> {
        let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<(String, String)> = slots
            .values()
            .filter(|s| s.outstanding.load(Ordering::Acquire))
            .map(|s| (s.instance.clone(), s.definition.name.clone()))
            .collect();
        out.sort();
        out
    }
}

/// Raiser side of a signal.
pub struct SignalTrigger {
    slot: Arc<SignalSlot>,
    accepting: Arc<AtomicBool>,
    shutdown: Receiver<()>,
    parameters: ParameterGroup,
    pending: Option<(Uuid, Receiver<ParameterGroup>)>,
    results: Option<ParameterGroup>,
}

impl SignalTrigger {
    pub fn name(&self) -> &str {
        &self.slot.definition.name
    }

    pub fn instance(&self) -> &str {
        &self.slot.instance
    }

    fn set(&mut self, name: &str, value: ParameterValue) -> Result<(), SignalError> {
        if !self.slot.definition.parameters.iter().any(|p| p == name) {
            return Err(SignalError::UnknownParameter {
                signal: self.slot.definition.name.clone(),
                parameter: name.to_string(),
            });
        }
        self.parameters.add(name, "", value);
        Ok(())
    }

    pub fn set_string(&mut self, name: &str, value: &str) -> Result<(), SignalError> {
        self.set(name, ParameterValue::String(value.to_string()))
    }

    pub fn set_uuid(&mut self, name: &str, value: Uuid) -> Result<(), SignalError> {
        self.set(name, ParameterValue::Uuid(value))
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> Result<(), SignalError> {
        self.set(name, ParameterValue::Int(value))
    }

    pub fn set_double(&mut self, name: &str, value: f64) -> Result<(), SignalError> {
        self.set(name, ParameterValue::Double(value))
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<(), SignalError> {
        self.set(name, ParameterValue::Bool(value))
    }

    pub fn can_trigger(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.slot.outstanding.load(Ordering::Acquire)
    }

    pub fn signal_id(&self) -> Option<Uuid> {
        self.pending.as_ref().map(|(id, _)| *id)
    }

    /// Raise the signal. Fails while a previous signal of the same name is unhandled.
    pub fn trigger(&mut self) -> Result<Uuid, SignalError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SignalError::ShuttingDown);
        }
        let name = self.slot.definition.name.clone();
        if self
            .slot
            .outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SignalError::AlreadyTriggered(name));
        }
        let guard = OutstandingGuard(self.slot.outstanding.clone());
        let id = Uuid::new_v4();
        let (completion, completed) = bounded(1);
        let message = SignalMessage {
            id,
            parameters: self.parameters.clone(),
            completion,
            guard: Some(guard),
        };
        // The flag guarantees the single mailbox place is free.
        if self.slot.mailbox_tx.try_send(message).is_err() {
            return Err(SignalError::AlreadyTriggered(name));
        }
        self.pending = Some((id, completed));
        self.results = None;
        tracing::debug!(subsystem = "signal", "triggered {} -> {}.{}", id, self.slot.instance, name);
        Ok(id)
    }

    /// Block until the handler completes the signal. Returns false on timeout; the
    /// signal stays pending and can be waited on again. Bus shutdown ends the wait
    /// with `Terminated`, unless the signal was already completed or abandoned.
    pub fn wait_for_handling(&mut self, timeout_ms: u64) -> Result<bool, SignalError> {
        let name = self.slot.definition.name.clone();
        let (_, completed) = self.pending.as_ref().ok_or_else(|| SignalError::NotTriggered(name.clone()))?;
        let outcome = match completed.try_recv() {
            Ok(results) => Ok(results),
            Err(TryRecvError::Disconnected) => Err(RecvError),
            Err(TryRecvError::Empty) => {
                let timeout = after(Duration::from_millis(timeout_ms));
                select! {
                    recv(completed) -> results => results,
                    recv(self.shutdown) -> _ => return Err(SignalError::Terminated),
                    recv(timeout) -> _ => return Ok(false),
                }
            }
        };
        match outcome {
            Ok(results) => {
                self.results = Some(results);
                self.pending = None;
                Ok(true)
            }
            Err(RecvError) => {
                self.pending = None;
                Err(SignalError::Abandoned(name))
            }
        }
    }

    fn results(&self) -> Result<&ParameterGroup, SignalError> {
        self.results
            .as_ref()
            .ok_or_else(|| SignalError::NotHandled(self.slot.definition.name.clone()))
    }

    pub fn get_string_result(&self, name: &str) -> Result<String, SignalError> {
        Ok(self.results()?.get_string(name)?)
    }

    pub fn get_uuid_result(&self, name: &str) -> Result<Uuid, SignalError> {
        Ok(self.results()?.get_uuid(name)?)
    }

    pub fn get_int_result(&self, name: &str) -> Result<i64, SignalError> {
        Ok(self.results()?.get_int(name)?)
    }

    pub fn get_double_result(&self, name: &str) -> Result<f64, SignalError> {
        Ok(self.results()?.get_double(name)?)
    }

    pub fn get_bool_result(&self, name: &str) -> Result<bool, SignalError> {
        Ok(self.results()?.get_bool(name)?)
    }
}

/// Receiving side of one raised signal. Completing it consumes the handler.
pub struct SignalHandler {
    message: SignalMessage,
    name: String,
    result_names: Vec<String>,
    results: ParameterGroup,
}

impl SignalHandler {
    fn new(slot: &SignalSlot, message: SignalMessage) -> Self {
        Self {
            name: slot.definition.name.clone(),
            result_names: slot.definition.results.clone(),
            results: ParameterGroup::new(&slot.definition.name, ""),
            message,
        }
    }

    pub fn signal_id(&self) -> Uuid {
        self.message.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &ParameterGroup {
        &self.message.parameters
    }

    pub fn get_string(&self, name: &str) -> Result<String, SignalError> {
        Ok(self.message.parameters.get_string(name)?)
    }

    pub fn get_uuid(&self, name: &str) -> Result<Uuid, SignalError> {
        Ok(self.message.parameters.get_uuid(name)?)
    }

    pub fn get_int(&self, name: &str) -> Result<i64, SignalError> {
        Ok(self.message.parameters.get_int(name)?)
    }

    pub fn get_double(&self, name: &str) -> Result<f64, SignalError> {
        Ok(self.message.parameters.get_double(name)?)
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, SignalError> {
        Ok(self.message.parameters.get_bool(name)?)
    }

    fn set_result(&mut self, name: &str, value: ParameterValue) -> Result<(), SignalError> {
        if !self.result_names.iter().any(|r| r == name) {
            return Err(SignalError::UnknownResult {
                signal: self.name.clone(),
                result: name.to_string(),
            });
        }
        self.results.add(name, "", value);
        Ok(())
    }

    pub fn set_string_result(&mut self, name: &str, value: &str) -> Result<(), SignalError> {
        self.set_result(name, ParameterValue::String(value.to_string()))
    }

    pub fn set_uuid_result(&mut self, name: &str, value: Uuid) -> Result<(), SignalError> {
        self.set_result(name, ParameterValue::Uuid(value))
    }

    pub fn set_int_result(&mut self, name: &str, value: i64) -> Result<(), SignalError> {
        self.set_result(name, ParameterValue::Int(value))
    }

    pub fn set_double_result(&mut self, name: &str, value: f64) -> Result<(), SignalError> {
        self.set_result(name, ParameterValue::Double(value))
    }

    pub fn set_bool_result(&mut self, name: &str, value: bool) -> Result<(), SignalError> {
        self.set_result(name, ParameterValue::Bool(value))
    }

    /// Deliver the results to the raiser.
    pub fn signal_handled(mut self) {
        // Free the slot before waking the raiser so it can trigger again immediately.
        drop(self.message.guard.take());
        let results = std::mem::replace(&mut self.results, ParameterGroup::new(&self.name, ""));
        // A raiser that stopped waiting has dropped its receiver; nothing to deliver.
        let _ = self.message.completion.send(results);
        tracing::debug!(subsystem = "signal", "handled {} ({})", self.message.id, self.name);
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        if self.message.guard.is_some() {
            tracing::warn!(subsystem = "signal", "signal {} ({}) dropped without being handled", self.message.id, self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn bus() -> SignalBus {
        let bus = SignalBus::new();
        bus.define(
            "laser",
            SignalDefinition::new("signal_exposure").parameter("layerindex").result("success"),
        )
        .unwrap();
        bus
    }

    #[test]
    fn only_one_outstanding_signal_per_name() {
        let bus = bus();
        let mut first = bus.prepare("laser", "signal_exposure").unwrap();
        first.set_int("layerindex", 0).unwrap();
        first.trigger().unwrap();
        let mut second = bus.prepare("laser", "signal_exposure").unwrap();
        assert!(!second.can_trigger());
        assert_eq!(second.trigger(), Err(SignalError::AlreadyTriggered("signal_exposure".into())));

        let handler = bus.poll("laser", "signal_exposure").unwrap().unwrap();
        // still outstanding while a handler holds it
        assert!(second.trigger().is_err());
        handler.signal_handled();
        assert!(second.trigger().is_ok());
    }

    #[test]
    fn results_reach_the_raiser() {
        let bus = Arc::new(bus());
        let mut trigger = bus.prepare("laser", "signal_exposure").unwrap();
        trigger.set_int("layerindex", 7).unwrap();
        trigger.trigger().unwrap();

        let worker = {
            let bus = bus.clone();
            thread::spawn(move || {
                let mut handler = bus.wait("laser", "signal_exposure", 1000).unwrap().unwrap();
                assert_eq!(handler.get_int("layerindex").unwrap(), 7);
                handler.set_bool_result("success", true).unwrap();
                handler.signal_handled();
            })
        };
        assert!(trigger.wait_for_handling(5000).unwrap());
        assert!(trigger.get_bool_result("success").unwrap());
        worker.join().unwrap();
    }

    #[test]
    fn undeclared_names_are_rejected() {
        let bus = bus();
        let mut trigger = bus.prepare("laser", "signal_exposure").unwrap();
        assert!(matches!(trigger.set_bool("bogus", true), Err(SignalError::UnknownParameter { .. })));
        trigger.trigger().unwrap();
        let mut handler = bus.poll("laser", "signal_exposure").unwrap().unwrap();
        assert!(matches!(handler.set_int_result("bogus", 1), Err(SignalError::UnknownResult { .. })));
        assert!(matches!(handler.get_int("layerindex"), Err(SignalError::Parameter(_))));
        handler.signal_handled();
        assert!(bus.prepare("laser", "nope").is_err());
    }

    #[test]
    fn dropped_handler_abandons_signal() {
        let bus = bus();
        let mut trigger = bus.prepare("laser", "signal_exposure").unwrap();
        trigger.trigger().unwrap();
        let handler = bus.poll("laser", "signal_exposure").unwrap().unwrap();
        drop(handler);
        assert_eq!(
            trigger.wait_for_handling(100),
            Err(SignalError::Abandoned("signal_exposure".into()))
        );
        assert!(trigger.can_trigger());
    }

    #[test]
    fn wait_times_out_and_shutdown_wakes() {
        let bus = Arc::new(bus());
        assert!(bus.wait("laser", "signal_exposure", 20).unwrap().is_none());

        let waiter = {
            let bus = bus.clone();
            thread::spawn(move || bus.wait("laser", "signal_exposure", 60_000).err())
        };
        thread::sleep(Duration::from_millis(50));
        bus.shutdown();
        assert_eq!(waiter.join().unwrap(), Some(SignalError::Terminated));
        let mut trigger = bus.prepare("laser", "signal_exposure").unwrap();
        assert_eq!(trigger.trigger(), Err(SignalError::ShuttingDown));
    }

    #[test]
    fn shutdown_wakes_a_waiting_raiser() {
        let bus = Arc::new(bus());
        let mut trigger = bus.prepare("laser", "signal_exposure").unwrap();
        trigger.trigger().unwrap();
        let raiser = thread::spawn(move || {
            let started = std::time::Instant::now();
            (trigger.wait_for_handling(60_000), started.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        bus.shutdown();
        let (outcome, waited) = raiser.join().unwrap();
        assert_eq!(outcome, Err(SignalError::Terminated));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn handling_timeout_keeps_signal_pending() {
        let bus = bus();
        let mut trigger = bus.prepare("laser", "signal_exposure").unwrap();
        trigger.trigger().unwrap();
        assert!(!trigger.wait_for_handling(10).unwrap());
        assert_eq!(bus.outstanding(), vec![("laser".to_string(), "signal_exposure".to_string())]);
        let handler = bus.poll("laser", "signal_exposure").unwrap().unwrap();
        handler.signal_handled();
        assert!(trigger.wait_for_handling(10).unwrap());
        assert!(bus.outstanding().is_empty());
    }
}
