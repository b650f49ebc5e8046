// src/statemachine/instance.rs - The per-instance state loop

use super::definition::ValidatedDefinition;
use super::{StateEnvironment, SystemContext};
use crate::scheduler::panic_message;
use crossbeam_channel::{after, select};
use foundry_shared::ParameterHandler;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// State visible from outside the instance thread.
pub(crate) struct InstanceShared {
    pub(crate) name: String,
    pub(crate) state: Mutex<String>,
    pub(crate) steps: AtomicU64,
    pub(crate) parameters: Arc<Mutex<ParameterHandler>>,
    pub(crate) stopped: AtomicBool,
}

impl InstanceShared {
    pub(crate) fn new(name: &str, initial_state: &str, parameters: ParameterHandler) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(initial_state.to_string()),
            steps: AtomicU64::new(0),
            parameters: Arc::new(Mutex::new(parameters)),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> String {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn publish(&self, state: &str) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        current.clear();
        current.push_str(state);
        drop(current);
        self.steps.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn run(definition: ValidatedDefinition, shared: Arc<InstanceShared>, context: Arc<SystemContext>) {
    let name = definition.name.clone();
    let shutdown = context.signals.shutdown_receiver();
    let mut env = StateEnvironment::new(&name, context.clone(), shared.parameters.clone());
    let mut current = definition.init_state.clone();
    let mut last_start: HashMap<String, Instant> = HashMap::new();

    tracing::info!(subsystem = "statemachine", "{}: starting in state '{}'", name, current);

    loop {
        if context.signals.is_shutdown() {
            break;
        }
        let Some(slot) = definition.states.get(&current) else {
            // Transitions are checked before they are taken.
            tracing::error!(subsystem = "statemachine", "{}: state '{}' vanished", name, current);
            break;
        };

        if let Some(started) = last_start.get(&current) {
            let delay = Duration::from_millis(slot.repeat_delay_ms);
            let elapsed = started.elapsed();
            if elapsed < delay {
                let stop = select! {
                    recv(shutdown) -> _ => true,
                    recv(after(delay - elapsed)) -> _ => false,
                };
                if stop {
                    break;
                }
            }
        }
        last_start.insert(current.clone(), Instant::now());

        env.begin_step(&current);
        let outcome = catch_unwind(AssertUnwindSafe(|| slot.body.execute(&mut env)));
        let next = match outcome {
            Ok(Ok(())) => match env.take_next_state() {
                Some(next) if definition.allows(&current, &next) => next,
                Some(next) => {
                    tracing::error!(
                        subsystem = "statemachine",
                        "{}: transition {} -> {} is not allowed",
                        name,
                        current,
                        next
                    );
                    definition.failed_state.clone()
                }
                None => {
                    tracing::error!(subsystem = "statemachine", "{}: no out state given in '{}'", name, current);
                    definition.failed_state.clone()
                }
            },
            Ok(Err(e)) if e.is_termination() => {
                tracing::debug!(subsystem = "statemachine", "{}: terminated in state '{}'", name, current);
                break;
            }
            Ok(Err(e)) => {
                tracing::error!(subsystem = "statemachine", "{}: state '{}' failed: {}", name, current, e);
                definition.failed_state.clone()
            }
            Err(panic) => {
                tracing::error!(
                    subsystem = "statemachine",
                    "{}: state '{}' panicked: {}",
                    name,
                    current,
                    panic_message(panic.as_ref())
                );
                definition.failed_state.clone()
            }
        };

        if next != current {
            tracing::debug!(subsystem = "statemachine", "{}: state change: {} -> {}", name, current, next);
        }
        shared.publish(&next);
        current = next;
    }

    env.release_all();
    shared.stopped.store(true, Ordering::Release);
    tracing::info!(subsystem = "statemachine", "{}: stopped in state '{}'", name, current);
}
