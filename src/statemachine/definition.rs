// src/statemachine/definition.rs - States and instance definitions

use super::{RuntimeError, StateEnvironment, StateError};
use crate::signal::SignalDefinition;
use foundry_shared::{ParameterError, ParameterGroup, ParameterValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const DEFAULT_INIT_STATE: &str = "init";
pub const DEFAULT_FAILED_STATE: &str = "fatalerror";
pub const MAX_REPEAT_DELAY_MS: u64 = 3_600_000;
const FAILED_STATE_DELAY_MS: u64 = 1000;

/// One state body. Must call `env.set_next_state` before returning `Ok`.
pub trait State: Send + Sync {
    fn execute(&self, env: &mut StateEnvironment) -> Result<(), StateError>;
}

impl<F> State for F
where
    F: Fn(&mut StateEnvironment) -> Result<(), StateError> + Send + Sync,
{
    fn execute(&self, env: &mut StateEnvironment) -> Result<(), StateError> {
        self(env)
    }
}

pub(crate) struct StateSlot {
    pub(crate) name: String,
    pub(crate) repeat_delay_ms: u64,
    pub(crate) body: Arc<dyn State>,
}

pub struct InstanceDefinition {
    name: String,
    states: Vec<StateSlot>,
    out_states: HashMap<String, Vec<String>>,
    init_state: String,
    failed_state: String,
    signals: Vec<SignalDefinition>,
    parameters: Vec<ParameterGroup>,
}

impl InstanceDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            states: Vec::new(),
            out_states: HashMap::new(),
            init_state: DEFAULT_INIT_STATE.to_string(),
            failed_state: DEFAULT_FAILED_STATE.to_string(),
            signals: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn state(mut self, name: &str, repeat_delay_ms: u64, body: impl State + 'static) -> Self {
        self.states.push(StateSlot {
            name: name.to_string(),
            repeat_delay_ms,
            body: Arc::new(body),
        });
        self
    }

    /// Restrict where `state` may transition. The failed state is always reachable.
    pub fn out_states(mut self, state: &str, targets: &[&str]) -> Self {
        self.out_states
            .insert(state.to_string(), targets.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn init_state(mut self, name: &str) -> Self {
        self.init_state = name.to_string();
        self
    }

    pub fn failed_state(mut self, name: &str) -> Self {
        self.failed_state = name.to_string();
        self
    }

    pub fn signal(mut self, definition: SignalDefinition) -> Self {
        self.signals.push(definition);
        self
    }

    pub fn parameter_group(mut self, group: ParameterGroup) -> Self {
        self.parameters.push(group);
        self
    }

    /// Override a value in an already declared parameter group.
    pub fn with_parameter(mut self, group: &str, name: &str, value: ParameterValue) -> Result<Self, RuntimeError> {
        let target = self
            .parameters
            .iter_mut()
            .find(|g| g.name == group)
            .ok_or_else(|| ParameterError::GroupNotFound(group.to_string()))?;
        target.add(name, "", value);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signals(&self) -> &[SignalDefinition] {
        &self.signals
    }

    pub fn parameter_groups(&self) -> &[ParameterGroup] {
        &self.parameters
    }

    pub(crate) fn validate(mut self) -> Result<ValidatedDefinition, RuntimeError> {
        if self.states.is_empty() {
            return Err(RuntimeError::NoStates(self.name));
        }
        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.name.as_str()) {
                return Err(RuntimeError::DuplicateState {
                    instance: self.name.clone(),
                    state: state.name.clone(),
                });
            }
            if state.repeat_delay_ms == 0 || state.repeat_delay_ms > MAX_REPEAT_DELAY_MS {
                return Err(RuntimeError::InvalidRepeatDelay {
                    state: state.name.clone(),
                    delay_ms: state.repeat_delay_ms,
                });
            }
        }

        if !self.states.iter().any(|s| s.name == self.failed_state) {
            let failed = self.failed_state.clone();
            self.states.push(StateSlot {
                name: failed.clone(),
                repeat_delay_ms: FAILED_STATE_DELAY_MS,
                body: Arc::new(move |env: &mut StateEnvironment| -> Result<(), StateError> {
                    env.set_next_state(&failed);
                    Ok(())
                }),
            });
        }

        let known: HashSet<&str> = self.states.iter().map(|s| s.name.as_str()).collect();
        let unknown = |state: &str| RuntimeError::UnknownState {
            instance: self.name.clone(),
            state: state.to_string(),
        };
        if !known.contains(self.init_state.as_str()) {
            return Err(unknown(&self.init_state));
        }
        for (from, targets) in &self.out_states {
            if !known.contains(from.as_str()) {
                return Err(unknown(from));
            }
            if let Some(target) = targets.iter().find(|t| !known.contains(t.as_str())) {
                return Err(unknown(target));
            }
        }

        Ok(ValidatedDefinition {
            states: self.states.into_iter().map(|s| (s.name.clone(), s)).collect(),
            name: self.name,
            out_states: self.out_states,
            init_state: self.init_state,
            failed_state: self.failed_state,
            signals: self.signals,
            parameters: self.parameters,
        })
    }
}

pub(crate) struct ValidatedDefinition {
    pub(crate) name: String,
    pub(crate) states: HashMap<String, StateSlot>,
    pub(crate) out_states: HashMap<String, Vec<String>>,
    pub(crate) init_state: String,
    pub(crate) failed_state: String,
    pub(crate) signals: Vec<SignalDefinition>,
    pub(crate) parameters: Vec<ParameterGroup>,
}

impl ValidatedDefinition {
    pub(crate) fn allows(&self, from: &str, to: &str) -> bool {
        if !self.states.contains_key(to) {
            return false;
        }
        if to == self.failed_state {
            return true;
        }
        match self.out_states.get(from) {
            Some(targets) => targets.iter().any(|t| t == to),
            None => true,
        }
    }
}
