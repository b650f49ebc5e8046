//! Simulated recoater / build platform axes.

use crate::event_queue::{EventSink, SimClock, SimEventType};
use foundry_shared::{Driver, DriverError, MotionControl, ParameterValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct AxisState {
    pub position_mm: f64,
    pub min_mm: f64,
    pub max_mm: f64,
    pub max_speed_mm_s: f64,
    pub homed: bool,
}

impl AxisState {
    pub fn new(min_mm: f64, max_mm: f64, max_speed_mm_s: f64) -> Self {
        Self {
            position_mm: 0.0,
            min_mm,
            max_mm,
            max_speed_mm_s,
            homed: false,
        }
    }
}

pub struct SimulatedAxes {
    name: String,
    simulation: bool,
    connected: bool,
    axes: BTreeMap<String, AxisState>,
    clock: SimClock,
    events: EventSink,
}

impl SimulatedAxes {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            simulation: true,
            connected: false,
            axes: BTreeMap::new(),
            clock: SimClock::new(),
            events: EventSink::disabled(),
        }
    }

    /// Recoater blade (`recoater`) plus build platform (`platform`).
    pub fn powder_bed(name: &str) -> Self {
        Self::new(name)
            .with_axis("recoater", AxisState::new(0.0, 400.0, 200.0))
            .with_axis("platform", AxisState::new(-300.0, 0.0, 5.0))
    }

    pub fn with_axis(mut self, axis: &str, state: AxisState) -> Self {
        self.axes.insert(axis.to_string(), state);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.clock.current_time.as_secs_f64()
    }
}

impl MotionControl for SimulatedAxes {
    fn move_axis(&mut self, axis: &str, position_mm: f64, speed_mm_s: f64) -> Result<(), DriverError> {
        if !self.connected {
            return Err(DriverError::NotConnected(self.name.clone()));
        }
        let state = self
            .axes
            .get_mut(axis)
            .ok_or_else(|| DriverError::InvalidArgument(format!("unknown axis '{}'", axis)))?;
        if !state.homed {
            return Err(DriverError::Hardware(format!("axis '{}' is not homed", axis)));
        }
        if position_mm < state.min_mm || position_mm > state.max_mm {
            return Err(DriverError::InvalidArgument(format!(
                "axis '{}' target {} mm outside {}..{}",
                axis, position_mm, state.min_mm, state.max_mm
            )));
        }
        if speed_mm_s <= 0.0 {
            return Err(DriverError::InvalidArgument("speed must be positive".to_string()));
        }
        let speed = speed_mm_s.min(state.max_speed_mm_s);
        let distance = (position_mm - state.position_mm).abs();
        state.position_mm = position_mm;
        self.clock.advance_secs(distance / speed);
        self.events.emit(&self.clock, SimEventType::AxisMoved {
            driver: self.name.clone(),
            axis: axis.to_string(),
            position_mm,
        });
        Ok(())
    }

    fn position(&self, axis: &str) -> Result<f64, DriverError> {
        self.axes
            .get(axis)
            .map(|a| a.position_mm)
            .ok_or_else(|| DriverError::InvalidArgument(format!("unknown axis '{}'", axis)))
    }

    fn home(&mut self) -> Result<(), DriverError> {
        if !self.connected {
            return Err(DriverError::NotConnected(self.name.clone()));
        }
        for state in self.axes.values_mut() {
            state.position_mm = 0.0;
            state.homed = true;
        }
        self.events.emit(&self.clock, SimEventType::Homed { driver: self.name.clone() });
        Ok(())
    }

    fn is_moving(&self) -> bool {
        // Moves complete synchronously in simulation.
        false
    }
}

impl Driver for SimulatedAxes {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &str {
        "axes"
    }
    fn set_simulation_mode(&mut self, enabled: bool) {
        self.simulation = enabled;
    }
    fn is_simulation_mode(&self) -> bool {
        self.simulation
    }
    fn connect(&mut self) -> Result<(), DriverError> {
        if !self.simulation {
            return Err(DriverError::Hardware(format!("{}: no PLC link configured", self.name)));
        }
        self.connected = true;
        self.events.emit(&self.clock, SimEventType::Connected { driver: self.name.clone() });
        Ok(())
    }
    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.connected = false;
        self.events.emit(&self.clock, SimEventType::Disconnected { driver: self.name.clone() });
        Ok(())
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
    fn status_parameters(&self) -> Vec<(String, ParameterValue)> {
        self.axes
            .iter()
            .map(|(axis, state)| (format!("{}_position", axis), ParameterValue::Double(state.position_mm)))
            .collect()
    }
    fn motion_control(&mut self) -> Option<&mut dyn MotionControl> {
        Some(self)
    }
}
