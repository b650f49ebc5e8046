//! Simulated galvo scanner with a laser source.

use crate::event_queue::{EventSink, SimClock, SimEventType};
use foundry_shared::{Driver, DriverError, ExposureReport, LayerData, ParameterValue, PowerControl};
use std::sync::Arc;
use foundry_shared::TimeInterface;

/// First-order thermal model of the laser source. Heats proportionally to output
/// power and cools towards ambient; trips above `max_temp`.
#[derive(Debug, Clone)]
pub struct LaserThermalState {
    pub current_temp: f64,
    pub ambient: f64,
    pub max_temp: f64,
    pub tripped: bool,
}

impl LaserThermalState {
    pub fn new(ambient: f64, max_temp: f64) -> Self {
        Self {
            current_temp: ambient,
            ambient,
            max_temp,
            tripped: false,
        }
    }

    pub fn update(&mut self, power_fraction: f64, dt: f64) {
        let heat_gain = power_fraction * 8.0 * dt;
        let heat_loss = 0.05 * (self.current_temp - self.ambient) * dt;
        self.current_temp += heat_gain - heat_loss;
        if self.current_temp > self.max_temp {
            self.tripped = true;
        }
    }
}

pub struct SimulatedScanner {
    name: String,
    simulation: bool,
    connected: bool,
    max_power: f64,
    power: f64,
    default_speed_mm_s: f64,
    layers_exposed: u64,
    thermal: LaserThermalState,
    clock: SimClock,
    events: EventSink,
    realtime: Option<(Arc<dyn TimeInterface>, f64)>,
}

impl SimulatedScanner {
    pub fn new(name: &str, max_power: f64) -> Self {
        Self {
            name: name.to_string(),
            simulation: true,
            connected: false,
            max_power,
            power: 0.0,
            default_speed_mm_s: 1000.0,
            layers_exposed: 0,
            thermal: LaserThermalState::new(25.0, 80.0),
            clock: SimClock::new(),
            events: EventSink::disabled(),
            realtime: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Sleep `factor` times the computed exposure duration on every layer.
    pub fn with_realtime(mut self, time: Arc<dyn TimeInterface>, factor: f64) -> Self {
        self.realtime = Some((time, factor));
        self
    }

    pub fn layers_exposed(&self) -> u64 {
        self.layers_exposed
    }

    pub fn thermal(&self) -> &LaserThermalState {
        &self.thermal
    }

    fn ensure_ready(&self) -> Result<(), DriverError> {
        if !self.connected {
            return Err(DriverError::NotConnected(self.name.clone()));
        }
        if self.thermal.tripped {
            return Err(DriverError::Hardware(format!(
                "laser source over temperature ({:.1} C)",
                self.thermal.current_temp
            )));
        }
        Ok(())
    }
}

impl PowerControl for SimulatedScanner {
    fn set_power(&mut self, watts: f64) -> Result<(), DriverError> {
        if !(0.0..=self.max_power).contains(&watts) {
            return Err(DriverError::InvalidArgument(format!(
                "power {} W outside 0..={} W",
                watts, self.max_power
            )));
        }
        self.power = watts;
        self.events.emit(&self.clock, SimEventType::PowerChanged {
            driver: self.name.clone(),
            watts,
        });
        Ok(())
    }

    fn power(&self) -> f64 {
        self.power
    }

    fn expose_layer(&mut self, layer: &LayerData) -> Result<ExposureReport, DriverError> {
        self.ensure_ready()?;
        let mut duration_s = 0.0;
        let mut weighted_power = 0.0;
        for segment in &layer.segments {
            let single = LayerData {
                index: layer.index,
                z: layer.z,
                units_mm: layer.units_mm,
                segments: vec![segment.clone()],
            };
            let length = single.mark_length_mm();
            let speed = segment.speed.filter(|s| *s > 0.0).unwrap_or(self.default_speed_mm_s);
            let power = segment.power.unwrap_or(self.power).min(self.max_power);
            let t = length / speed;
            duration_s += t;
            weighted_power += power * t;
        }
        let mark_length_mm = layer.mark_length_mm();
        if duration_s > 0.0 {
            self.thermal.update(weighted_power / duration_s / self.max_power, duration_s);
        }
        self.clock.advance_secs(duration_s);
        if self.thermal.tripped {
            let message = format!("over temperature during layer {}", layer.index);
            self.events.emit(&self.clock, SimEventType::Fault {
                driver: self.name.clone(),
                message: message.clone(),
            });
            return Err(DriverError::Hardware(message));
        }
        if let Some((time, factor)) = &self.realtime {
            time.sleep(std::time::Duration::from_secs_f64((duration_s * factor).max(0.0)));
        }
        self.layers_exposed += 1;
        self.events.emit(&self.clock, SimEventType::LayerExposed {
            driver: self.name.clone(),
            layer: layer.index,
            segments: layer.segment_count(),
            mark_length_mm,
        });
        tracing::debug!(subsystem = "drivers", "{}: exposed layer {} ({:.1} mm)", self.name, layer.index, mark_length_mm);
        Ok(ExposureReport {
            layer_index: layer.index,
            segments: layer.segment_count(),
            mark_length_mm,
            duration_s,
        })
    }
}

impl Driver for SimulatedScanner {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &str {
        "scanner"
    }
    fn set_simulation_mode(&mut self, enabled: bool) {
        self.simulation = enabled;
    }
    fn is_simulation_mode(&self) -> bool {
        self.simulation
    }
    fn connect(&mut self) -> Result<(), DriverError> {
        if !self.simulation {
            return Err(DriverError::Hardware(format!("{}: no scanner card attached", self.name)));
        }
        self.connected = true;
        self.events.emit(&self.clock, SimEventType::Connected { driver: self.name.clone() });
        Ok(())
    }
    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.connected = false;
        self.power = 0.0;
        self.events.emit(&self.clock, SimEventType::Disconnected { driver: self.name.clone() });
        Ok(())
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
    fn poll(&mut self) -> Result<(), DriverError> {
        // Idle cooling between layers.
        self.thermal.update(0.0, 1.0);
        Ok(())
    }
    fn status_parameters(&self) -> Vec<(String, ParameterValue)> {
        vec![
            ("power".to_string(), ParameterValue::Double(self.power)),
            ("source_temperature".to_string(), ParameterValue::Double(self.thermal.current_temp)),
            ("layers_exposed".to_string(), ParameterValue::Int(self.layers_exposed as i64)),
        ]
    }
    fn power_control(&mut self) -> Option<&mut dyn PowerControl> {
        Some(self)
    }
}
