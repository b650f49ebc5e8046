//! Simulated powder-bed camera.

use crate::event_queue::{EventSink, SimClock, SimEventType};
use foundry_shared::{Driver, DriverError, Frame, ImagingSource, ParameterValue};

pub struct SimulatedCamera {
    name: String,
    simulation: bool,
    connected: bool,
    width: u32,
    height: u32,
    frames: u64,
    clock: SimClock,
    events: EventSink,
}

impl SimulatedCamera {
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            simulation: true,
            connected: false,
            width,
            height,
            frames: 0,
            clock: SimClock::new(),
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }
}

impl ImagingSource for SimulatedCamera {
    fn capture_frame(&mut self) -> Result<Frame, DriverError> {
        if !self.connected {
            return Err(DriverError::NotConnected(self.name.clone()));
        }
        self.frames += 1;
        // Diagonal gradient shifted by frame number, so consecutive frames differ.
        let shift = self.frames as u32;
        let mut pixels = Vec::with_capacity((self.width * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                pixels.push(((x + y + shift) % 256) as u8);
            }
        }
        self.clock.advance_secs(0.05);
        self.events.emit(&self.clock, SimEventType::FrameCaptured {
            driver: self.name.clone(),
            frame: self.frames,
        });
        Ok(Frame {
            width: self.width,
            height: self.height,
            pixels,
        })
    }
}

impl Driver for SimulatedCamera {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> &str {
        "camera"
    }
    fn set_simulation_mode(&mut self, enabled: bool) {
        self.simulation = enabled;
    }
    fn is_simulation_mode(&self) -> bool {
        self.simulation
    }
    fn connect(&mut self) -> Result<(), DriverError> {
        if !self.simulation {
            return Err(DriverError::Hardware(format!("{}: no camera attached", self.name)));
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
        vec![("frames".to_string(), ParameterValue::Int(self.frames as i64))]
    }
    fn imaging_source(&mut self) -> Option<&mut dyn ImagingSource> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_have_requested_size() {
        let mut camera = SimulatedCamera::new("camera", 16, 8);
        camera.connect().unwrap();
        let frame = camera.capture_frame().unwrap();
        assert_eq!(frame.pixels.len(), 128);
        let next = camera.capture_frame().unwrap();
        assert_ne!(frame.pixels, next.pixels);
    }
}
