//! Simulated drivers for running machine control logic without hardware.

pub mod axis;
pub mod build_file;
pub mod camera;
pub mod event_queue;
pub mod scanner;

pub use axis::SimulatedAxes;
pub use build_file::BuildFileSpec;
pub use camera::SimulatedCamera;
pub use event_queue::{EventSink, SimClock, SimEvent, SimEventQueue, SimEventType};
pub use scanner::SimulatedScanner;

use foundry_shared::config::DriverConfig;
use foundry_shared::{Driver, DriverError};

/// Build a simulated driver for a configured driver kind.
pub fn build_driver(config: &DriverConfig, events: EventSink) -> Result<Box<dyn Driver>, DriverError> {
    let mut driver: Box<dyn Driver> = match config.kind.as_str() {
        "scanner" => Box::new(SimulatedScanner::new(&config.identifier, 500.0).with_events(events)),
        "axes" => Box::new(SimulatedAxes::powder_bed(&config.identifier).with_events(events)),
        "camera" => Box::new(SimulatedCamera::new(&config.identifier, 64, 64).with_events(events)),
        other => {
            return Err(DriverError::InvalidArgument(format!("unknown driver kind '{}'", other)));
        }
    };
    driver.set_simulation_mode(config.simulation);
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_by_kind() {
        let config = DriverConfig {
            identifier: "laser1".to_string(),
            kind: "scanner".to_string(),
            simulation: true,
        };
        let mut driver = build_driver(&config, EventSink::disabled()).unwrap();
        assert_eq!(driver.name(), "laser1");
        assert!(driver.power_control().is_some());
        assert!(driver.motion_control().is_none());

        let bad = DriverConfig { kind: "extruder".to_string(), ..config };
        assert!(build_driver(&bad, EventSink::disabled()).is_err());
    }
}
