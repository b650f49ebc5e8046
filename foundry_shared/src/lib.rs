// foundry_shared: shared traits and types for the host runtime, simulator and tests

pub mod config;
pub mod gcode;
pub mod hardware_traits;
pub mod params;
pub mod storage;
pub mod toolpath;

pub use hardware_traits::{Driver, DriverError, ExposureReport, Frame, ImagingSource, MotionControl, PowerControl};
pub use params::{ParameterError, ParameterGroup, ParameterHandler, ParameterValue};
pub use storage::{FileStream, MemoryStream, StorageError, StorageStream, StreamReader};
pub use toolpath::{DiscretePoint, LayerData, Segment, SegmentType};

// TimeInterface lets simulated drivers run against a virtual clock.
pub trait TimeInterface: Send + Sync {
    fn now_monotonic(&self) -> std::time::Instant;
    fn sleep(&self, duration: std::time::Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl TimeInterface for WallClock {
    fn now_monotonic(&self) -> std::time::Instant {
        std::time::Instant::now()
    }
    fn sleep(&self, duration: std::time::Duration) {
        std::thread::sleep(duration)
    }
}
