// Capability interfaces for machine drivers (shared)

use crate::params::ParameterValue;
use crate::toolpath::LayerData;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DriverError {
    #[error("Driver not found: {0}")]
    NotFound(String),
    #[error("Driver '{driver}' is in use by instance '{owner}'")]
    Busy { driver: String, owner: String },
    #[error("Driver already registered: {0}")]
    Duplicate(String),
    #[error("Driver '{0}' is not connected")]
    NotConnected(String),
    #[error("Driver '{driver}' does not provide {capability}")]
    MissingCapability { driver: String, capability: &'static str },
    #[error("Hardware error: {0}")]
    Hardware(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Summary returned after a layer has been exposed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureReport {
    pub layer_index: usize,
    pub segments: usize,
    pub mark_length_mm: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// 8-bit greyscale, row major.
    pub pixels: Vec<u8>,
}

pub trait PowerControl: Send {
    fn set_power(&mut self, watts: f64) -> Result<(), DriverError>;
    fn power(&self) -> f64;
    fn expose_layer(&mut self, layer: &LayerData) -> Result<ExposureReport, DriverError>;
}

pub trait MotionControl: Send {
    fn move_axis(&mut self, axis: &str, position_mm: f64, speed_mm_s: f64) -> Result<(), DriverError>;
    fn position(&self, axis: &str) -> Result<f64, DriverError>;
    fn home(&mut self) -> Result<(), DriverError>;
    fn is_moving(&self) -> bool;
}

pub trait ImagingSource: Send {
    fn capture_frame(&mut self) -> Result<Frame, DriverError>;
}

/// Base interface every driver implements. Control code asks for a capability and
/// never inspects the concrete type behind it.
pub trait Driver: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    fn set_simulation_mode(&mut self, enabled: bool);
    fn is_simulation_mode(&self) -> bool;
    fn connect(&mut self) -> Result<(), DriverError>;
    fn disconnect(&mut self) -> Result<(), DriverError>;
    fn is_connected(&self) -> bool;

    /// Refresh cached device state.
    fn poll(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn status_parameters(&self) -> Vec<(String, ParameterValue)> {
        Vec::new()
    }

    fn power_control(&mut self) -> Option<&mut dyn PowerControl> {
        None
    }

    fn motion_control(&mut self) -> Option<&mut dyn MotionControl> {
        None
    }

    fn imaging_source(&mut self) -> Option<&mut dyn ImagingSource> {
        None
    }
}
