// src/drivers/mod.rs - Driver registry and per-instance leases

use foundry_shared::{Driver, DriverError, ImagingSource, MotionControl, ParameterValue, PowerControl};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

struct DriverSlot {
    identifier: String,
    driver: Mutex<Box<dyn Driver>>,
    // (instance, live lease count)
    owner: Mutex<Option<(String, usize)>>,
}

impl DriverSlot {
    fn driver(&self) -> MutexGuard<'_, Box<dyn Driver>> {
        self.driver.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn owner(&self) -> MutexGuard<'_, Option<(String, usize)>> {
        self.owner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub identifier: String,
    pub kind: String,
    pub simulation: bool,
    pub connected: bool,
    pub leased_by: Option<String>,
    pub parameters: Vec<(String, ParameterValue)>,
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<BTreeMap<String, Arc<DriverSlot>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identifier: &str, driver: Box<dyn Driver>) -> Result<(), DriverError> {
        let mut drivers = self.drivers.write().unwrap_or_else(|p| p.into_inner());
        if drivers.contains_key(identifier) {
            return Err(DriverError::Duplicate(identifier.to_string()));
        }
        tracing::info!(
            subsystem = "drivers",
            "registered driver '{}' ({}, simulation: {})",
            identifier,
            driver.kind(),
            driver.is_simulation_mode()
        );
        drivers.insert(
            identifier.to_string(),
            Arc::new(DriverSlot {
                identifier: identifier.to_string(),
                driver: Mutex::new(driver),
                owner: Mutex::new(None),
            }),
        );
        Ok(())
    }

    fn slot(&self, identifier: &str) -> Result<Arc<DriverSlot>, DriverError> {
        self.drivers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(identifier)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(identifier.to_string()))
    }

    /// Lease a driver for `instance`. Fails while another instance holds it; the same
    /// instance may hold several leases at once.
    pub fn acquire(&self, identifier: &str, instance: &str) -> Result<DriverLease, DriverError> {
        let slot = self.slot(identifier)?;
        {
            let mut owner = slot.owner();
            match owner.as_mut() {
                Some((holder, count)) if holder == instance => *count += 1,
                Some((holder, _)) => {
                    return Err(DriverError::Busy {
                        driver: identifier.to_string(),
                        owner: holder.clone(),
                    });
                }
                None => *owner = Some((instance.to_string(), 1)),
            }
        }
        Ok(DriverLease {
            slot,
            instance: instance.to_string(),
        })
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.drivers.read().unwrap_or_else(|p| p.into_inner()).keys().cloned().collect()
    }

    /// Connect every driver. Failures are logged and returned, the rest still connect.
    pub fn connect_all(&self) -> Vec<(String, DriverError)> {
        let slots: Vec<Arc<DriverSlot>> = self.drivers.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect();
        let mut failures = Vec::new();
        for slot in slots {
            if let Err(e) = slot.driver().connect() {
                tracing::error!(subsystem = "drivers", "failed to connect '{}': {}", slot.identifier, e);
                failures.push((slot.identifier.clone(), e));
            }
        }
        failures
    }

    pub fn disconnect_all(&self) {
        let slots: Vec<Arc<DriverSlot>> = self.drivers.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect();
        for slot in slots {
            if let Err(e) = slot.driver().disconnect() {
                tracing::warn!(subsystem = "drivers", "failed to disconnect '{}': {}", slot.identifier, e);
            }
        }
    }

    pub fn set_simulation_mode(&self, identifier: &str, enabled: bool) -> Result<(), DriverError> {
        self.slot(identifier)?.driver().set_simulation_mode(enabled);
        Ok(())
    }

    pub fn status(&self) -> Vec<DriverStatus> {
        let slots: Vec<Arc<DriverSlot>> = self.drivers.read().unwrap_or_else(|p| p.into_inner()).values().cloned().collect();
        slots
            .iter()
            .map(|slot| {
                let leased_by = slot.owner().as_ref().map(|(holder, _)| holder.clone());
                let driver = slot.driver();
                DriverStatus {
                    identifier: slot.identifier.clone(),
                    kind: driver.kind().to_string(),
                    simulation: driver.is_simulation_mode(),
                    connected: driver.is_connected(),
                    leased_by,
                    parameters: driver.status_parameters(),
                }
            })
            .collect()
    }
}

/// Exclusive access to one driver for one instance. Dropping the lease releases it.
pub struct DriverLease {
    slot: Arc<DriverSlot>,
    instance: String,
}

impl DriverLease {
    pub fn identifier(&self) -> &str {
        &self.slot.identifier
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Driver>> {
        self.slot.driver()
    }

    pub fn is_simulation_mode(&self) -> bool {
        self.lock().is_simulation_mode()
    }

    pub fn with_power_control<R>(
        &self,
        f: impl FnOnce(&mut dyn PowerControl) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut driver = self.lock();
        let control = driver.power_control().ok_or_else(|| self.missing("power control"))?;
        f(control)
    }

    pub fn with_motion_control<R>(
        &self,
        f: impl FnOnce(&mut dyn MotionControl) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut driver = self.lock();
        let control = driver.motion_control().ok_or_else(|| self.missing("motion control"))?;
        f(control)
    }

    pub fn with_imaging_source<R>(
        &self,
        f: impl FnOnce(&mut dyn ImagingSource) -> Result<R, DriverError>,
    ) -> Result<R, DriverError> {
        let mut driver = self.lock();
        let source = driver.imaging_source().ok_or_else(|| self.missing("an imaging source"))?;
        f(source)
    }

    fn missing(&self, capability: &'static str) -> DriverError {
        DriverError::MissingCapability {
            driver: self.slot.identifier.clone(),
            capability,
        }
    }
}

impl Drop for DriverLease {
    fn drop(&mut self) {
        let mut owner = self.slot.owner();
        if let Some((_, count)) = owner.as_mut() {
            *count -= 1;
            if *count == 0 {
                *owner = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_simulator::{SimulatedAxes, SimulatedScanner};

    fn registry() -> DriverRegistry {
        let registry = DriverRegistry::new();
        registry.register("scanner", Box::new(SimulatedScanner::new("scanner", 400.0))).unwrap();
        registry.register("plc", Box::new(SimulatedAxes::powder_bed("plc"))).unwrap();
        registry
    }

    #[test]
    fn lease_is_exclusive_per_instance() {
        let registry = registry();
        let lease = registry.acquire("scanner", "laser").unwrap();
        let again = registry.acquire("scanner", "laser").unwrap();
        assert!(matches!(registry.acquire("scanner", "main"), Err(DriverError::Busy { .. })));
        drop(lease);
        assert!(registry.acquire("scanner", "main").is_err());
        drop(again);
        assert!(registry.acquire("scanner", "main").is_ok());
    }

    #[test]
    fn capability_lookup() {
        let registry = registry();
        assert!(registry.connect_all().is_empty());
        let lease = registry.acquire("plc", "plc").unwrap();
        assert!(matches!(
            lease.with_power_control(|p| p.set_power(10.0)),
            Err(DriverError::MissingCapability { .. })
        ));
        lease.with_motion_control(|m| m.home()).unwrap();
        assert!(matches!(registry.acquire("camera", "x"), Err(DriverError::NotFound(_))));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = registry();
        let err = registry
            .register("plc", Box::new(SimulatedAxes::powder_bed("plc")))
            .unwrap_err();
        assert_eq!(err, DriverError::Duplicate("plc".to_string()));
        let status = registry.status();
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.simulation));
    }
}
