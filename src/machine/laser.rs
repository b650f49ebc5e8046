// src/machine/laser.rs - Layer exposure instance

use super::SIGNAL_EXPOSURE;
use crate::signal::SignalDefinition;
use crate::statemachine::{InstanceDefinition, StateEnvironment, StateError};
use foundry_shared::{ExposureReport, ParameterGroup};
use uuid::Uuid;

pub fn definition(instance: &str) -> InstanceDefinition {
    let mut laser = ParameterGroup::new("laser", "Scanner configuration");
    laser
        .add("driver", "Driver providing power control", "scanner")
        .add("power_w", "Default laser power", 200.0)
        .add("layersexposed", "Layers exposed since start", 0i64);

    InstanceDefinition::new(instance)
        .signal(
            SignalDefinition::new(SIGNAL_EXPOSURE)
                .parameter("jobuuid")
                .parameter("layerindex")
                .result("success")
                .result("segments")
                .result("marklength")
                .result("duration"),
        )
        .parameter_group(laser)
        .state("init", 100, init)
        .state("idle", 10, idle)
        .state("exposure", 1, exposure)
        .out_states("init", &["idle"])
        .out_states("idle", &["idle", "exposure"])
        .out_states("exposure", &["idle"])
}

fn init(env: &mut StateEnvironment) -> Result<(), StateError> {
    let driver = env.get_parameter_string("laser", "driver")?;
    let power = env.get_parameter_double("laser", "power_w")?;
    let lease = env.acquire_driver(&driver)?;
    {
        let mut device = lease.lock();
        if !device.is_connected() {
            device.connect()?;
        }
    }
    if lease.is_simulation_mode() {
        tracing::info!(subsystem = "machine", "{}: laser '{}' in simulation mode", env.instance_name(), driver);
    }
    lease.with_power_control(|control| control.set_power(power))?;
    env.set_next_state("idle");
    Ok(())
}

fn idle(env: &mut StateEnvironment) -> Result<(), StateError> {
    match env.wait_for_signal(SIGNAL_EXPOSURE, 0)? {
        Some(handler) => {
            env.store_signal("exposuresignal", handler);
            env.set_next_state("exposure");
        }
        None => env.set_next_state("idle"),
    }
    Ok(())
}

fn exposure(env: &mut StateEnvironment) -> Result<(), StateError> {
    let mut handler = env.retrieve_signal("exposuresignal")?;
    let job = handler.get_uuid("jobuuid")?;
    let layer = handler.get_int("layerindex")?;

    match expose_layer(env, job, layer) {
        Ok(report) => {
            handler.set_bool_result("success", true)?;
            handler.set_int_result("segments", report.segments as i64)?;
            handler.set_double_result("marklength", report.mark_length_mm)?;
            handler.set_double_result("duration", report.duration_s)?;
            handler.signal_handled();
            let exposed = env.get_parameter_int("laser", "layersexposed")? + 1;
            env.set_parameter("laser", "layersexposed", exposed)?;
            tracing::debug!(
                subsystem = "machine",
                "{}: layer {} exposed ({:.1} mm in {:.3} s)",
                env.instance_name(),
                layer,
                report.mark_length_mm,
                report.duration_s
            );
            env.set_next_state("idle");
            Ok(())
        }
        Err(e) => {
            handler.set_bool_result("success", false)?;
            handler.signal_handled();
            Err(e)
        }
    }
}

fn expose_layer(env: &mut StateEnvironment, job: Uuid, layer: i64) -> Result<ExposureReport, StateError> {
    let index = usize::try_from(layer).map_err(|_| StateError::failed(format!("invalid layer index {}", layer)))?;
    let record = env.build_job(job)?;
    let toolpath = env.load_toolpath(record.storage_stream)?;
    let data = toolpath.read_layer(index);
    drop(toolpath);
    env.unload_toolpath(record.storage_stream)?;
    let data = data?;

    let driver = env.get_parameter_string("laser", "driver")?;
    let lease = env.acquire_driver(&driver)?;
    Ok(lease.with_power_control(|control| control.expose_layer(&data))?)
}
