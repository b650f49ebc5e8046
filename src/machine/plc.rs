// src/machine/plc.rs - Recoating instance

use super::SIGNAL_RECOATLAYER;
use crate::signal::SignalDefinition;
use crate::statemachine::{InstanceDefinition, StateEnvironment, StateError};
use foundry_shared::{DriverError, ParameterGroup};

pub fn definition(instance: &str) -> InstanceDefinition {
    let mut plc = ParameterGroup::new("plc", "Powder bed axes");
    plc.add("driver", "Driver providing motion control", "axes")
        .add("layerthickness_mm", "Platform step per layer", 0.03)
        .add("recoater_travel_mm", "Recoater stroke", 300.0)
        .add("recoater_speed", "Recoater speed in mm/s", 150.0)
        .add("platform_speed", "Platform speed in mm/s", 5.0)
        .add("recoats", "Layers recoated since start", 0i64);

    InstanceDefinition::new(instance)
        .signal(SignalDefinition::new(SIGNAL_RECOATLAYER).parameter("layerindex").result("success"))
        .parameter_group(plc)
        .state("init", 100, init)
        .state("idle", 10, idle)
        .state("recoating", 1, recoating)
        .out_states("init", &["idle"])
        .out_states("idle", &["idle", "recoating"])
        .out_states("recoating", &["idle"])
}

fn init(env: &mut StateEnvironment) -> Result<(), StateError> {
    let driver = env.get_parameter_string("plc", "driver")?;
    let lease = env.acquire_driver(&driver)?;
    {
        let mut device = lease.lock();
        if !device.is_connected() {
            device.connect()?;
        }
    }
    lease.with_motion_control(|motion| motion.home())?;
    tracing::info!(subsystem = "machine", "{}: axes homed", env.instance_name());
    env.set_next_state("idle");
    Ok(())
}

fn idle(env: &mut StateEnvironment) -> Result<(), StateError> {
    match env.wait_for_signal(SIGNAL_RECOATLAYER, 0)? {
        Some(handler) => {
            env.store_signal("recoatsignal", handler);
            env.set_next_state("recoating");
        }
        None => env.set_next_state("idle"),
    }
    Ok(())
}

fn recoating(env: &mut StateEnvironment) -> Result<(), StateError> {
    let mut handler = env.retrieve_signal("recoatsignal")?;
    let layer = handler.get_int("layerindex")?;
    let driver = env.get_parameter_string("plc", "driver")?;
    let thickness = env.get_parameter_double("plc", "layerthickness_mm")?;
    let travel = env.get_parameter_double("plc", "recoater_travel_mm")?;
    let recoater_speed = env.get_parameter_double("plc", "recoater_speed")?;
    let platform_speed = env.get_parameter_double("plc", "platform_speed")?;

    let lease = env.acquire_driver(&driver)?;
    let outcome = lease.with_motion_control(|motion| -> Result<(), DriverError> {
        let platform = -((layer + 1) as f64) * thickness;
        motion.move_axis("platform", platform, platform_speed)?;
        motion.move_axis("recoater", travel, recoater_speed)?;
        motion.move_axis("recoater", 0.0, recoater_speed)
    });
    drop(lease);

    handler.set_bool_result("success", outcome.is_ok())?;
    handler.signal_handled();
    outcome?;

    let recoats = env.get_parameter_int("plc", "recoats")? + 1;
    env.set_parameter("plc", "recoats", recoats)?;
    env.set_next_state("idle");
    Ok(())
}
