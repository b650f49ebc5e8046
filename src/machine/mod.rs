// src/machine/mod.rs - Powder-bed fusion demo machine
//
// Three cooperating instances: `main` sequences the build, `laser` exposes layers and
// `plc` recoats. They only talk through signals.

pub mod laser;
pub mod main;
pub mod plc;

use crate::statemachine::{InstanceDefinition, RuntimeError};
use foundry_shared::config::InstanceConfig;

pub const SIGNAL_STARTBUILD: &str = "signal_startbuild";
pub const SIGNAL_BUILDREADY: &str = "signal_buildready";
pub const SIGNAL_EXPOSURE: &str = "signal_exposure";
pub const SIGNAL_RECOATLAYER: &str = "signal_recoatlayer";

pub const STATE_SETS: &[&str] = &["main", "laser", "plc"];

/// Build the definition for a registered state set under the given instance name.
pub fn state_set(state_set: &str, instance: &str) -> Result<InstanceDefinition, RuntimeError> {
    match state_set {
        "main" => Ok(main::definition(instance)),
        "laser" => Ok(laser::definition(instance)),
        "plc" => Ok(plc::definition(instance)),
        other => Err(RuntimeError::UnknownStateSet(other.to_string())),
    }
}

/// Definition for a configured instance, with its parameter overrides applied.
pub fn instance_from_config(config: &InstanceConfig) -> Result<InstanceDefinition, RuntimeError> {
    let mut definition = state_set(&config.state_set, &config.name)?;
    for (group, values) in &config.parameters {
        for (name, value) in values {
            definition = definition.with_parameter(group, name, value.clone())?;
        }
    }
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_shared::ParameterValue;
    use std::collections::BTreeMap;

    #[test]
    fn overrides_apply_to_declared_groups_only() {
        let mut laser = BTreeMap::new();
        laser.insert("driver".to_string(), ParameterValue::from("scanner2"));
        let mut config = InstanceConfig {
            name: "laser".to_string(),
            state_set: "laser".to_string(),
            parameters: BTreeMap::new(),
        };
        config.parameters.insert("laser".to_string(), laser.clone());
        let definition = instance_from_config(&config).unwrap();
        let group = definition.parameter_groups().iter().find(|g| g.name == "laser").unwrap();
        assert_eq!(group.get_string("driver").unwrap(), "scanner2");

        config.parameters.clear();
        config.parameters.insert("nope".to_string(), laser);
        assert!(instance_from_config(&config).is_err());
        config.state_set = "welder".to_string();
        assert!(matches!(instance_from_config(&config), Err(RuntimeError::UnknownStateSet(_))));
    }

    #[test]
    fn sample_configuration_builds_every_instance() {
        let config: foundry_shared::config::Config = toml::from_str(include_str!("../../machine.toml")).unwrap();
        config.validate().unwrap();
        let names: Vec<String> = config
            .instances
            .iter()
            .map(|i| instance_from_config(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["main", "laser", "plc"]);
    }
}
