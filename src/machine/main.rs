// src/machine/main.rs - Build sequencing instance

use super::{SIGNAL_BUILDREADY, SIGNAL_EXPOSURE, SIGNAL_RECOATLAYER, SIGNAL_STARTBUILD};
use crate::signal::{SignalDefinition, SignalTrigger};
use crate::statemachine::{InstanceDefinition, StateEnvironment, StateError};
use chrono::Utc;
use foundry_shared::{Frame, ParameterGroup, StorageStream};
use serde::Serialize;
use uuid::Uuid;

const EXPOSURE_LOG_HEADER: &str = "layer,z_mm,segments,mark_length_mm,duration_s";

pub fn definition(instance: &str) -> InstanceDefinition {
    let mut build = ParameterGroup::new("build", "Current build");
    build
        .add("status", "Build status", "idle")
        .add("jobuuid", "Job being built", "")
        .add("jobname", "Name of the job being built", "")
        .add("layercount", "Layers in the current job", 0i64)
        .add("currentlayer", "Layer being processed", 0i64)
        .add("lastjob", "Most recently registered job", "")
        .add("lastlog", "Storage stream of the last exposure log", "")
        .add("autostart", "Start builds as soon as they are registered", false);

    let mut config = ParameterGroup::new("config", "Collaborators");
    config
        .add("laser_instance", "Instance exposing layers", "laser")
        .add("plc_instance", "Instance recoating layers", "plc")
        .add("camera", "Driver capturing a frame per layer; empty to disable", "")
        .add("signal_timeout_ms", "How long to wait for a layer step", 30_000i64);

    InstanceDefinition::new(instance)
        .signal(SignalDefinition::new(SIGNAL_STARTBUILD).parameter("jobuuid").result("success"))
        .signal(
            SignalDefinition::new(SIGNAL_BUILDREADY)
                .parameter("jobuuid")
                .parameter("layercount"),
        )
        .parameter_group(build)
        .parameter_group(config)
        .state("init", 100, init)
        .state("idle", 50, idle)
        .state("startbuild", 10, start_build)
        .state("recoat", 1, recoat)
        .state("expose", 1, expose)
        .state("finishbuild", 10, finish_build)
        .state("fatalerror", 1000, fatal_error)
        .out_states("init", &["idle"])
        .out_states("idle", &["idle", "startbuild"])
        .out_states("startbuild", &["recoat"])
        .out_states("recoat", &["expose"])
        .out_states("expose", &["recoat", "finishbuild"])
        .out_states("finishbuild", &["idle"])
}

fn init(env: &mut StateEnvironment) -> Result<(), StateError> {
    env.set_parameter("build", "status", "idle")?;
    env.set_parameter("build", "currentlayer", 0i64)?;
    env.set_next_state("idle");
    Ok(())
}

fn idle(env: &mut StateEnvironment) -> Result<(), StateError> {
    if let Some(mut handler) = env.wait_for_signal(SIGNAL_STARTBUILD, 0)? {
        let job = handler.get_uuid("jobuuid")?;
        match env.build_job(job) {
            Ok(record) => {
                tracing::info!(subsystem = "machine", "{}: build '{}' requested", env.instance_name(), record.name);
                handler.set_bool_result("success", true)?;
                handler.signal_handled();
                env.store_uuid("jobuuid", job);
                env.set_next_state("startbuild");
            }
            Err(e) => {
                tracing::warn!(subsystem = "machine", "{}: rejected build request: {}", env.instance_name(), e);
                handler.set_bool_result("success", false)?;
                handler.signal_handled();
                env.set_next_state("idle");
            }
        }
        return Ok(());
    }

    if let Some(handler) = env.wait_for_signal(SIGNAL_BUILDREADY, 0)? {
        let job = handler.get_uuid("jobuuid")?;
        let layers = handler.get_int("layercount")?;
        handler.signal_handled();
        tracing::info!(subsystem = "machine", "{}: job {} ready ({} layers)", env.instance_name(), job, layers);
        env.set_parameter("build", "lastjob", job.to_string())?;
        if env.get_parameter_bool("build", "autostart")? {
            env.store_uuid("jobuuid", job);
            env.set_next_state("startbuild");
            return Ok(());
        }
    }

    env.set_next_state("idle");
    Ok(())
}

fn start_build(env: &mut StateEnvironment) -> Result<(), StateError> {
    let job = env.build_job(env.retrieve_uuid("jobuuid")?)?;
    let toolpath = env.load_toolpath(job.storage_stream)?;
    let layer_count = toolpath.layer_count();

    env.store_uuid("toolpath", job.storage_stream);
    env.store_int("layerindex", 0);
    env.store_int("layercount", layer_count as i64);
    env.clear_stored_value("exposurelog");
    env.clear_stored_value("frames");
    env.store_string("started", &Utc::now().to_rfc3339());

    env.set_parameter("build", "status", "building")?;
    env.set_parameter("build", "jobuuid", job.uuid.to_string())?;
    env.set_parameter("build", "jobname", job.name.as_str())?;
    env.set_parameter("build", "layercount", layer_count as i64)?;
    env.set_parameter("build", "currentlayer", 0i64)?;

    tracing::info!(
        subsystem = "machine",
        "{}: starting build '{}' ({} layers)",
        env.instance_name(),
        job.name,
        layer_count
    );
    env.set_next_state("recoat");
    Ok(())
}

/// Wait for a raised signal; a timeout is a build failure.
fn await_handling(trigger: &mut SignalTrigger, timeout_ms: u64) -> Result<(), StateError> {
    if trigger.wait_for_handling(timeout_ms)? {
        return Ok(());
    }
    Err(StateError::failed(format!(
        "{}.{} not handled within {} ms",
        trigger.instance(),
        trigger.name(),
        timeout_ms
    )))
}

fn recoat(env: &mut StateEnvironment) -> Result<(), StateError> {
    let layer = env.retrieve_int("layerindex")?;
    let plc = env.get_parameter_string("config", "plc_instance")?;
    let timeout = env.get_parameter_int("config", "signal_timeout_ms")?.max(1) as u64;

    let mut trigger = env.prepare_signal(&plc, SIGNAL_RECOATLAYER)?;
    trigger.set_int("layerindex", layer)?;
    trigger.trigger()?;
    await_handling(&mut trigger, timeout)?;
    if !trigger.get_bool_result("success")? {
        return Err(StateError::failed(format!("recoating layer {} failed", layer)));
    }
    env.set_next_state("expose");
    Ok(())
}

fn expose(env: &mut StateEnvironment) -> Result<(), StateError> {
    let layer = env.retrieve_int("layerindex")?;
    let layer_count = env.retrieve_int("layercount")?;
    let job = env.retrieve_uuid("jobuuid")?;
    let laser = env.get_parameter_string("config", "laser_instance")?;
    let timeout = env.get_parameter_int("config", "signal_timeout_ms")?.max(1) as u64;

    let mut trigger = env.prepare_signal(&laser, SIGNAL_EXPOSURE)?;
    trigger.set_uuid("jobuuid", job)?;
    trigger.set_int("layerindex", layer)?;
    trigger.trigger()?;
    await_handling(&mut trigger, timeout)?;
    if !trigger.get_bool_result("success")? {
        return Err(StateError::failed(format!("exposure of layer {} failed", layer)));
    }

    let z_mm = env.toolpath(env.retrieve_uuid("toolpath")?)?.layer_z_mm(layer as usize)?;
    let line = format!(
        "{},{:.3},{},{:.3},{:.4}",
        layer,
        z_mm,
        trigger.get_int_result("segments")?,
        trigger.get_double_result("marklength")?,
        trigger.get_double_result("duration")?
    );
    env.append_stored_value("exposurelog", line);

    let camera = env.get_parameter_string("config", "camera")?;
    if !camera.is_empty() {
        capture_layer_frame(env, &camera, layer)?;
    }

    let next = layer + 1;
    env.store_int("layerindex", next);
    env.set_parameter("build", "currentlayer", next)?;
    if next < layer_count {
        env.set_next_state("recoat");
    } else {
        env.set_next_state("finishbuild");
    }
    Ok(())
}

fn capture_layer_frame(env: &mut StateEnvironment, camera: &str, layer: i64) -> Result<(), StateError> {
    let frame = env
        .acquire_driver(camera)?
        .with_imaging_source(|source| source.capture_frame())?;
    let stream = env
        .storage()
        .store_bytes(&format!("layer_{:05}.pgm", layer), encode_pgm(&frame))?;
    env.append_stored_value("frames", stream.uuid());
    Ok(())
}

fn encode_pgm(frame: &Frame) -> Vec<u8> {
    let mut bytes = format!("P5\n{} {}\n255\n", frame.width, frame.height).into_bytes();
    bytes.extend_from_slice(&frame.pixels);
    bytes
}

#[derive(Serialize)]
struct BuildSummary {
    job: Uuid,
    name: String,
    layers: i64,
    started: String,
    finished: String,
    frames: usize,
}

fn finish_build(env: &mut StateEnvironment) -> Result<(), StateError> {
    let job = env.build_job(env.retrieve_uuid("jobuuid")?)?;
    let toolpath = env.retrieve_uuid("toolpath")?;
    let frames: Vec<Uuid> = env
        .take_stored_list("frames")
        .iter()
        .filter_map(|v| v.as_uuid())
        .collect();
    let rows = env.take_stored_list("exposurelog");

    let summary = BuildSummary {
        job: job.uuid,
        name: job.name.clone(),
        layers: env.retrieve_int("layercount")?,
        started: env.retrieve_string("started")?,
        finished: Utc::now().to_rfc3339(),
        frames: frames.len(),
    };
    let summary = serde_json::to_string_pretty(&summary).map_err(|e| StateError::failed(e.to_string()))?;

    let mut archive = env.create_archive("exposure_log.zip")?;
    {
        let mut entry = archive.entry_writer("summary.json")?;
        entry.write_string(&summary)?;
        entry.finish()?;
    }
    {
        let mut entry = archive.entry_writer("exposure.csv")?;
        entry.write_line(EXPOSURE_LOG_HEADER)?;
        for row in rows.iter().filter_map(|r| r.as_string()) {
            entry.write_line(row)?;
        }
        entry.finish()?;
    }
    for frame in &frames {
        let stream = env.storage().retrieve(*frame)?;
        let mut reader = stream.open()?;
        archive.copy_entry_from(&format!("frames/{}", stream.name()), &mut *reader)?;
    }
    let log = env.finish_archive(archive)?;
    for frame in frames {
        env.storage().discard(frame)?;
    }

    env.unload_toolpath(toolpath)?;
    for key in ["jobuuid", "toolpath", "layerindex", "layercount", "exposurelog", "frames", "started"] {
        env.clear_stored_value(key);
    }
    env.set_parameter("build", "lastlog", log.uuid().to_string())?;
    env.set_parameter("build", "status", "idle")?;
    tracing::info!(
        subsystem = "machine",
        "{}: build '{}' finished, exposure log {} ({} bytes)",
        env.instance_name(),
        job.name,
        log.uuid(),
        log.size()
    );
    env.set_next_state("idle");
    Ok(())
}

fn fatal_error(env: &mut StateEnvironment) -> Result<(), StateError> {
    env.set_parameter("build", "status", "fatalerror")?;
    env.set_next_state("fatalerror");
    Ok(())
}
