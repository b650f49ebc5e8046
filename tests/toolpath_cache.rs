// Shared toolpath cache under concurrent loaders and instances

mod common;

use common::context;
use foundry_rs::statemachine::{InstanceDefinition, Runtime, StateEnvironment, StateError};
use foundry_rs::toolpath::{ToolpathEntity, ToolpathError, ToolpathHandler};
use foundry_shared::{MemoryStream, StorageStream};
use foundry_simulator::BuildFileSpec;
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn build_stream(layers: usize) -> Arc<dyn StorageStream> {
    let gcode = BuildFileSpec::default().with_layers(layers).to_gcode();
    Arc::new(MemoryStream::new("part.gcode", gcode.into_bytes()))
}

#[test]
fn concurrent_loaders_share_one_entity() {
    let cache = Arc::new(ToolpathHandler::new());
    let stream = build_stream(4);
    let uuid = stream.uuid();

    let loaded: Vec<Arc<ToolpathEntity>> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let stream = stream.clone();
            thread::spawn(move || cache.load(stream).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();

    assert_eq!(cache.loaded_count(), 1);
    assert!(loaded.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(loaded[0].ref_count(), 8);

    let releases: Vec<bool> = (0..8).map(|_| cache.unload(uuid).unwrap()).collect();
    assert_eq!(releases.iter().filter(|r| **r).count(), 1);
    assert_eq!(releases.last(), Some(&true));
    assert!(!cache.is_loaded(uuid));
    assert!(matches!(cache.unload(uuid), Err(ToolpathError::NotLoaded(_))));
}

#[test]
fn count_never_goes_negative_under_random_traffic() {
    let entity = ToolpathEntity::open(build_stream(2)).unwrap();
    let mut rng = rand::rng();
    let mut expected: u32 = 0;
    let mut releases = 0;
    for _ in 0..2000 {
        if rng.random_bool(0.55) {
            expected += 1;
            assert_eq!(entity.inc_ref().unwrap(), expected);
        } else if expected == 0 {
            assert!(matches!(entity.dec_ref(), Err(ToolpathError::ReferenceCountUnderflow(_))));
        } else {
            let released = entity.dec_ref().unwrap();
            expected -= 1;
            assert_eq!(released, expected == 0);
            if released {
                releases += 1;
            }
        }
        assert_eq!(entity.ref_count(), expected);
    }
    assert!(releases > 0);
}

#[test]
fn layers_read_concurrently_match_sequential_reads() {
    let cache = Arc::new(ToolpathHandler::new());
    let entity = cache.load(build_stream(6)).unwrap();
    let expected: Vec<_> = (0..6).map(|i| entity.read_layer(i).unwrap()).collect();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let entity = entity.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                (0..50)
                    .map(|_| {
                        let index = rng.random_range(0..6);
                        (index, entity.read_layer(index).unwrap())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for worker in workers {
        for (index, layer) in worker.join().unwrap() {
            assert_eq!(layer, expected[index]);
        }
    }
    assert!(matches!(entity.read_layer(6), Err(ToolpathError::LayerOutOfRange { index: 6, count: 6 })));
    assert!((entity.layer_z_mm(1).unwrap() - 0.06).abs() < 1e-6);
    assert_eq!(entity.metadata_value("name"), Some("cube"));
}

fn hold_toolpath(env: &mut StateEnvironment) -> Result<(), StateError> {
    let stream = env.get_parameter_uuid("job", "stream")?;
    env.load_toolpath(stream)?;
    env.set_next_state("hold");
    Ok(())
}

fn hold(env: &mut StateEnvironment) -> Result<(), StateError> {
    env.set_next_state("hold");
    Ok(())
}

#[test]
fn toolpaths_are_released_when_instances_stop() {
    let dir = tempfile::tempdir().unwrap();
    let context = context(dir.path());
    let gcode = BuildFileSpec::default().with_layers(3).to_gcode();
    let stream = context.storage.store_bytes("held.gcode", gcode.into_bytes()).unwrap();

    let definitions = ["first", "second"]
        .into_iter()
        .map(|name| {
            let mut job = foundry_shared::ParameterGroup::new("job", "");
            job.add("stream", "", stream.uuid());
            InstanceDefinition::new(name)
                .parameter_group(job)
                .state("init", 1, hold_toolpath)
                .state("hold", 10, hold)
        })
        .collect();
    let runtime = Runtime::start(context.clone(), definitions).unwrap();
    assert!(runtime.wait_for_state("first", "hold", Duration::from_secs(5)));
    assert!(runtime.wait_for_state("second", "hold", Duration::from_secs(5)));

    let entity = context.toolpaths.find(stream.uuid()).unwrap();
    assert_eq!(entity.ref_count(), 2);
    drop(entity);

    runtime.shutdown();
    assert!(!context.toolpaths.is_loaded(stream.uuid()));
    assert_eq!(context.toolpaths.loaded_count(), 0);
}
