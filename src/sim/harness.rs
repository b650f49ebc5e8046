//! Simulation harness: runs the demo machine against simulated drivers and prints the driver event timeline.

use clap::Parser;
use foundry_rs::drivers::DriverRegistry;
use foundry_rs::machine::{self, SIGNAL_BUILDREADY, SIGNAL_STARTBUILD};
use foundry_rs::persistence::InMemoryPersistence;
use foundry_rs::scheduler::{BuildFileParsingService, BuildReadySignal};
use foundry_rs::statemachine::{DEFAULT_FAILED_STATE, Runtime, SystemContext};
use foundry_rs::storage::StorageProvider;
use foundry_shared::{Driver, ParameterValue, WallClock};
use foundry_shared::config::{DriverConfig, InstanceConfig};
use foundry_simulator::{BuildFileSpec, EventSink, SimEventQueue, SimulatedScanner};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Runs a synthetic build through the demo machine on simulated drivers.")]
struct Cli {
    /// Layers in the generated build
    #[arg(long, default_value_t = 5)]
    layers: usize,

    /// Capture a camera frame per layer
    #[arg(long)]
    camera: bool,

    /// Directory for storage streams (a temporary directory when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write the event timeline here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Pace the scanner at this multiple of the computed exposure time
    #[arg(long)]
    realtime: Option<f64>,

    /// Log filter
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn driver(identifier: &str, kind: &str) -> DriverConfig {
    DriverConfig {
        identifier: identifier.to_string(),
        kind: kind.to_string(),
        simulation: true,
    }
}

fn instance(name: &str, state_set: &str) -> InstanceConfig {
    InstanceConfig {
        name: name.to_string(),
        state_set: state_set.to_string(),
        parameters: BTreeMap::new(),
    }
}

fn build_parameter(runtime: &Runtime, name: &str) -> Option<String> {
    let status = runtime.instance_status("main")?;
    let group = status.parameters.iter().find(|g| g.name == "build")?;
    group.get_string(name).ok()
}

fn run(cli: Cli) -> Result<(), BoxError> {
    let temp;
    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => {
            temp = tempfile::tempdir()?;
            temp.path().to_path_buf()
        }
    };

    let (sink, events) = EventSink::channel();
    let mut drivers = vec![driver("scanner", "scanner"), driver("axes", "axes")];
    if cli.camera {
        drivers.push(driver("camera", "camera"));
    }
    let registry = DriverRegistry::new();
    for config in &drivers {
        let built: Box<dyn Driver> = match (config.kind.as_str(), cli.realtime) {
            ("scanner", Some(factor)) => Box::new(
                SimulatedScanner::new(&config.identifier, 500.0)
                    .with_events(sink.clone())
                    .with_realtime(Arc::new(WallClock), factor),
            ),
            _ => foundry_simulator::build_driver(config, sink.clone())?,
        };
        registry.register(&config.identifier, built)?;
    }

    let mut main = instance("main", "main");
    if cli.camera {
        let mut overrides = BTreeMap::new();
        overrides.insert("camera".to_string(), ParameterValue::from("camera"));
        main.parameters.insert("config".to_string(), overrides);
    }
    let instances = [main, instance("laser", "laser"), instance("plc", "plc")];

    let context = Arc::new(SystemContext::new(
        StorageProvider::new(&data_dir)?,
        Arc::new(InMemoryPersistence::new()),
        registry,
        2,
    )?);
    let definitions = instances
        .iter()
        .map(machine::instance_from_config)
        .collect::<Result<Vec<_>, _>>()?;
    let runtime = Runtime::start(context.clone(), definitions)?;

    let spec = BuildFileSpec::default().with_layers(cli.layers);
    let stream = context
        .storage
        .store_bytes(&format!("{}.gcode", spec.name), spec.to_gcode().into_bytes())?;
    let service = BuildFileParsingService::new(stream, context.toolpaths.clone(), context.persistence.clone())
        .with_notification(BuildReadySignal {
            bus: context.signals.clone(),
            instance: "main".to_string(),
            signal: SIGNAL_BUILDREADY.to_string(),
        });
    let job = service.job_uuid();
    let handle = context.scheduler.create_service(service);
    context.scheduler.add_service_to_queue(&handle)?;
    if !context.scheduler.wait_until_idle(Duration::from_secs(cli.timeout_secs)) {
        return Err("build file parsing did not finish".into());
    }
    tracing::info!("registered job {} ({} layers)", job, cli.layers);

    let mut trigger = context.signals.prepare("main", SIGNAL_STARTBUILD)?;
    trigger.set_uuid("jobuuid", job)?;
    trigger.trigger()?;
    if !trigger.wait_for_handling(cli.timeout_secs * 1000)? || !trigger.get_bool_result("success")? {
        return Err("main did not accept the build".into());
    }

    let started = Instant::now();
    let deadline = started + Duration::from_secs(cli.timeout_secs);
    let log = loop {
        if let Some(log) = build_parameter(&runtime, "lastlog").filter(|l| !l.is_empty()) {
            break log;
        }
        if runtime.instance_status("main").is_some_and(|s| s.state == DEFAULT_FAILED_STATE) {
            return Err("main entered its failed state".into());
        }
        if Instant::now() >= deadline {
            return Err("build did not finish in time".into());
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    tracing::info!("build finished in {:.2?}, exposure log stream {}", started.elapsed(), log);

    runtime.shutdown();
    drop(sink);

    let mut queue = SimEventQueue::new();
    for event in events.try_iter() {
        queue.push(event);
    }
    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let total = queue.len();
    for event in queue.drain_ordered() {
        writeln!(out, "{}", event.to_json_line()?)?;
    }
    out.flush()?;
    tracing::info!("{} driver event(s) written", total);
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log_level))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(cli) {
        tracing::error!("simulation failed: {}", e);
        std::process::exit(1);
    }
}
