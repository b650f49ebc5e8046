// src/main.rs - Machine host: loads the configuration, starts the instances and watches for uploads
use clap::Parser;
use foundry_rs::drivers::DriverRegistry;
use foundry_rs::file_manager::UploadWatcher;
use foundry_rs::machine::{self, SIGNAL_BUILDREADY};
use foundry_rs::persistence::JsonFilePersistence;
use foundry_rs::scheduler::BuildReadySignal;
use foundry_rs::statemachine::{Runtime, SystemContext};
use foundry_rs::storage::StorageProvider;
use foundry_shared::config::{self, Config};
use foundry_simulator::EventSink;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "machine-host", about = "Runs the machine control instances described by a configuration file.")]
struct Args {
    /// Path to the machine configuration
    #[arg(short, long, default_value = "machine.toml")]
    config: String,

    /// Log filter, overrides runtime.log_level (e.g. "debug" or "foundry_rs=trace")
    #[arg(long)]
    log_level: Option<String>,
}

fn build_drivers(config: &Config) -> Result<DriverRegistry, BoxError> {
    let registry = DriverRegistry::new();
    for driver in &config.drivers {
        let built = foundry_simulator::build_driver(driver, EventSink::disabled())?;
        registry.register(&driver.identifier, built)?;
        tracing::info!(subsystem = "host", "Driver '{}' ({}) registered", driver.identifier, driver.kind);
    }
    Ok(registry)
}

/// The first instance defining the build-ready signal receives upload notifications.
fn build_ready_target(config: &Config, context: &SystemContext) -> Option<BuildReadySignal> {
    config
        .instances
        .iter()
        .find(|i| context.signals.is_defined(&i.name, SIGNAL_BUILDREADY))
        .map(|i| BuildReadySignal {
            bus: context.signals.clone(),
            instance: i.name.clone(),
            signal: SIGNAL_BUILDREADY.to_string(),
        })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = config::load_config(&args.config).map_err(|e| {
        eprintln!("Failed to load config from '{}': {}", args.config, e);
        Box::new(e) as BoxError
    })?;

    let filter = args.log_level.clone().unwrap_or_else(|| config.runtime.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        subsystem = "host",
        "Starting machine host '{}'",
        config.runtime.machine_name.as_deref().unwrap_or("unnamed")
    );
    tracing::info!(subsystem = "host", "Configuration: {} instance(s), {} driver(s)", config.instances.len(), config.drivers.len());

    let data_dir = Path::new(&config.storage.data_dir);
    let storage = StorageProvider::new(data_dir)?;
    let persistence = Arc::new(JsonFilePersistence::new(data_dir.join("jobs.json")));
    let drivers = build_drivers(&config)?;
    let context = Arc::new(SystemContext::new(
        storage,
        persistence,
        drivers,
        config.runtime.max_service_threads,
    )?);

    for (driver, e) in context.drivers.connect_all() {
        tracing::warn!(subsystem = "host", "Driver '{}' failed to connect: {}", driver, e);
    }

    let definitions = config
        .instances
        .iter()
        .map(machine::instance_from_config)
        .collect::<Result<Vec<_>, _>>()?;
    let runtime = Arc::new(Runtime::start(context.clone(), definitions)?);

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let mut watcher = UploadWatcher::new(
        &config.storage.upload_dir,
        Duration::from_millis(config.storage.scan_interval_ms.max(10)),
        &context,
    );
    match build_ready_target(&config, &context) {
        Some(target) => {
            tracing::info!(subsystem = "host", "Uploads announced to {}.{}", target.instance, target.signal);
            watcher = watcher.with_notification(target);
        }
        None => tracing::warn!(subsystem = "host", "No instance defines {}; uploads are registered silently", SIGNAL_BUILDREADY),
    }
    let watcher_task = tokio::spawn(watcher.run(shutdown_tx.subscribe()));

    let status_runtime = runtime.clone();
    let mut status_shutdown = shutdown_tx.subscribe();
    let status_interval = Duration::from_millis(config.runtime.status_interval_ms.max(100));
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for status in status_runtime.status() {
                        match serde_json::to_string(&status) {
                            Ok(line) => tracing::debug!(subsystem = "host", "{}", line),
                            Err(e) => tracing::warn!(subsystem = "host", "status serialization failed: {}", e),
                        }
                        if status.state == foundry_rs::statemachine::DEFAULT_FAILED_STATE {
                            tracing::warn!(subsystem = "host", "{} is in its failed state", status.name);
                        }
                    }
                }
                _ = status_shutdown.recv() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!(subsystem = "host", "Shutdown requested");
    let _ = shutdown_tx.send(());
    let _ = watcher_task.await;
    let _ = status_task.await;

    let stopping = runtime.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;
    tracing::info!(subsystem = "host", "Machine host stopped");
    Ok(())
}
