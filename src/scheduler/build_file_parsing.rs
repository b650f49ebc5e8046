// src/scheduler/build_file_parsing.rs - Parse an uploaded build and register it as a job

use super::{Service, ServiceContext, ServiceError};
use crate::persistence::{BuildJobPersistence, BuildJobRecord};
use crate::signal::{SignalBus, SignalError};
use crate::toolpath::ToolpathHandler;
use chrono::Utc;
use foundry_shared::StorageStream;
use std::sync::Arc;
use uuid::Uuid;

/// Where to announce a freshly registered job. The signal must declare the
/// parameters `jobuuid` and `layercount`.
#[derive(Clone)]
pub struct BuildReadySignal {
    pub bus: Arc<SignalBus>,
    pub instance: String,
    pub signal: String,
}

pub struct BuildFileParsingService {
    name: String,
    job_uuid: Uuid,
    stream: Arc<dyn StorageStream>,
    toolpaths: Arc<ToolpathHandler>,
    persistence: Arc<dyn BuildJobPersistence>,
    notify: Option<BuildReadySignal>,
}

impl BuildFileParsingService {
    pub fn new(
        stream: Arc<dyn StorageStream>,
        toolpaths: Arc<ToolpathHandler>,
        persistence: Arc<dyn BuildJobPersistence>,
    ) -> Self {
        Self {
            name: format!("parse {}", stream.name()),
            job_uuid: Uuid::new_v4(),
            stream,
            toolpaths,
            persistence,
            notify: None,
        }
    }

    pub fn with_notification(mut self, notify: BuildReadySignal) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Job id the build will be registered under.
    pub fn job_uuid(&self) -> Uuid {
        self.job_uuid
    }

    fn register(&self) -> Result<BuildJobRecord, ServiceError> {
        let entity = self.toolpaths.load(self.stream.clone())?;
        let record = BuildJobRecord {
            uuid: self.job_uuid,
            name: self.stream.name().to_string(),
            layer_count: entity.layer_count(),
            storage_stream: self.stream.uuid(),
            metadata: entity.metadata().clone(),
            created: Utc::now(),
        };
        drop(entity);
        let registered = self.persistence.register_build_job(record.clone());
        self.toolpaths.unload(self.stream.uuid())?;
        registered?;
        Ok(record)
    }

    fn announce(&self, record: &BuildJobRecord) -> Result<(), ServiceError> {
        let Some(notify) = &self.notify else {
            return Ok(());
        };
        let mut trigger = notify.bus.prepare(&notify.instance, &notify.signal)?;
        trigger.set_uuid("jobuuid", record.uuid)?;
        trigger.set_int("layercount", record.layer_count as i64)?;
        match trigger.trigger() {
            Ok(id) => {
                tracing::debug!(subsystem = "scheduler", "announced job {} with signal {}", record.uuid, id);
                Ok(())
            }
            Err(SignalError::AlreadyTriggered(signal)) => {
                tracing::warn!(
                    subsystem = "scheduler",
                    "job {} registered but '{}' is still pending; not announced",
                    record.uuid,
                    signal
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Service for BuildFileParsingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        let record = self.register()?;
        tracing::info!(
            subsystem = "scheduler",
            "registered build job {} '{}' ({} layers)",
            record.uuid,
            record.name,
            record.layer_count
        );
        self.announce(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::scheduler::ServiceHandler;
    use crate::signal::SignalDefinition;
    use foundry_shared::MemoryStream;
    use std::time::Duration;

    const BUILD: &str = "; part = bracket\nG21\nG90\n;LAYER:0\nG0 X0 Y0 Z0.03\nG1 X10 Y0 S200 F60000\n;LAYER:1\nG0 X0 Y0 Z0.06\nG1 X10 Y10\n";

    #[test]
    fn registers_job_and_releases_toolpath() {
        let handler = ServiceHandler::new(1).unwrap();
        let toolpaths = Arc::new(ToolpathHandler::new());
        let persistence = Arc::new(InMemoryPersistence::new());
        let bus = Arc::new(SignalBus::new());
        bus.define(
            "main",
            SignalDefinition::new("signal_buildready").parameter("jobuuid").parameter("layercount"),
        )
        .unwrap();

        let stream: Arc<dyn StorageStream> = Arc::new(MemoryStream::new("bracket.gcode", BUILD));
        let service = BuildFileParsingService::new(stream.clone(), toolpaths.clone(), persistence.clone())
            .with_notification(BuildReadySignal {
                bus: bus.clone(),
                instance: "main".into(),
                signal: "signal_buildready".into(),
            });
        let job = service.job_uuid();
        let handle = handler.create_service(service);
        handler.add_service_to_queue(&handle).unwrap();
        assert!(handler.wait_until_idle(Duration::from_secs(5)));
        assert!(handle.has_executed());

        let record = persistence.build_job(job).unwrap().unwrap();
        assert_eq!(record.layer_count, 2);
        assert_eq!(record.storage_stream, stream.uuid());
        assert_eq!(record.metadata.get("part").map(String::as_str), Some("bracket"));
        assert_eq!(toolpaths.loaded_count(), 0);

        let announced = bus.poll("main", "signal_buildready").unwrap().unwrap();
        assert_eq!(announced.get_uuid("jobuuid").unwrap(), job);
        assert_eq!(announced.get_int("layercount").unwrap(), 2);
        announced.signal_handled();
    }

    #[test]
    fn invalid_file_registers_nothing() {
        let handler = ServiceHandler::new(1).unwrap();
        let toolpaths = Arc::new(ToolpathHandler::new());
        let persistence = Arc::new(InMemoryPersistence::new());
        let stream: Arc<dyn StorageStream> = Arc::new(MemoryStream::new("empty.gcode", "; nothing\n"));
        let handle = handler.create_service(BuildFileParsingService::new(stream, toolpaths.clone(), persistence.clone()));
        handler.add_service_to_queue(&handle).unwrap();
        assert!(handler.wait_until_idle(Duration::from_secs(5)));
        assert!(handle.has_executed());
        assert!(persistence.build_jobs().unwrap().is_empty());
        assert_eq!(toolpaths.loaded_count(), 0);
    }
}
