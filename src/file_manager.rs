// src/file_manager.rs - Upload directory watcher
use crate::persistence::BuildJobPersistence;
use crate::scheduler::{BuildFileParsingService, BuildReadySignal, SchedulerError, ServiceHandle, ServiceHandler};
use crate::statemachine::SystemContext;
use crate::storage::StorageProvider;
use crate::toolpath::ToolpathHandler;
use foundry_shared::StorageError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Import task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Imports `.gcode` files dropped into the upload directory and queues them for parsing.
/// A file is picked up once its size has stayed the same for two scans.
pub struct UploadWatcher {
    upload_dir: PathBuf,
    interval: Duration,
    storage: Arc<StorageProvider>,
    scheduler: Arc<ServiceHandler>,
    toolpaths: Arc<ToolpathHandler>,
    persistence: Arc<dyn BuildJobPersistence>,
    notify: Option<BuildReadySignal>,
    imported: HashSet<PathBuf>,
    pending: HashMap<PathBuf, u64>,
}

impl UploadWatcher {
    pub fn new(upload_dir: impl Into<PathBuf>, interval: Duration, context: &SystemContext) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            interval,
            storage: context.storage.clone(),
            scheduler: context.scheduler.clone(),
            toolpaths: context.toolpaths.clone(),
            persistence: context.persistence.clone(),
            notify: None,
            imported: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn with_notification(mut self, notify: BuildReadySignal) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    fn is_build_file(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("gcode"))
    }

    /// One pass over the upload directory. Returns the parsing services queued.
    pub async fn scan_once(&mut self) -> Result<Vec<ServiceHandle>, WatcherError> {
        fs::create_dir_all(&self.upload_dir).await?;
        let mut entries = fs::read_dir(&self.upload_dir).await?;
        let mut ready = Vec::new();
        let mut seen = HashSet::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !Self::is_build_file(&path) || self.imported.contains(&path) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            seen.insert(path.clone());
            let size = metadata.len();
            match self.pending.insert(path.clone(), size) {
                Some(previous) if previous == size => ready.push(path),
                _ => tracing::debug!(subsystem = "storage", "upload {} seen ({} bytes)", path.display(), size),
            }
        }
        self.pending.retain(|path, _| seen.contains(path));

        let mut queued = Vec::new();
        for path in ready {
            self.pending.remove(&path);
            self.imported.insert(path.clone());
            let storage = self.storage.clone();
            let source = path.clone();
            let stream = match tokio::task::spawn_blocking(move || storage.import_file(&source)).await? {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(subsystem = "storage", "failed to import {}: {}", path.display(), e);
                    continue;
                }
            };
            let mut service = BuildFileParsingService::new(stream, self.toolpaths.clone(), self.persistence.clone());
            if let Some(notify) = &self.notify {
                service = service.with_notification(notify.clone());
            }
            let handle = self.scheduler.create_service(service);
            self.scheduler.add_service_to_queue(&handle)?;
            tracing::info!(subsystem = "storage", "queued {} for parsing", path.display());
            queued.push(handle);
        }
        Ok(queued)
    }

    /// Scan on every tick until the shutdown broadcast fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(subsystem = "storage", "watching {} for uploads", self.upload_dir.display());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        tracing::warn!(subsystem = "storage", "upload scan failed: {}", e);
                        if matches!(e, WatcherError::Scheduler(SchedulerError::ShuttingDown)) {
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!(subsystem = "storage", "upload watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DriverRegistry;
    use crate::persistence::InMemoryPersistence;

    fn context(dir: &Path) -> SystemContext {
        SystemContext::new(
            StorageProvider::new(dir.join("data")).unwrap(),
            Arc::new(InMemoryPersistence::new()),
            DriverRegistry::new(),
            2,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn imports_stable_uploads_once() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path());
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        std::fs::write(uploads.join("cube.gcode"), "G1 Z0.1\nG1 X1 Y1\nG1 Z0.2\nG1 X2 Y2\n").unwrap();
        std::fs::write(uploads.join("notes.txt"), "ignored").unwrap();

        let mut watcher = UploadWatcher::new(&uploads, Duration::from_millis(10), &context);
        assert!(watcher.scan_once().await.unwrap().is_empty());
        let queued = watcher.scan_once().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert!(watcher.scan_once().await.unwrap().is_empty());

        assert!(context.scheduler.wait_until_idle(Duration::from_secs(5)));
        let jobs = context.persistence.build_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "cube.gcode");
        assert_eq!(jobs[0].layer_count, 2);
        context.scheduler.shutdown();
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(dir.path());
        let watcher = UploadWatcher::new(dir.path().join("uploads"), Duration::from_millis(5), &context);
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(watcher.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
