// src/persistence.rs - Build job registration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Build job already registered: {0}")]
    Duplicate(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJobRecord {
    pub uuid: Uuid,
    pub name: String,
    pub layer_count: usize,
    pub storage_stream: Uuid,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

pub trait BuildJobPersistence: Send + Sync {
    fn register_build_job(&self, job: BuildJobRecord) -> Result<(), PersistenceError>;
    fn build_job(&self, uuid: Uuid) -> Result<Option<BuildJobRecord>, PersistenceError>;
    fn build_jobs(&self) -> Result<Vec<BuildJobRecord>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    jobs: Mutex<Vec<BuildJobRecord>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BuildJobPersistence for InMemoryPersistence {
    fn register_build_job(&self, job: BuildJobRecord) -> Result<(), PersistenceError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        if jobs.iter().any(|j| j.uuid == job.uuid) {
            return Err(PersistenceError::Duplicate(job.uuid));
        }
        jobs.push(job);
        Ok(())
    }

    fn build_job(&self, uuid: Uuid) -> Result<Option<BuildJobRecord>, PersistenceError> {
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(jobs.iter().find(|j| j.uuid == uuid).cloned())
    }

    fn build_jobs(&self) -> Result<Vec<BuildJobRecord>, PersistenceError> {
        Ok(self.jobs.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}

/// Keeps all jobs in one JSON file, rewritten through a temp file and rename.
#[derive(Debug)]
pub struct JsonFilePersistence {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<BuildJobRecord>, PersistenceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, jobs: &[BuildJobRecord]) -> Result<(), PersistenceError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut file, jobs)?;
        file.flush()?;
        file.persist(&self.path).map_err(|e| PersistenceError::Io(e.error))?;
        Ok(())
    }
}

impl BuildJobPersistence for JsonFilePersistence {
    fn register_build_job(&self, job: BuildJobRecord) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut jobs = self.read_all()?;
        if jobs.iter().any(|j| j.uuid == job.uuid) {
            return Err(PersistenceError::Duplicate(job.uuid));
        }
        jobs.push(job);
        self.write_all(&jobs)
    }

    fn build_job(&self, uuid: Uuid) -> Result<Option<BuildJobRecord>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read_all()?.into_iter().find(|j| j.uuid == uuid))
    }

    fn build_jobs(&self) -> Result<Vec<BuildJobRecord>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read_all()
    }
}
