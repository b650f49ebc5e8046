// src/storage.rs - Storage provider: retrievable streams and write sinks

use foundry_shared::{FileStream, MemoryStream, StorageError, StorageStream};
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tempfile::NamedTempFile;
use uuid::Uuid;

type StreamMap = Arc<RwLock<HashMap<Uuid, Arc<dyn StorageStream>>>>;

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub uuid: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Holds every stream known to the process. File-backed streams live under `root`.
pub struct StorageProvider {
    root: PathBuf,
    streams: StreamMap,
}

impl StorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            streams: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn register(&self, stream: Arc<dyn StorageStream>) -> Result<(), StorageError> {
        register(&self.streams, stream)
    }

    pub fn store_bytes(&self, name: &str, bytes: Vec<u8>) -> Result<Arc<dyn StorageStream>, StorageError> {
        let name = file_name(name)?;
        let stream: Arc<dyn StorageStream> = Arc::new(MemoryStream::new(name, bytes));
        self.register(stream.clone())?;
        Ok(stream)
    }

    /// Copy a file into the storage root and register it.
    pub fn import_file(&self, path: &Path) -> Result<Arc<dyn StorageStream>, StorageError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::InvalidName(path.display().to_string()))?;
        let uuid = Uuid::new_v4();
        let target = self.root.join(format!("{}_{}", uuid, name));
        std::fs::copy(path, &target)?;
        let stream: Arc<dyn StorageStream> = Arc::new(FileStream::named(uuid, &name, &target)?);
        self.register(stream.clone())?;
        tracing::info!(subsystem = "storage", "imported '{}' as {}", name, uuid);
        Ok(stream)
    }

    pub fn retrieve(&self, uuid: Uuid) -> Result<Arc<dyn StorageStream>, StorageError> {
        self.streams
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&uuid)
            .cloned()
            .ok_or(StorageError::NotFound(uuid))
    }

    /// Unregister a stream. Readers already holding it keep working.
    pub fn discard(&self, uuid: Uuid) -> Result<Arc<dyn StorageStream>, StorageError> {
        let stream = self
            .streams
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&uuid)
            .ok_or(StorageError::NotFound(uuid))?;
        tracing::debug!(subsystem = "storage", "discarded '{}' ({})", stream.name(), uuid);
        Ok(stream)
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.streams.read().unwrap_or_else(|p| p.into_inner()).contains_key(&uuid)
    }

    pub fn list(&self) -> Vec<StreamInfo> {
        let mut out: Vec<StreamInfo> = self
            .streams
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|s| StreamInfo {
                uuid: s.uuid(),
                name: s.name().to_string(),
                size: s.size(),
                mime_type: s.mime_type().to_string(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.uuid.cmp(&b.uuid)));
        out
    }

    /// A write-only sink whose content becomes a stream once finished.
    pub fn create_sink(&self, name: &str) -> Result<StorageSink, StorageError> {
        let name = file_name(name)?.to_string();
        let file = NamedTempFile::new_in(&self.root)?;
        Ok(StorageSink {
            uuid: Uuid::new_v4(),
            name,
            root: self.root.clone(),
            writer: BufWriter::new(file),
            streams: self.streams.clone(),
        })
    }
}

fn register(streams: &StreamMap, stream: Arc<dyn StorageStream>) -> Result<(), StorageError> {
    let mut streams = streams.write().unwrap_or_else(|p| p.into_inner());
    let uuid = stream.uuid();
    if streams.contains_key(&uuid) {
        return Err(StorageError::Duplicate(uuid));
    }
    streams.insert(uuid, stream);
    Ok(())
}

fn file_name(name: &str) -> Result<&str, StorageError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(name)
}

pub struct StorageSink {
    uuid: Uuid,
    name: String,
    root: PathBuf,
    writer: BufWriter<NamedTempFile>,
    streams: StreamMap,
}

impl StorageSink {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flush, move into place and register. Until then nothing is visible.
    pub fn finish(self) -> Result<Arc<dyn StorageStream>, StorageError> {
        let file = self.writer.into_inner().map_err(|e| StorageError::Io(e.into_error()))?;
        let target = self.root.join(format!("{}_{}", self.uuid, self.name));
        file.persist(&target).map_err(|e| StorageError::Io(e.error))?;
        let stream: Arc<dyn StorageStream> = Arc::new(FileStream::named(self.uuid, &self.name, &target)?);
        register(&self.streams, stream.clone())?;
        tracing::debug!(subsystem = "storage", "stored '{}' ({} bytes) as {}", self.name, stream.size(), self.uuid);
        Ok(stream)
    }
}

impl Write for StorageSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
