// Storage stream abstraction shared by the toolpath cache and archive export

use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage stream not found: {0}")]
    NotFound(Uuid),
    #[error("Storage stream already exists: {0}")]
    Duplicate(Uuid),
    #[error("Invalid stream name: {0}")]
    InvalidName(String),
}

pub trait StreamReader: Read + Seek + Send {}

impl<T: Read + Seek + Send> StreamReader for T {}

/// An immutable, readable and seekable byte source with a unique identifier.
/// Every `open` call yields an independent cursor.
pub trait StorageStream: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn mime_type(&self) -> &str {
        "application/octet-stream"
    }
    fn open(&self) -> Result<Box<dyn StreamReader>, StorageError>;
}

#[derive(Debug, Clone)]
struct SharedBytes(Arc<[u8]>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStream {
    uuid: Uuid,
    name: String,
    mime_type: String,
    bytes: SharedBytes,
}

impl MemoryStream {
    pub fn new(name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        Self::with_uuid(Uuid::new_v4(), name, bytes)
    }

    pub fn with_uuid(uuid: Uuid, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            uuid,
            name: name.to_string(),
            mime_type: mime_type_for(name).to_string(),
            bytes: SharedBytes(Arc::from(bytes)),
        }
    }
}

impl StorageStream for MemoryStream {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn size(&self) -> u64 {
        self.bytes.0.len() as u64
    }
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn open(&self) -> Result<Box<dyn StreamReader>, StorageError> {
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }
}

/// A stream backed by a file on disk. The file must not change while the stream is alive.
#[derive(Debug, Clone)]
pub struct FileStream {
    uuid: Uuid,
    name: String,
    mime_type: String,
    path: PathBuf,
    size: u64,
}

impl FileStream {
    pub fn open_path(uuid: Uuid, path: &Path) -> Result<Self, StorageError> {
        let metadata = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StorageError::InvalidName(path.display().to_string()))?;
        Ok(Self {
            uuid,
            mime_type: mime_type_for(&name).to_string(),
            name,
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }

    /// Like `open_path`, but reports `name` instead of the on-disk file name.
    pub fn named(uuid: Uuid, name: &str, path: &Path) -> Result<Self, StorageError> {
        let mut stream = Self::open_path(uuid, path)?;
        stream.name = name.to_string();
        stream.mime_type = mime_type_for(name).to_string();
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageStream for FileStream {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn open(&self) -> Result<Box<dyn StreamReader>, StorageError> {
        let file = File::open(&self.path)?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }
}

pub fn mime_type_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".gcode") || lower.ends_with(".gco") {
        "text/x-gcode"
    } else if lower.ends_with(".zip") {
        "application/zip"
    } else if lower.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}
