// src/toolpath/entity.rs - Shared, reference-counted toolpath

use super::decoder::{GcodeToolpathDecoder, ToolpathDecoder};
use super::ToolpathError;
use foundry_shared::{LayerData, StorageStream};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Far above any realistic number of concurrent users; reaching it means a leak.
pub const MAX_REFERENCE_COUNT: u32 = 1 << 30;

/// One decoded build. The stream and the decoder reading from it live and die together.
pub struct ToolpathEntity {
    stream: Arc<dyn StorageStream>,
    decoder: Mutex<Box<dyn ToolpathDecoder>>,
    ref_count: AtomicU32,
    metadata: BTreeMap<String, String>,
}

impl std::fmt::Debug for ToolpathEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolpathEntity")
            .field("uuid", &self.stream.uuid())
            .field("name", &self.stream.name())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl ToolpathEntity {
    /// Open a G-code toolpath from a storage stream.
    pub fn open(stream: Arc<dyn StorageStream>) -> Result<Self, ToolpathError> {
        let reader = stream.open()?;
        let decoder = GcodeToolpathDecoder::new(reader)?;
        Ok(Self::with_decoder(stream, Box::new(decoder)))
    }

    pub fn with_decoder(stream: Arc<dyn StorageStream>, decoder: Box<dyn ToolpathDecoder>) -> Self {
        let metadata = decoder.metadata().clone();
        Self {
            stream,
            decoder: Mutex::new(decoder),
            ref_count: AtomicU32::new(0),
            metadata,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.stream.uuid()
    }

    pub fn name(&self) -> &str {
        self.stream.name()
    }

    pub fn stream(&self) -> &Arc<dyn StorageStream> {
        &self.stream
    }

    pub fn inc_ref(&self) -> Result<u32, ToolpathError> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count >= MAX_REFERENCE_COUNT { None } else { Some(count + 1) }
            })
            .map(|previous| previous + 1)
            .map_err(|_| ToolpathError::ReferenceCountOverflow(self.uuid()))
    }

    /// Returns true exactly when this call released the last reference.
    pub fn dec_ref(&self) -> Result<bool, ToolpathError> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map(|previous| previous == 1)
            .map_err(|_| ToolpathError::ReferenceCountUnderflow(self.uuid()))
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    // A panic inside the decoder cannot leave it unusable: every read seeks first.
    fn decoder(&self) -> MutexGuard<'_, Box<dyn ToolpathDecoder>> {
        self.decoder.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn layer_count(&self) -> usize {
        self.decoder().layer_count()
    }

    pub fn layer_z(&self, index: usize) -> Result<i64, ToolpathError> {
        self.decoder().layer_z(index)
    }

    pub fn layer_z_mm(&self, index: usize) -> Result<f64, ToolpathError> {
        let decoder = self.decoder();
        Ok(decoder.layer_z(index)? as f64 * decoder.units_mm())
    }

    pub fn read_layer(&self, index: usize) -> Result<LayerData, ToolpathError> {
        self.decoder().read_layer(index)
    }

    pub fn units_mm(&self) -> f64 {
        self.decoder().units_mm()
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_shared::MemoryStream;

    fn entity() -> ToolpathEntity {
        let stream = MemoryStream::new("cube.gcode", "; part = cube\nG1 Z0.03\nG1 X1 Y1\nG1 Z0.06\nG1 X2 Y2\n");
        ToolpathEntity::open(Arc::new(stream)).unwrap()
    }

    #[test]
    fn decrement_reports_last_release_once() {
        let e = entity();
        assert_eq!(e.inc_ref().unwrap(), 1);
        assert_eq!(e.inc_ref().unwrap(), 2);
        assert!(!e.dec_ref().unwrap());
        assert!(e.dec_ref().unwrap());
        assert!(matches!(e.dec_ref(), Err(ToolpathError::ReferenceCountUnderflow(_))));
        assert_eq!(e.ref_count(), 0);
    }

    #[test]
    fn increment_stops_at_ceiling() {
        let e = entity();
        e.ref_count.store(MAX_REFERENCE_COUNT - 1, Ordering::Release);
        assert_eq!(e.inc_ref().unwrap(), MAX_REFERENCE_COUNT);
        assert!(matches!(e.inc_ref(), Err(ToolpathError::ReferenceCountOverflow(_))));
        assert_eq!(e.ref_count(), MAX_REFERENCE_COUNT);
    }

    #[test]
    fn exposes_layers_and_metadata() {
        let e = entity();
        assert_eq!(e.layer_count(), 2);
        assert!((e.layer_z_mm(1).unwrap() - 0.06).abs() < 1e-9);
        assert_eq!(e.metadata_value("part"), Some("cube"));
        assert!(!e.has_metadata("material"));
        let layer = e.read_layer(1).unwrap();
        assert_eq!(layer.index, 1);
    }

    #[test]
    fn invalid_stream_is_rejected() {
        let stream = MemoryStream::new("empty.gcode", "; nothing here\n");
        assert!(matches!(
            ToolpathEntity::open(Arc::new(stream)),
            Err(ToolpathError::InvalidFile(_))
        ));
    }
}
