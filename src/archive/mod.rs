// src/archive/mod.rs - Streaming ZIP archive writer
//
// Entries are deflated through a fixed output buffer straight into the sink, so memory
// use does not depend on entry size. Sizes and CRC go into a trailing data descriptor,
// which lets the sink be write-only.

pub mod format;

use chrono::{DateTime, Utc};
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use format::{CentralRecord, DosDateTime};
use std::io::{Read, Write};
use thiserror::Error;

/// Size of the fixed compression output buffer.
pub const OUT_BUFFER_SIZE: usize = 64 * 1024;
/// Chunk size used when copying a reader into an entry.
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Entry '{0}' is still open")]
    EntryAlreadyOpen(String),
    #[error("No entry is open")]
    NoOpenEntry,
    #[error("Entry {0} is not the open entry")]
    WrongEntry(u32),
    #[error("Archive is already finished")]
    AlreadyFinished,
    #[error("Invalid entry name: {0}")]
    InvalidName(String),
    #[error("Too many entries")]
    TooManyEntries,
}

impl From<flate2::CompressError> for ArchiveError {
    fn from(e: flate2::CompressError) -> Self {
        ArchiveError::Compression(e.to_string())
    }
}

/// Summary of a sealed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntryInfo {
    pub id: u32,
    pub name: String,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
}

struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf)?;
        self.count += buf.len() as u64;
        Ok(())
    }
}

struct OpenEntry {
    id: u32,
    name: String,
    modified: DosDateTime,
    header_offset: u64,
    crc: Crc,
    uncompressed: u64,
    compressed: u64,
}

pub struct ZipStreamWriter<W: Write> {
    sink: CountingWriter<W>,
    compressor: Compress,
    out_buffer: Box<[u8]>,
    out_len: usize,
    current: Option<OpenEntry>,
    records: Vec<(u32, CentralRecord)>,
    next_entry_id: u32,
    finished: bool,
}

impl<W: Write> ZipStreamWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: CountingWriter { inner: sink, count: 0 },
            compressor: Compress::new(Compression::fast(), false),
            out_buffer: vec![0u8; OUT_BUFFER_SIZE].into_boxed_slice(),
            out_len: 0,
            current: None,
            records: Vec::new(),
            next_entry_id: 1,
            finished: false,
        }
    }

    /// Bytes written to the sink so far.
    pub fn stream_size(&self) -> u64 {
        self.sink.count
    }

    pub fn entry_count(&self) -> usize {
        self.records.len() + usize::from(self.current.is_some())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn current_entry_id(&self) -> Option<u32> {
        self.current.as_ref().map(|e| e.id)
    }

    pub fn start_new_entry(&mut self, name: &str, modified: DateTime<Utc>) -> Result<u32, ArchiveError> {
        self.ensure_open()?;
        if let Some(open) = &self.current {
            return Err(ArchiveError::EntryAlreadyOpen(open.name.clone()));
        }
        validate_name(name)?;
        if self.records.len() as u64 >= format::MAX_ENTRY_COUNT {
            return Err(ArchiveError::TooManyEntries);
        }

        let modified = DosDateTime::from(modified);
        let header_offset = self.sink.count;
        self.sink.write_all(&format::local_file_header(name, modified))?;

        let id = self.next_entry_id;
        self.next_entry_id += 1;
        self.compressor.reset();
        self.out_len = 0;
        self.current = Some(OpenEntry {
            id,
            name: name.to_string(),
            modified,
            header_offset,
            crc: Crc::new(),
            uncompressed: 0,
            compressed: 0,
        });
        tracing::trace!(subsystem = "archive", "started entry {} '{}'", id, name);
        Ok(id)
    }

    /// Start an entry stamped with the current time.
    pub fn create_entry(&mut self, name: &str) -> Result<u32, ArchiveError> {
        self.start_new_entry(name, Utc::now())
    }

    pub fn write_data(&mut self, entry_id: u32, data: &[u8]) -> Result<(), ArchiveError> {
        self.ensure_open()?;
        let entry = self.current.as_mut().ok_or(ArchiveError::NoOpenEntry)?;
        if entry.id != entry_id {
            return Err(ArchiveError::WrongEntry(entry_id));
        }
        entry.crc.update(data);
        entry.uncompressed += data.len() as u64;

        let mut input = data;
        while !input.is_empty() {
            let (consumed, produced, _) = self.deflate(input, FlushCompress::None)?;
            input = &input[consumed..];
            if self.out_len == self.out_buffer.len() {
                self.flush_out_buffer()?;
            } else if consumed == 0 && produced == 0 {
                return Err(ArchiveError::Compression("deflate made no progress".to_string()));
            }
        }
        Ok(())
    }

    pub fn finish_current_entry(&mut self) -> Result<ArchiveEntryInfo, ArchiveError> {
        self.ensure_open()?;
        if self.current.is_none() {
            return Err(ArchiveError::NoOpenEntry);
        }
        loop {
            let (_, _, status) = self.deflate(&[], FlushCompress::Finish)?;
            if status == Status::StreamEnd {
                break;
            }
            // Finish only stops short of the end when the output buffer is full.
            self.flush_out_buffer()?;
        }
        self.flush_out_buffer()?;

        let entry = self.current.take().ok_or(ArchiveError::NoOpenEntry)?;
        let uncompressed = entry.uncompressed;
        let crc32 = entry.crc.sum();
        self.sink
            .write_all(&format::data_descriptor(crc32, entry.compressed, uncompressed))?;

        let record = CentralRecord {
            name: entry.name,
            modified: entry.modified,
            crc32,
            compressed_size: entry.compressed,
            uncompressed_size: uncompressed,
            header_offset: entry.header_offset,
        };
        let info = ArchiveEntryInfo {
            id: entry.id,
            name: record.name.clone(),
            crc32,
            compressed_size: record.compressed_size,
            uncompressed_size: record.uncompressed_size,
            header_offset: record.header_offset,
        };
        self.records.push((entry.id, record));
        tracing::debug!(
            subsystem = "archive",
            "finished entry '{}' ({} -> {} bytes)",
            info.name,
            info.uncompressed_size,
            info.compressed_size
        );
        Ok(info)
    }

    /// Seal any open entry, then write the central directory. The sink is flushed but kept;
    /// use `into_inner` to get it back.
    pub fn finish(&mut self) -> Result<u64, ArchiveError> {
        self.ensure_open()?;
        if self.current.is_some() {
            self.finish_current_entry()?;
        }

        let directory_offset = self.sink.count;
        let mut any_zip64 = false;
        for (_, record) in &self.records {
            any_zip64 |= record.needs_zip64();
            let header = format::central_directory_header(record);
            self.sink.write_all(&header)?;
        }
        let directory_size = self.sink.count - directory_offset;
        let entries = self.records.len() as u64;
        let zip64 = any_zip64
            || entries >= format::MAX_U16
            || directory_size >= format::MAX_U32
            || directory_offset >= format::MAX_U32;
        self.sink.write_all(&format::end_of_central_directory(
            entries,
            directory_size,
            directory_offset,
            zip64,
        ))?;
        self.sink.inner.flush()?;
        self.finished = true;
        tracing::debug!(
            subsystem = "archive",
            "archive finished: {} entries, {} bytes{}",
            entries,
            self.sink.count,
            if zip64 { " (zip64)" } else { "" }
        );
        Ok(self.sink.count)
    }

    pub fn into_inner(self) -> W {
        self.sink.inner
    }

    /// Uncompressed size of an entry, open or sealed.
    pub fn entry_size(&self, entry_id: u32) -> Option<u64> {
        if let Some(open) = self.current.as_ref().filter(|e| e.id == entry_id) {
            return Some(open.uncompressed);
        }
        self.records
            .iter()
            .find(|(id, _)| *id == entry_id)
            .map(|(_, r)| r.uncompressed_size)
    }

    pub fn entries(&self) -> Vec<ArchiveEntryInfo> {
        self.records
            .iter()
            .map(|(id, r)| ArchiveEntryInfo {
                id: *id,
                name: r.name.clone(),
                crc32: r.crc32,
                compressed_size: r.compressed_size,
                uncompressed_size: r.uncompressed_size,
                header_offset: r.header_offset,
            })
            .collect()
    }

    /// Seal the open entry, if any, and open `name` as a writer.
    pub fn entry_writer(&mut self, name: &str) -> Result<ZipEntryWriter<'_, W>, ArchiveError> {
        self.ensure_open()?;
        if self.current.is_some() {
            self.finish_current_entry()?;
        }
        let entry_id = self.create_entry(name)?;
        Ok(ZipEntryWriter {
            archive: self,
            entry_id,
            size: 0,
        })
    }

    /// Seal the open entry, if any, and copy `reader` into a new entry in fixed-size chunks.
    pub fn copy_entry_from<R: Read + ?Sized>(&mut self, name: &str, reader: &mut R) -> Result<ArchiveEntryInfo, ArchiveError> {
        self.ensure_open()?;
        if self.current.is_some() {
            self.finish_current_entry()?;
        }
        let entry_id = self.create_entry(name)?;
        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write_data(entry_id, &chunk[..n])?;
        }
        self.finish_current_entry()
    }

    fn ensure_open(&self) -> Result<(), ArchiveError> {
        if self.finished {
            Err(ArchiveError::AlreadyFinished)
        } else {
            Ok(())
        }
    }

    fn deflate(&mut self, input: &[u8], flush: FlushCompress) -> Result<(usize, usize, Status), ArchiveError> {
        let before_in = self.compressor.total_in();
        let before_out = self.compressor.total_out();
        let status = self
            .compressor
            .compress(input, &mut self.out_buffer[self.out_len..], flush)?;
        let consumed = (self.compressor.total_in() - before_in) as usize;
        let produced = (self.compressor.total_out() - before_out) as usize;
        self.out_len += produced;
        Ok((consumed, produced, status))
    }

    fn flush_out_buffer(&mut self) -> Result<(), ArchiveError> {
        if self.out_len == 0 {
            return Ok(());
        }
        self.sink.write_all(&self.out_buffer[..self.out_len])?;
        if let Some(entry) = self.current.as_mut() {
            entry.compressed += self.out_len as u64;
        }
        self.out_len = 0;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() {
        return Err(ArchiveError::InvalidName("empty name".to_string()));
    }
    if name.len() > format::MAX_NAME_LENGTH {
        return Err(ArchiveError::InvalidName(format!("name exceeds {} bytes", format::MAX_NAME_LENGTH)));
    }
    if name.starts_with('/') || name.contains('\0') {
        return Err(ArchiveError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `io::Write` view of one open entry.
pub struct ZipEntryWriter<'a, W: Write> {
    archive: &'a mut ZipStreamWriter<W>,
    entry_id: u32,
    size: u64,
}

impl<'a, W: Write> ZipEntryWriter<'a, W> {
    pub fn entry_id(&self) -> u32 {
        self.entry_id
    }

    /// Uncompressed bytes written through this writer.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write_string(&mut self, s: &str) -> Result<(), ArchiveError> {
        self.archive.write_data(self.entry_id, s.as_bytes())?;
        self.size += s.len() as u64;
        Ok(())
    }

    pub fn write_line(&mut self, s: &str) -> Result<(), ArchiveError> {
        self.write_string(s)?;
        self.write_string("\n")
    }

    pub fn finish(self) -> Result<ArchiveEntryInfo, ArchiveError> {
        self.archive.finish_current_entry()
    }
}

impl<'a, W: Write> Write for ZipEntryWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.archive
            .write_data(self.entry_id, buf)
            .map_err(|e| match e {
                ArchiveError::Io(io) => io,
                other => std::io::Error::other(other.to_string()),
            })?;
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_open_entry() {
        let mut zip = ZipStreamWriter::new(Vec::new());
        let first = zip.create_entry("a.txt").unwrap();
        assert_eq!(first, 1);
        assert!(matches!(zip.create_entry("b.txt"), Err(ArchiveError::EntryAlreadyOpen(_))));
        zip.finish_current_entry().unwrap();
        assert_eq!(zip.create_entry("b.txt").unwrap(), 2);
    }

    #[test]
    fn writes_go_to_the_open_entry_only() {
        let mut zip = ZipStreamWriter::new(Vec::new());
        assert!(matches!(zip.write_data(1, b"x"), Err(ArchiveError::NoOpenEntry)));
        let id = zip.create_entry("a.txt").unwrap();
        assert!(matches!(zip.write_data(id + 1, b"x"), Err(ArchiveError::WrongEntry(_))));
        zip.write_data(id, b"").unwrap();
        zip.write_data(id, b"hello").unwrap();
        assert_eq!(zip.entry_size(id), Some(5));
        let info = zip.finish_current_entry().unwrap();
        assert_eq!(info.uncompressed_size, 5);
        assert!(matches!(zip.write_data(id, b"x"), Err(ArchiveError::NoOpenEntry)));
    }

    #[test]
    fn finish_seals_and_locks() {
        let mut zip = ZipStreamWriter::new(Vec::new());
        let id = zip.create_entry("log.txt").unwrap();
        zip.write_data(id, b"line\n").unwrap();
        let total = zip.finish().unwrap();
        assert!(zip.is_finished());
        assert!(matches!(zip.create_entry("x"), Err(ArchiveError::AlreadyFinished)));
        assert!(matches!(zip.finish(), Err(ArchiveError::AlreadyFinished)));
        let bytes = zip.into_inner();
        assert_eq!(bytes.len() as u64, total);
        assert_eq!(&bytes[..4], &format::LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes());
        let eocd = &bytes[bytes.len() - 22..];
        assert_eq!(&eocd[..4], &format::END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
    }

    #[test]
    fn rejects_bad_names() {
        let mut zip = ZipStreamWriter::new(Vec::new());
        assert!(matches!(zip.create_entry(""), Err(ArchiveError::InvalidName(_))));
        assert!(matches!(zip.create_entry("/abs"), Err(ArchiveError::InvalidName(_))));
        let long = "a".repeat(format::MAX_NAME_LENGTH + 1);
        assert!(matches!(zip.create_entry(&long), Err(ArchiveError::InvalidName(_))));
    }

    #[test]
    fn entry_writer_tracks_size() {
        let mut zip = ZipStreamWriter::new(Vec::new());
        let mut entry = zip.entry_writer("notes.txt").unwrap();
        entry.write_line("first").unwrap();
        entry.write_all(b"second").unwrap();
        assert_eq!(entry.size(), 12);
        let info = entry.finish().unwrap();
        assert_eq!(info.uncompressed_size, 12);
    }

    #[test]
    fn compressed_output_spills_through_small_buffer() {
        // Incompressible input larger than the out buffer forces several flushes.
        let mut state = 0x1234_5678u32;
        let data: Vec<u8> = (0..OUT_BUFFER_SIZE * 3)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        let mut zip = ZipStreamWriter::new(Vec::new());
        let info = zip.copy_entry_from("noise.bin", &mut data.as_slice()).unwrap();
        assert_eq!(info.uncompressed_size, data.len() as u64);
        assert!(info.compressed_size > OUT_BUFFER_SIZE as u64);
        let mut crc = Crc::new();
        crc.update(&data);
        assert_eq!(info.crc32, crc.sum());
    }
}
