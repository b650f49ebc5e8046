// src/archive/format.rs - ZIP record layouts

use chrono::{DateTime, Datelike, Timelike, Utc};

pub const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;
pub const ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0606_4b50;
pub const ZIP64_END_OF_CENTRAL_DIRECTORY_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;

pub const VERSION_NEEDED_ZIP64: u16 = 45;
pub const VERSION_MADE_BY: u16 = 45;

pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
pub const FLAG_UTF8: u16 = 1 << 11;
pub const METHOD_DEFLATED: u16 = 8;
pub const EXTERNAL_ATTRIBUTES: u32 = 0x80;

pub const ZIP64_EXTRA_TAG: u16 = 0x0001;
pub const LOCAL_ZIP64_EXTRA_SIZE: u16 = 16;
pub const MAX_U32: u64 = 0xFFFF_FFFF;
pub const MAX_U16: u64 = 0xFFFF;
pub const MAX_NAME_LENGTH: usize = 32_000;
pub const MAX_ENTRY_COUNT: u64 = 0x7FFF_FFFF;

const ZIP64_EOCD_RECORD_SIZE: u64 = 44;

/// MS-DOS packed time and date. Dates before 1980 clamp to the DOS epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub time: u16,
    pub date: u16,
}

impl From<DateTime<Utc>> for DosDateTime {
    fn from(ts: DateTime<Utc>) -> Self {
        if ts.year() < 1980 {
            return DosDateTime { time: 0, date: (1 << 5) | 1 };
        }
        let year = (ts.year() - 1980).min(127) as u16;
        let date = (year << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
        let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() as u16 / 2);
        DosDateTime { time, date }
    }
}

/// Little-endian record builder.
#[derive(Default)]
pub struct RecordBuf(pub Vec<u8>);

impl RecordBuf {
    pub fn with_capacity(n: usize) -> Self {
        RecordBuf(Vec::with_capacity(n))
    }
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.0.extend_from_slice(v);
        self
    }
}

/// Bookkeeping kept per sealed entry until the central directory is written.
#[derive(Debug, Clone, PartialEq)]
pub struct CentralRecord {
    pub name: String,
    pub modified: DosDateTime,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
}

impl CentralRecord {
    pub fn needs_zip64(&self) -> bool {
        self.compressed_size >= MAX_U32 || self.uncompressed_size >= MAX_U32 || self.header_offset >= MAX_U32
    }
}

/// Sizes are unknown while streaming, so every local header carries a ZIP64 extra
/// with zero sizes. Readers then take the data descriptor sizes as 64-bit.
pub fn local_file_header(name: &str, modified: DosDateTime) -> Vec<u8> {
    let mut buf = RecordBuf::with_capacity(30 + name.len() + 4 + LOCAL_ZIP64_EXTRA_SIZE as usize);
    buf.u32(LOCAL_FILE_HEADER_SIGNATURE)
        .u16(VERSION_NEEDED_ZIP64)
        .u16(FLAG_DATA_DESCRIPTOR | FLAG_UTF8)
        .u16(METHOD_DEFLATED)
        .u16(modified.time)
        .u16(modified.date)
        // crc and sizes follow in the data descriptor
        .u32(0)
        .u32(MAX_U32 as u32)
        .u32(MAX_U32 as u32)
        .u16(name.len() as u16)
        .u16(4 + LOCAL_ZIP64_EXTRA_SIZE)
        .bytes(name.as_bytes())
        .u16(ZIP64_EXTRA_TAG)
        .u16(LOCAL_ZIP64_EXTRA_SIZE)
        .u64(0)
        .u64(0);
    buf.0
}

/// Always the 64-bit form, matching the ZIP64 extra in the local header.
pub fn data_descriptor(crc32: u32, compressed: u64, uncompressed: u64) -> Vec<u8> {
    let mut buf = RecordBuf::with_capacity(24);
    buf.u32(DATA_DESCRIPTOR_SIGNATURE)
        .u32(crc32)
        .u64(compressed)
        .u64(uncompressed);
    buf.0
}

pub fn central_directory_header(record: &CentralRecord) -> Vec<u8> {
    let zip64 = record.needs_zip64();
    let mut extra = RecordBuf::default();
    if zip64 {
        extra
            .u16(ZIP64_EXTRA_TAG)
            .u16(24)
            .u64(record.uncompressed_size)
            .u64(record.compressed_size)
            .u64(record.header_offset);
    }
    let (compressed, uncompressed, offset) = if zip64 {
        (MAX_U32 as u32, MAX_U32 as u32, MAX_U32 as u32)
    } else {
        (
            record.compressed_size as u32,
            record.uncompressed_size as u32,
            record.header_offset as u32,
        )
    };
    let mut buf = RecordBuf::with_capacity(46 + record.name.len() + extra.0.len());
    buf.u32(CENTRAL_DIRECTORY_SIGNATURE)
        .u16(VERSION_MADE_BY)
        .u16(VERSION_NEEDED_ZIP64)
        .u16(FLAG_DATA_DESCRIPTOR | FLAG_UTF8)
        .u16(METHOD_DEFLATED)
        .u16(record.modified.time)
        .u16(record.modified.date)
        .u32(record.crc32)
        .u32(compressed)
        .u32(uncompressed)
        .u16(record.name.len() as u16)
        .u16(extra.0.len() as u16)
        .u16(0) // comment length
        .u16(0) // disk number start
        .u16(0) // internal attributes
        .u32(EXTERNAL_ATTRIBUTES)
        .u32(offset)
        .bytes(record.name.as_bytes())
        .bytes(&extra.0);
    buf.0
}

/// Directory trailer. Emits the ZIP64 end record and locator first when `zip64` is set.
pub fn end_of_central_directory(entries: u64, directory_size: u64, directory_offset: u64, zip64: bool) -> Vec<u8> {
    let mut buf = RecordBuf::with_capacity(98);
    if zip64 {
        let zip64_record_offset = directory_offset + directory_size;
        buf.u32(ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE)
            .u64(ZIP64_EOCD_RECORD_SIZE)
            .u16(VERSION_MADE_BY)
            .u16(VERSION_NEEDED_ZIP64)
            .u32(0)
            .u32(0)
            .u64(entries)
            .u64(entries)
            .u64(directory_size)
            .u64(directory_offset);
        buf.u32(ZIP64_END_OF_CENTRAL_DIRECTORY_LOCATOR_SIGNATURE)
            .u32(0)
            .u64(zip64_record_offset)
            .u32(1);
    }
    let count = entries.min(MAX_U16) as u16;
    buf.u32(END_OF_CENTRAL_DIRECTORY_SIGNATURE)
        .u16(0)
        .u16(0)
        .u16(count)
        .u16(count)
        .u32(directory_size.min(MAX_U32) as u32)
        .u32(directory_offset.min(MAX_U32) as u32)
        .u16(0);
    buf.0
}
