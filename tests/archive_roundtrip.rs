// Archives written by the streaming writer, read back with a standard ZIP reader

mod common;

use chrono::{TimeZone, Utc};
use foundry_rs::archive::{ArchiveError, ZipStreamWriter};
use foundry_shared::StorageStream;
use rand::{Rng, RngCore};
use std::io::{Cursor, Read, Write};

fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

fn open(bytes: Vec<u8>) -> zip::ZipArchive<Cursor<Vec<u8>>> {
    zip::ZipArchive::new(Cursor::new(bytes)).expect("archive should parse")
}

fn read_entry(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>, index: usize) -> (String, u32, Vec<u8>) {
    let mut file = archive.by_index(index).unwrap();
    let mut data = Vec::new();
    file.read_to_end(&mut data).unwrap();
    (file.name().to_string(), file.crc32(), data)
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn le64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

/// Walks the archive front to back the way a streaming reader does: local header,
/// data, descriptor, next header. The ZIP64 extra in each local header means the
/// descriptor sizes are 64-bit; they must agree with the central directory.
fn assert_streamable(bytes: &[u8]) {
    let mut archive = open(bytes.to_vec());
    let mut pos = 0usize;
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index).unwrap();
        assert_eq!(file.header_start() as usize, pos, "entry {} not contiguous", index);
        assert_eq!(le32(bytes, pos), 0x0403_4b50);
        assert_eq!(le16(bytes, pos + 4), 45);
        let name_len = le16(bytes, pos + 26) as usize;
        let extra_len = le16(bytes, pos + 28) as usize;
        let extra_at = pos + 30 + name_len;
        assert!(extra_len >= 20);
        assert_eq!(le16(bytes, extra_at), 0x0001);
        assert_eq!(le16(bytes, extra_at + 2), 16);

        let descriptor = extra_at + extra_len + file.compressed_size() as usize;
        assert_eq!(le32(bytes, descriptor), 0x0807_4b50);
        assert_eq!(le32(bytes, descriptor + 4), file.crc32());
        assert_eq!(le64(bytes, descriptor + 8), file.compressed_size());
        assert_eq!(le64(bytes, descriptor + 16), file.size());
        pos = descriptor + 24;
    }
    assert_eq!(le32(bytes, pos), 0x0201_4b50);
}

#[test]
fn random_entries_round_trip() {
    let mut rng = rand::rng();
    let mut expected = Vec::new();
    let mut writer = ZipStreamWriter::new(Vec::new());
    let modified = Utc.with_ymd_and_hms(2024, 3, 14, 15, 9, 26).unwrap();

    for i in 0..24 {
        let size = match i % 4 {
            0 => 0,
            1 => rng.random_range(1..512),
            2 => rng.random_range(60_000..200_000),
            _ => rng.random_range(1_000_000..3_000_000),
        };
        let mut data = vec![0u8; size];
        if i % 2 == 0 {
            rng.fill_bytes(&mut data);
        } else {
            // Compressible: repeated text.
            for (j, b) in data.iter_mut().enumerate() {
                *b = b"layer,segments,length\n"[j % 22];
            }
        }
        let name = format!("dir{}/entry_{:03}.bin", i % 3, i);
        let id = writer.start_new_entry(&name, modified).unwrap();
        assert_eq!(id, i as u32 + 1);
        for chunk in data.chunks(rng.random_range(1..100_000).max(1)) {
            writer.write_data(id, chunk).unwrap();
        }
        let info = writer.finish_current_entry().unwrap();
        assert_eq!(info.uncompressed_size, size as u64);
        assert_eq!(info.crc32, crc32(&data));
        expected.push((name, data));
    }
    let total = writer.finish().unwrap();
    let bytes = writer.into_inner();
    assert_eq!(total, bytes.len() as u64);
    assert_streamable(&bytes);

    let mut archive = open(bytes);
    assert_eq!(archive.len(), expected.len());
    for (index, (name, data)) in expected.iter().enumerate() {
        let (read_name, read_crc, read_data) = read_entry(&mut archive, index);
        assert_eq!(&read_name, name);
        assert_eq!(read_crc, crc32(data));
        assert!(read_data == *data, "entry {} differs", name);
    }
}

#[test]
fn utf8_names_and_writer_helpers() {
    let mut writer = ZipStreamWriter::new(Vec::new());
    {
        let mut entry = writer.entry_writer("Schicht_ü/übersicht.txt").unwrap();
        entry.write_line("layer 1").unwrap();
        write!(entry, "layer {}", 2).unwrap();
        assert_eq!(entry.size(), 15);
    }
    let mut source = Cursor::new(vec![7u8; 3 * 1024 * 1024 + 17]);
    let info = writer.copy_entry_from("blob.raw", &mut source).unwrap();
    assert_eq!(info.uncompressed_size, 3 * 1024 * 1024 + 17);
    writer.finish().unwrap();
    assert!(matches!(writer.create_entry("late.txt"), Err(ArchiveError::AlreadyFinished)));
    assert!(matches!(writer.finish(), Err(ArchiveError::AlreadyFinished)));

    let mut archive = open(writer.into_inner());
    assert_eq!(archive.len(), 2);
    let (name, _, data) = read_entry(&mut archive, 0);
    assert_eq!(name, "Schicht_ü/übersicht.txt");
    assert_eq!(data, b"layer 1\nlayer 2");
    let (_, _, blob) = read_entry(&mut archive, 1);
    assert!(blob.iter().all(|b| *b == 7));
}

#[test]
fn archives_become_storage_streams() {
    let dir = tempfile::tempdir().unwrap();
    let context = common::context(dir.path());
    let sink = context.storage.create_sink("report.zip").unwrap();
    let mut writer = ZipStreamWriter::new(sink);
    let mut entry = writer.entry_writer("summary.json").unwrap();
    entry.write_string("{\"layers\":3}").unwrap();
    entry.finish().unwrap();
    writer.finish().unwrap();
    let stream = writer.into_inner().finish().unwrap();

    let stored = context.storage.retrieve(stream.uuid()).unwrap();
    assert_eq!(stored.name(), "report.zip");
    let mut bytes = Vec::new();
    stored.open().unwrap().read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes.len() as u64, stored.size());

    let mut archive = open(bytes);
    let (_, _, data) = read_entry(&mut archive, 0);
    assert_eq!(data, b"{\"layers\":3}");
    context.scheduler.shutdown();
}

#[test]
fn more_than_65534_entries_use_zip64_directory() {
    let count = 70_000usize;
    let mut writer = ZipStreamWriter::new(Vec::new());
    for i in 0..count {
        let mut entry = writer.entry_writer(&format!("frames/{:06}.txt", i)).unwrap();
        entry.write_string(&i.to_string()).unwrap();
    }
    writer.finish().unwrap();
    let bytes = writer.into_inner();

    // zip64 end-of-central-directory record signature
    assert!(bytes.windows(4).any(|w| w == [0x50, 0x4b, 0x06, 0x06]));
    assert_streamable(&bytes);

    let mut archive = open(bytes);
    assert_eq!(archive.len(), count);
    for index in [0, 1, 65_534, 65_535, count - 1] {
        let (name, _, data) = read_entry(&mut archive, index);
        assert_eq!(name, format!("frames/{:06}.txt", index));
        assert_eq!(data, index.to_string().as_bytes());
    }
}

#[test]
#[ignore = "writes and inflates more than 4 GiB"]
fn entry_larger_than_4_gib() {
    let size: u64 = (4 << 30) + 123_457;
    let mut writer = ZipStreamWriter::new(Vec::new());
    let mut zeros = std::io::repeat(0).take(size);
    let info = writer.copy_entry_from("huge.bin", &mut zeros).unwrap();
    assert_eq!(info.uncompressed_size, size);
    writer.create_entry("after.txt").unwrap();
    writer.write_data(2, b"tail").unwrap();
    writer.finish().unwrap();
    let bytes = writer.into_inner();
    assert_streamable(&bytes);

    let mut archive = open(bytes);
    assert_eq!(archive.len(), 2);
    {
        let mut huge = archive.by_index(0).unwrap();
        assert_eq!(huge.size(), size);
        let read = std::io::copy(&mut huge, &mut std::io::sink()).unwrap();
        assert_eq!(read, size);
    }
    let (_, _, tail) = read_entry(&mut archive, 1);
    assert_eq!(tail, b"tail");
}
