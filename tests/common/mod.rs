#![allow(dead_code)]

use dbpf_core::ResourceKey;

pub const CREATED: u32 = 0x5F00_1234;
pub const MODIFIED: u32 = 0x5F00_5678;

/// One resource as it should appear on disk.
pub struct RawEntry {
    pub key: ResourceKey,
    pub stored: Vec<u8>,
    pub file_size_field: u32,
    pub mem_size: u32,
    pub compression: u16,
}

impl RawEntry {
    pub fn plain(key: ResourceKey, data: &[u8]) -> Self {
        Self {
            key,
            stored: data.to_vec(),
            file_size_field: data.len() as u32,
            mem_size: data.len() as u32,
            compression: 0,
        }
    }

    pub fn compressed(key: ResourceKey, stored: Vec<u8>, mem_size: u32, compression: u16) -> Self {
        Self {
            key,
            file_size_field: stored.len() as u32 | 0x8000_0000,
            stored,
            mem_size,
            compression,
        }
    }
}

pub fn header(index_count: u32, index_size: u32, index_position: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(96);
    h.extend_from_slice(b"DBPF");
    h.extend_from_slice(&2u32.to_le_bytes()); // major
    h.extend_from_slice(&1u32.to_le_bytes()); // minor
    h.extend_from_slice(&[0u8; 12]); // user version, flags
    h.extend_from_slice(&CREATED.to_le_bytes());
    h.extend_from_slice(&MODIFIED.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // index major version
    h.extend_from_slice(&index_count.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // legacy index position
    h.extend_from_slice(&index_size.to_le_bytes());
    h.extend_from_slice(&[0u8; 12]); // hole count/position/size
    h.extend_from_slice(&3u32.to_le_bytes()); // index minor version
    h.extend_from_slice(&index_position.to_le_bytes());
    h.extend_from_slice(&[0xA5u8; 28]); // reserved, deliberately non-zero
    assert_eq!(h.len(), 96);
    h
}

/// Lays out a package by hand: header, resource bytes, then an index using
/// `index_type` with constants taken from the first entry.
pub fn build_package(entries: &[RawEntry], index_type: u32) -> Vec<u8> {
    let mut body = Vec::new();
    let mut offsets = Vec::new();
    for entry in entries {
        offsets.push(96 + body.len() as u32);
        body.extend_from_slice(&entry.stored);
    }

    let mut index = Vec::new();
    index.extend_from_slice(&index_type.to_le_bytes());
    let first = &entries[0].key;
    if index_type & 1 != 0 {
        index.extend_from_slice(&first.res_type.to_le_bytes());
    }
    if index_type & 2 != 0 {
        index.extend_from_slice(&first.res_group.to_le_bytes());
    }
    if index_type & 4 != 0 {
        index.extend_from_slice(&((first.instance >> 32) as u32).to_le_bytes());
    }
    for (entry, offset) in entries.iter().zip(&offsets) {
        if index_type & 1 == 0 {
            index.extend_from_slice(&entry.key.res_type.to_le_bytes());
        }
        if index_type & 2 == 0 {
            index.extend_from_slice(&entry.key.res_group.to_le_bytes());
        }
        if index_type & 4 == 0 {
            index.extend_from_slice(&((entry.key.instance >> 32) as u32).to_le_bytes());
        }
        index.extend_from_slice(&(entry.key.instance as u32).to_le_bytes());
        index.extend_from_slice(&offset.to_le_bytes());
        index.extend_from_slice(&entry.file_size_field.to_le_bytes());
        index.extend_from_slice(&entry.mem_size.to_le_bytes());
        index.extend_from_slice(&entry.compression.to_le_bytes());
        index.extend_from_slice(&1u16.to_le_bytes());
    }

    let index_position = 96 + body.len() as u32;
    let mut data = header(entries.len() as u32, index.len() as u32, index_position);
    data.extend_from_slice(&body);
    data.extend_from_slice(&index);
    data
}

/// RefPack stream exercising every command shape; decodes to `REFPACK_DECODED`.
pub const REFPACK_FIXTURE: [u8; 24] = [
    0x10, 0xFB, 0x00, 0x00, 0x14, // flags, signature, 3-byte size (20)
    0xE0, b'A', b'B', b'C', b'D', // literal run of 4
    0x01, 0x04, b'E', // 1 literal, copy 3 from distance 5
    0x80, 0x80, 0x09, b'F', b'G', // 2 literals, copy 4 from distance 10
    0xC0, 0x00, 0x0D, 0x00, // copy 5 from distance 14
    0xFD, b'Z', // stop with 1 trailing literal
];

pub const REFPACK_DECODED: &[u8] = b"ABCDEABCFGABCDABCDEZ";
