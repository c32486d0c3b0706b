use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Result;

pub const CONST_TYPE: u32 = 0x01;
pub const CONST_GROUP: u32 = 0x02;
pub const CONST_INSTANCE_HIGH: u32 = 0x04;

/// Offset of a resource whose bytes only exist in memory.
pub const UNSAVED_OFFSET: u32 = 0xFFFF_FFFF;
pub const FILE_SIZE_MASK: u32 = 0x7FFF_FFFF;
pub const COMPRESSED_SIZE_BIT: u32 = 0x8000_0000;
pub const ZLIB_COMPRESSION: u16 = 0x5A42;
pub const LEGACY_COMPRESSION: u16 = 0xFFFF;

const TOMBSTONE_FILE_SIZE: u32 = 1;
const TOMBSTONE_MEM_SIZE: u32 = 0xFFFF_FFFF;

/// Smallest possible on-disk entry: instance low, offset, sizes and flags.
pub const MIN_ENTRY_SIZE: u64 = 20;

/// Type/Group/Instance key. Ordering is lexicographic in field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub res_type: u32,
    pub res_group: u32,
    pub instance: u64,
}

impl ResourceKey {
    pub fn new(res_type: u32, res_group: u32, instance: u64) -> Self {
        Self { res_type, res_group, instance }
    }

    pub fn instance_high(&self) -> u32 {
        (self.instance >> 32) as u32
    }

    pub fn instance_low(&self) -> u32 {
        self.instance as u32
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}:{:08X}:{:016X}", self.res_type, self.res_group, self.instance)
    }
}

impl FromStr for ResourceKey {
    type Err = String;

    /// Parses `TYPE:GROUP:INSTANCE` in hex, with or without `0x` prefixes.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(format!("expected TYPE:GROUP:INSTANCE, got {s:?}"));
        }
        let hex = |p: &str| p.trim_start_matches("0x").trim_start_matches("0X").to_string();
        let res_type = u32::from_str_radix(&hex(parts[0]), 16).map_err(|e| format!("type: {e}"))?;
        let res_group = u32::from_str_radix(&hex(parts[1]), 16).map_err(|e| format!("group: {e}"))?;
        let instance = u64::from_str_radix(&hex(parts[2]), 16).map_err(|e| format!("instance: {e}"))?;
        Ok(Self { res_type, res_group, instance })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: ResourceKey,
    pub chunk_offset: u32,
    pub file_size: u32, // Stored size, compressed-marker bit already masked off
    pub mem_size: u32,
    pub compression: u16, // 0x5A42 zlib, 0xFFFF legacy, 0x0000 uncompressed
    pub committed: u16,   // Usually 0x0001
    pub(crate) deleted: bool,
    pub(crate) pending: Option<Arc<[u8]>>,
}

impl IndexEntry {
    /// An entry describing bytes already placed at `chunk_offset`.
    pub fn new(key: ResourceKey, chunk_offset: u32, file_size: u32, mem_size: u32, compression: u16) -> Self {
        Self {
            key,
            chunk_offset,
            file_size: file_size & FILE_SIZE_MASK,
            mem_size,
            compression,
            committed: 1,
            deleted: false,
            pending: None,
        }
    }

    /// A new entry whose bytes live in memory until the next save.
    pub(crate) fn unsaved(key: ResourceKey, data: Arc<[u8]>) -> Self {
        let len = data.len() as u32;
        Self {
            key,
            chunk_offset: UNSAVED_OFFSET,
            file_size: len,
            mem_size: len,
            compression: 0,
            committed: 1,
            deleted: false,
            pending: Some(data),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_tombstone(&self) -> bool {
        self.file_size == TOMBSTONE_FILE_SIZE && self.mem_size == TOMBSTONE_MEM_SIZE
    }

    pub fn is_dirty(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_unsaved(&self) -> bool {
        self.chunk_offset == UNSAVED_OFFSET
    }

    pub(crate) fn set_pending(&mut self, data: Arc<[u8]>) {
        let len = data.len() as u32;
        self.chunk_offset = UNSAVED_OFFSET;
        self.file_size = len;
        self.mem_size = len;
        self.compression = 0;
        self.pending = Some(data);
    }
}

/// Which TGI components are stored once in the index header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexLayout {
    pub res_type: Option<u32>,
    pub res_group: Option<u32>,
    pub instance_high: Option<u32>,
}

impl IndexLayout {
    /// Marks every field that all entries share as header-constant.
    pub fn derive<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a IndexEntry>,
    {
        let mut iter = entries.into_iter();
        let Some(first) = iter.next() else {
            return Self::default();
        };
        let mut layout = Self {
            res_type: Some(first.key.res_type),
            res_group: Some(first.key.res_group),
            instance_high: Some(first.key.instance_high()),
        };
        for entry in iter {
            if layout.res_type != Some(entry.key.res_type) {
                layout.res_type = None;
            }
            if layout.res_group != Some(entry.key.res_group) {
                layout.res_group = None;
            }
            if layout.instance_high != Some(entry.key.instance_high()) {
                layout.instance_high = None;
            }
            if layout == Self::default() {
                break;
            }
        }
        layout
    }

    pub fn index_type(&self) -> u32 {
        let mut flags = 0;
        if self.res_type.is_some() {
            flags |= CONST_TYPE;
        }
        if self.res_group.is_some() {
            flags |= CONST_GROUP;
        }
        if self.instance_high.is_some() {
            flags |= CONST_INSTANCE_HIGH;
        }
        flags
    }

    pub fn entry_size(&self) -> u64 {
        entry_size(self.index_type())
    }

    /// Total bytes `PackageIndex::write` emits for `count` entries.
    pub fn encoded_size(&self, count: u32) -> u64 {
        encoded_size(self.index_type(), count)
    }
}

fn constant_count(index_type: u32) -> u64 {
    (index_type & (CONST_TYPE | CONST_GROUP | CONST_INSTANCE_HIGH)).count_ones() as u64
}

/// Per-entry size for an index-type word; header constants shrink every entry.
pub fn entry_size(index_type: u32) -> u64 {
    32 - 4 * constant_count(index_type)
}

/// Bytes an index of `count` entries occupies under `index_type`.
pub fn encoded_size(index_type: u32, count: u32) -> u64 {
    4 * (1 + constant_count(index_type)) + count as u64 * entry_size(index_type)
}

#[derive(Debug, Clone, Default)]
pub struct PackageIndex {
    pub index_type: u32,
    pub entries: Vec<IndexEntry>,
}

impl PackageIndex {
    pub fn parse<R: Read + Seek>(reader: &mut R, position: u64, count: u32) -> Result<Self> {
        reader.seek(SeekFrom::Start(position))?;
        let index_type = reader.read_u32::<LittleEndian>()?;

        let mut layout = IndexLayout::default();
        if index_type & CONST_TYPE != 0 {
            layout.res_type = Some(reader.read_u32::<LittleEndian>()?);
        }
        if index_type & CONST_GROUP != 0 {
            layout.res_group = Some(reader.read_u32::<LittleEndian>()?);
        }
        if index_type & CONST_INSTANCE_HIGH != 0 {
            layout.instance_high = Some(reader.read_u32::<LittleEndian>()?);
        }
        debug!("Index type 0x{:08X}, {} entries at 0x{:X}", index_type, count, position);

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let res_type = match layout.res_type {
                Some(t) => t,
                None => reader.read_u32::<LittleEndian>()?,
            };
            let res_group = match layout.res_group {
                Some(g) => g,
                None => reader.read_u32::<LittleEndian>()?,
            };
            let instance_hi = match layout.instance_high {
                Some(ihi) => ihi,
                None => reader.read_u32::<LittleEndian>()?,
            };
            let instance_lo = reader.read_u32::<LittleEndian>()?;
            let chunk_offset = reader.read_u32::<LittleEndian>()?;
            let file_size_raw = reader.read_u32::<LittleEndian>()?;
            let file_size = file_size_raw & FILE_SIZE_MASK;
            let mem_size = reader.read_u32::<LittleEndian>()?;
            let mut compression = reader.read_u16::<LittleEndian>()?;
            let committed = reader.read_u16::<LittleEndian>()?;

            // Some writers mark compression with the size bit alone.
            if file_size_raw & COMPRESSED_SIZE_BIT != 0 && compression == 0 && file_size != mem_size {
                compression = ZLIB_COMPRESSION;
            }

            let mut entry = IndexEntry {
                key: ResourceKey {
                    res_type,
                    res_group,
                    instance: ((instance_hi as u64) << 32) | instance_lo as u64,
                },
                chunk_offset,
                file_size,
                mem_size,
                compression,
                committed,
                deleted: false,
                pending: None,
            };
            entry.deleted = entry.is_tombstone();
            entries.push(entry);
        }

        Ok(Self { index_type, entries })
    }

    /// Writes the index in the given layout and returns the byte count.
    pub fn write<'a, W, I>(writer: &mut W, entries: I, layout: &IndexLayout) -> Result<u64>
    where
        W: Write,
        I: IntoIterator<Item = &'a IndexEntry>,
    {
        writer.write_u32::<LittleEndian>(layout.index_type())?;
        let mut written = 4u64;
        for constant in [layout.res_type, layout.res_group, layout.instance_high]
            .into_iter()
            .flatten()
        {
            writer.write_u32::<LittleEndian>(constant)?;
            written += 4;
        }

        for entry in entries {
            if layout.res_type.is_none() {
                writer.write_u32::<LittleEndian>(entry.key.res_type)?;
            }
            if layout.res_group.is_none() {
                writer.write_u32::<LittleEndian>(entry.key.res_group)?;
            }
            if layout.instance_high.is_none() {
                writer.write_u32::<LittleEndian>(entry.key.instance_high())?;
            }
            writer.write_u32::<LittleEndian>(entry.key.instance_low())?;
            writer.write_u32::<LittleEndian>(entry.chunk_offset)?;
            let file_size = if entry.is_compressed() {
                entry.file_size | COMPRESSED_SIZE_BIT
            } else {
                entry.file_size
            };
            writer.write_u32::<LittleEndian>(file_size)?;
            writer.write_u32::<LittleEndian>(entry.mem_size)?;
            writer.write_u16::<LittleEndian>(entry.compression)?;
            writer.write_u16::<LittleEndian>(entry.committed)?;
            written += layout.entry_size();
        }

        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(|e| !e.deleted)
    }

    pub(crate) fn position_of(&self, key: &ResourceKey) -> Option<usize> {
        self.entries.iter().position(|e| !e.deleted && e.key == *key)
    }

    pub fn layout(&self) -> IndexLayout {
        IndexLayout::derive(self.live())
    }
}
