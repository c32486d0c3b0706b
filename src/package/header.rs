use binrw::binrw;
use std::io::Cursor;

use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = *b"DBPF";
pub const SUPPORTED_MAJOR: u32 = 2;
pub const SUPPORTED_MINOR: u32 = 1;

#[binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[br(little)]
#[bw(little)]
pub struct PackageHeader {
    pub magic: [u8; 4],           // "DBPF"
    pub major: u32,               // 2
    pub minor: u32,               // 1
    pub user_version_major: u32,
    pub user_version_minor: u32,
    pub flags: u32,
    pub created: u32,
    pub modified: u32,
    pub index_major_version: u32,
    pub index_count: u32,
    pub legacy_index_position: u32, // Only consulted when index_position is zero
    pub index_size: u32,
    pub hole_count: u32,
    pub hole_position: u32,
    pub hole_size: u32,
    pub index_minor_version: u32, // 3 in packages written by the game
    pub index_position: u32,
    pub reserved: [u8; 28],
}

impl Default for PackageHeader {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            major: SUPPORTED_MAJOR,
            minor: SUPPORTED_MINOR,
            user_version_major: 0,
            user_version_minor: 0,
            flags: 0,
            created: 0,
            modified: 0,
            index_major_version: 0,
            index_count: 0,
            legacy_index_position: 0,
            index_size: 0,
            hole_count: 0,
            hole_position: 0,
            hole_size: 0,
            index_minor_version: 3,
            index_position: 0,
            reserved: [0; 28],
        }
    }
}

impl PackageHeader {
    pub const SIZE: u64 = 96;

    /// Parses and validates a header from its 96 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE as usize {
            return Err(Error::Format(format!(
                "header truncated: {} of {} bytes",
                bytes.len(),
                Self::SIZE
            )));
        }
        let header = Self::read(&mut Cursor::new(&bytes[..Self::SIZE as usize]))?;
        header.validate()?;
        Ok(header)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(Self::SIZE as usize);
        self.write(&mut Cursor::new(&mut data))?;
        Ok(data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Format(format!("bad magic {:02X?}", self.magic)));
        }
        if self.major != SUPPORTED_MAJOR || self.minor != SUPPORTED_MINOR {
            return Err(Error::UnsupportedVersion {
                major: self.major,
                minor: self.minor,
            });
        }
        Ok(())
    }

    /// Where the index lives; older writers only filled the legacy field.
    pub fn resolved_index_position(&self) -> u64 {
        if self.index_position != 0 {
            self.index_position as u64
        } else {
            self.legacy_index_position as u64
        }
    }

    pub(crate) fn set_index(&mut self, count: u32, size: u32, position: u32) {
        self.index_count = count;
        self.index_size = size;
        self.index_position = position;
        self.legacy_index_position = 0;
        self.hole_count = 0;
        self.hole_position = 0;
        self.hole_size = 0;
    }

    pub fn read<R: std::io::Read + std::io::Seek>(reader: &mut R) -> binrw::BinResult<Self> {
        use binrw::BinReaderExt;
        reader.read_le()
    }

    pub fn write<W: std::io::Write + std::io::Seek>(&self, writer: &mut W) -> binrw::BinResult<()> {
        use binrw::BinWriterExt;
        writer.write_le(self)
    }
}
