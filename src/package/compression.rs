//! Resource payload codecs.
//!
//! Packages written by the game store resources zlib-compressed. Older tools
//! (and packages converted from earlier titles) may still carry RefPack/QFS
//! streams, which are decoded here but never produced.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{Error, Result};

const ZLIB_HEADER: u8 = 0x78;
const REFPACK_SIGNATURE: u8 = 0xFB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    Zlib,
    RefPack,
}

/// Classifies a stored payload by its leading bytes.
pub fn detect(data: &[u8]) -> Option<CompressionKind> {
    match data {
        [ZLIB_HEADER, ..] => Some(CompressionKind::Zlib),
        [_, REFPACK_SIGNATURE, ..] => Some(CompressionKind::RefPack),
        _ => None,
    }
}

/// Decompresses `compressed_size` bytes of `data` into exactly `mem_size` bytes.
///
/// Callers are expected to have checked `mem_size` against their allocation
/// ceiling; the output buffer is sized from it up front.
pub fn decompress(data: &[u8], compressed_size: u32, mem_size: u32) -> Result<Vec<u8>> {
    let compressed_size = compressed_size as usize;
    if data.len() < compressed_size {
        return Err(Error::Corrupt(format!(
            "compressed stream truncated: {} of {} bytes",
            data.len(),
            compressed_size
        )));
    }
    let data = &data[..compressed_size];

    match detect(data) {
        Some(CompressionKind::Zlib) => decompress_zlib(data, mem_size as usize),
        Some(CompressionKind::RefPack) => decompress_refpack(data, mem_size as usize),
        None => Err(Error::Corrupt(format!(
            "unsupported compression header {:02X?}",
            &data[..data.len().min(2)]
        ))),
    }
}

fn decompress_zlib(data: &[u8], mem_size: usize) -> Result<Vec<u8>> {
    // One byte past the declared size is enough to detect an overlong stream.
    let mut decoder = ZlibDecoder::new(data).take(mem_size as u64 + 1);
    let mut decompressed = Vec::with_capacity(mem_size);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::Corrupt(format!("zlib stream: {e}")))?;

    if decompressed.len() != mem_size {
        return Err(Error::Corrupt(format!(
            "zlib size mismatch: expected {}, got {}",
            mem_size,
            if decompressed.len() > mem_size { "more".to_string() } else { decompressed.len().to_string() }
        )));
    }
    Ok(decompressed)
}

/// Always produces a zlib stream at the default level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Returns the compressed form only when it is strictly smaller than `data`.
pub fn compress_if_smaller(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let compressed = compress(data)?;
    Ok((compressed.len() < data.len()).then_some(compressed))
}

struct RefPackReader<'a> {
    src: &'a [u8],
    pos: usize,
    out: Vec<u8>,
    limit: usize,
}

impl RefPackReader<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .src
            .get(self.pos)
            .ok_or_else(|| Error::Corrupt(format!("RefPack stream truncated at byte {}", self.pos)))?;
        self.pos += 1;
        Ok(b)
    }

    fn size_field(&mut self, width: usize) -> Result<usize> {
        let mut value = 0usize;
        for _ in 0..width {
            value = (value << 8) | self.byte()? as usize;
        }
        Ok(value)
    }

    fn copy_plain(&mut self, count: usize) -> Result<()> {
        if self.pos + count > self.src.len() {
            return Err(Error::Corrupt(format!(
                "RefPack literal run of {} overruns input at byte {}",
                count, self.pos
            )));
        }
        if self.out.len() + count > self.limit {
            return Err(Error::Corrupt("RefPack output exceeds declared size".to_string()));
        }
        self.out.extend_from_slice(&self.src[self.pos..self.pos + count]);
        self.pos += count;
        Ok(())
    }

    fn copy_ref(&mut self, count: usize, distance: usize) -> Result<()> {
        if distance > self.out.len() {
            return Err(Error::Corrupt(format!(
                "RefPack back-reference distance {} exceeds output position {}",
                distance,
                self.out.len()
            )));
        }
        if self.out.len() + count > self.limit {
            return Err(Error::Corrupt("RefPack output exceeds declared size".to_string()));
        }
        // Byte-wise so overlapping references replicate the run.
        let start = self.out.len() - distance;
        for i in 0..count {
            let b = self.out[start + i];
            self.out.push(b);
        }
        Ok(())
    }
}

fn decompress_refpack(data: &[u8], mem_size: usize) -> Result<Vec<u8>> {
    let mut r = RefPackReader {
        src: data,
        pos: 0,
        out: Vec::with_capacity(mem_size),
        limit: mem_size,
    };

    let flags = r.byte()?;
    let signature = r.byte()?;
    if signature != REFPACK_SIGNATURE {
        return Err(Error::Corrupt(format!("invalid RefPack signature 0x{signature:02X}")));
    }
    let width = if flags & 0x80 != 0 { 4 } else { 3 };
    if flags & 0x01 != 0 {
        r.size_field(width)?;
    }
    let declared = r.size_field(width)?;
    if declared != mem_size {
        return Err(Error::Corrupt(format!(
            "RefPack header declares {declared} bytes, index declares {mem_size}"
        )));
    }

    loop {
        let b0 = r.byte()?;
        match b0 {
            0x00..=0x7F => {
                let b1 = r.byte()? as usize;
                let plain = (b0 & 0x03) as usize;
                let copy = (((b0 & 0x1C) >> 2) + 3) as usize;
                let distance = ((b0 as usize & 0x60) << 3) + b1 + 1;
                r.copy_plain(plain)?;
                r.copy_ref(copy, distance)?;
            }
            0x80..=0xBF => {
                let b1 = r.byte()? as usize;
                let b2 = r.byte()? as usize;
                let plain = (b1 & 0xC0) >> 6;
                let copy = (b0 & 0x3F) as usize + 4;
                let distance = ((b1 & 0x3F) << 8) + b2 + 1;
                r.copy_plain(plain)?;
                r.copy_ref(copy, distance)?;
            }
            0xC0..=0xDF => {
                let b1 = r.byte()? as usize;
                let b2 = r.byte()? as usize;
                let b3 = r.byte()? as usize;
                let plain = (b0 & 0x03) as usize;
                let copy = ((b0 as usize & 0x0C) << 6) + b3 + 5;
                let distance = ((b0 as usize & 0x10) << 12) + (b1 << 8) + b2 + 1;
                r.copy_plain(plain)?;
                r.copy_ref(copy, distance)?;
            }
            0xE0..=0xFB => {
                let plain = (((b0 & 0x1F) as usize) << 2) + 4;
                r.copy_plain(plain)?;
            }
            0xFC..=0xFF => {
                r.copy_plain((b0 & 0x03) as usize)?;
                break;
            }
        }
    }

    if r.out.len() != mem_size {
        return Err(Error::Corrupt(format!(
            "RefPack size mismatch: expected {}, got {}",
            mem_size,
            r.out.len()
        )));
    }
    Ok(r.out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_leading_bytes() {
        assert_eq!(detect(&[0x78, 0x9C]), Some(CompressionKind::Zlib));
        assert_eq!(detect(&[0x10, 0xFB, 0x00]), Some(CompressionKind::RefPack));
        assert_eq!(detect(&[0x00, 0x00]), None);
        assert_eq!(detect(&[]), None);
    }

    #[test]
    fn overlapping_reference_repeats_run() {
        // "ab" then copy 6 bytes from distance 2.
        let stream = [0x10, 0xFB, 0x00, 0x00, 0x08, 0x0E, 0x01, b'a', b'b', 0xFC];
        let out = decompress(&stream, stream.len() as u32, 8).unwrap();
        assert_eq!(out, b"abababab");
    }

    #[test]
    fn large_size_fields_with_compressed_size() {
        // flags 0x81: 4-byte sizes, compressed size present.
        let stream = [
            0x81, 0xFB, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x04, 0xE0, b'w', b'x', b'y',
            b'z', 0xFC,
        ];
        let out = decompress(&stream, stream.len() as u32, 4).unwrap();
        assert_eq!(out, b"wxyz");
    }

    #[test]
    fn compress_if_smaller_declines_incompressible() {
        assert!(compress_if_smaller(b"x").unwrap().is_none());
        assert!(compress_if_smaller(&[0u8; 4096]).unwrap().is_some());
    }
}
