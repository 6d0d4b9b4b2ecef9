//! Android sparse images.
//!
//! A sparse image is a 28-byte file header followed by chunks, each with a
//! 12-byte header. RAW chunks carry their blocks verbatim, FILL chunks a
//! 4-byte pattern, DONTCARE chunks nothing, and CRC32 chunks a checksum of
//! the data so far.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

pub const MAGIC: u32 = 0xed26_ff3a;
pub const FILE_HEADER_LEN: usize = 28;
pub const CHUNK_HEADER_LEN: usize = 12;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

const MAJOR: u16 = 1;
const MINOR: u16 = 0;

const CHUNK_TYPE_RAW: u16 = 0xcac1;
const CHUNK_TYPE_FILL: u16 = 0xcac2;
const CHUNK_TYPE_DONTCARE: u16 = 0xcac3;
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SparseError {
    #[error("Invalid magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("Unsupported version {0}.{1}")]
    BadVersion(u16, u16),

    #[error("Invalid header length {0}")]
    BadHeaderLen(u16),

    #[error("Invalid chunk header length {0}")]
    BadChunkHeaderLen(u16),

    #[error("Invalid block size {0}, should be a non-zero multiple of 4")]
    BadBlockSize(u32),

    #[error("Invalid chunk type 0x{0:04x}")]
    BadChunkType(u16),

    #[error("Chunk {index} declares {total_size} bytes, expected {expected}")]
    BadChunkSize { index: usize, total_size: u32, expected: u64 },

    #[error("Sparse image is truncated")]
    Truncated,

    #[error("Buffer of {bufsize} bytes cannot hold a single {block_size}-byte block")]
    BufferTooSmall { bufsize: usize, block_size: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkData {
    Raw(Vec<u8>),
    Fill([u8; 4]),
    DontCare,
    Crc32(u32),
}

/// One chunk and the number of output blocks it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub blocks: u32,
    pub data: ChunkData,
}

impl Chunk {
    fn type_code(&self) -> u16 {
        match self.data {
            ChunkData::Raw(_) => CHUNK_TYPE_RAW,
            ChunkData::Fill(_) => CHUNK_TYPE_FILL,
            ChunkData::DontCare => CHUNK_TYPE_DONTCARE,
            ChunkData::Crc32(_) => CHUNK_TYPE_CRC32,
        }
    }

    /// Size of the encoded chunk, header included.
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_LEN
            + match &self.data {
                ChunkData::Raw(data) => data.len(),
                ChunkData::Fill(_) | ChunkData::Crc32(_) => 4,
                ChunkData::DontCare => 0,
            }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.data, ChunkData::Raw(_))
    }
}

fn truncated(_: std::io::Error) -> SparseError {
    SparseError::Truncated
}

/// A parsed sparse image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseImage {
    pub block_size: u32,
    pub checksum: u32,
    pub chunks: Vec<Chunk>,
}

impl SparseImage {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            checksum: 0,
            chunks: Vec::new(),
        }
    }

    pub fn is_sparse(blob: &[u8]) -> bool {
        blob.get(..4) == Some(&MAGIC.to_le_bytes()[..])
    }

    pub fn parse(blob: &[u8]) -> Result<Self, SparseError> {
        let mut cur = Cursor::new(blob);
        let magic = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        if magic != MAGIC {
            return Err(SparseError::BadMagic(magic));
        }
        let major = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        let minor = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        if (major, minor) != (MAJOR, MINOR) {
            return Err(SparseError::BadVersion(major, minor));
        }
        let header_len = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        if header_len as usize != FILE_HEADER_LEN {
            return Err(SparseError::BadHeaderLen(header_len));
        }
        let chunk_header_len = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        if chunk_header_len as usize != CHUNK_HEADER_LEN {
            return Err(SparseError::BadChunkHeaderLen(chunk_header_len));
        }
        let block_size = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        if block_size == 0 || block_size % 4 != 0 {
            return Err(SparseError::BadBlockSize(block_size));
        }
        let _total_blocks = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let total_chunks = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let checksum = cur.read_u32::<LittleEndian>().map_err(truncated)?;

        let mut chunks = Vec::with_capacity(total_chunks.min(4096) as usize);
        for index in 0..total_chunks as usize {
            let kind = cur.read_u16::<LittleEndian>().map_err(truncated)?;
            let _reserved = cur.read_u16::<LittleEndian>().map_err(truncated)?;
            let blocks = cur.read_u32::<LittleEndian>().map_err(truncated)?;
            let total_size = cur.read_u32::<LittleEndian>().map_err(truncated)?;

            let payload: u64 = match kind {
                CHUNK_TYPE_RAW => blocks as u64 * block_size as u64,
                CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => 4,
                CHUNK_TYPE_DONTCARE => 0,
                other => return Err(SparseError::BadChunkType(other)),
            };
            let expected = payload + CHUNK_HEADER_LEN as u64;
            if total_size as u64 != expected {
                return Err(SparseError::BadChunkSize {
                    index,
                    total_size,
                    expected,
                });
            }
            let data = match kind {
                CHUNK_TYPE_RAW => {
                    let remaining = blob.len() as u64 - cur.position();
                    if payload > remaining {
                        return Err(SparseError::Truncated);
                    }
                    let mut data = vec![0u8; payload as usize];
                    cur.read_exact(&mut data).map_err(truncated)?;
                    ChunkData::Raw(data)
                }
                CHUNK_TYPE_FILL => {
                    let mut pattern = [0u8; 4];
                    cur.read_exact(&mut pattern).map_err(truncated)?;
                    ChunkData::Fill(pattern)
                }
                CHUNK_TYPE_CRC32 => ChunkData::Crc32(cur.read_u32::<LittleEndian>().map_err(truncated)?),
                _ => ChunkData::DontCare,
            };
            chunks.push(Chunk { blocks, data });
        }

        Ok(Self {
            block_size,
            checksum,
            chunks,
        })
    }

    pub fn total_blocks(&self) -> u64 {
        self.chunks.iter().map(|c| c.blocks as u64).sum()
    }

    /// Size of the expanded image in bytes.
    pub fn raw_size(&self) -> u64 {
        self.total_blocks() * self.block_size as u64
    }

    pub fn encoded_len(&self) -> usize {
        FILE_HEADER_LEN + self.chunks.iter().map(Chunk::encoded_len).sum::<usize>()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&MAJOR.to_le_bytes());
        out.extend_from_slice(&MINOR.to_le_bytes());
        out.extend_from_slice(&(FILE_HEADER_LEN as u16).to_le_bytes());
        out.extend_from_slice(&(CHUNK_HEADER_LEN as u16).to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&(self.total_blocks() as u32).to_le_bytes());
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.type_code().to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&chunk.blocks.to_le_bytes());
            out.extend_from_slice(&(chunk.encoded_len() as u32).to_le_bytes());
            match &chunk.data {
                ChunkData::Raw(data) => out.extend_from_slice(data),
                ChunkData::Fill(pattern) => out.extend_from_slice(pattern),
                ChunkData::Crc32(crc) => out.extend_from_slice(&crc.to_le_bytes()),
                ChunkData::DontCare => {}
            }
        }
        out
    }

    /// Write every chunk at its block offset into `image`, leaving DONTCARE
    /// ranges untouched. `image` grows as needed.
    pub fn apply_to(&self, image: &mut Vec<u8>) {
        let bs = self.block_size as usize;
        let mut pos = 0usize;
        for chunk in &self.chunks {
            let len = chunk.blocks as usize * bs;
            if image.len() < pos + len {
                image.resize(pos + len, 0);
            }
            match &chunk.data {
                ChunkData::Raw(data) => image[pos..pos + len].copy_from_slice(data),
                ChunkData::Fill(pattern) => {
                    for word in image[pos..pos + len].chunks_mut(4) {
                        word.copy_from_slice(&pattern[..word.len()]);
                    }
                }
                ChunkData::DontCare | ChunkData::Crc32(_) => {}
            }
            pos += len;
        }
    }

    /// Byte ranges of the expanded image that carry data, with their
    /// content. Adjacent RAW and FILL chunks share one range.
    pub fn data_ranges(&self) -> Vec<(u64, Vec<u8>)> {
        let bs = self.block_size as u64;
        let mut ranges: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut current: Option<(u64, Vec<u8>)> = None;
        let mut pos = 0u64;
        for chunk in &self.chunks {
            let len = chunk.blocks as u64 * bs;
            match &chunk.data {
                ChunkData::Raw(data) => {
                    current.get_or_insert_with(|| (pos, Vec::new())).1.extend_from_slice(data);
                }
                ChunkData::Fill(pattern) => {
                    let range = current.get_or_insert_with(|| (pos, Vec::new()));
                    range.1.extend(pattern.iter().cycle().take(len as usize));
                }
                ChunkData::DontCare | ChunkData::Crc32(_) if len == 0 => {}
                ChunkData::DontCare | ChunkData::Crc32(_) => ranges.extend(current.take()),
            }
            pos += len;
        }
        ranges.extend(current);
        ranges
    }

    /// Expanded image, DONTCARE ranges zeroed.
    pub fn expand(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.raw_size() as usize);
        self.apply_to(&mut image);
        image
    }

    /// Split into images that each encode to at most `bufsize` bytes.
    ///
    /// Only RAW chunks are cut, on block boundaries. Every part after the
    /// first opens with a DONTCARE chunk covering the blocks before it, so
    /// each part can be flashed on its own at the start of the partition.
    pub fn split(&self, bufsize: usize) -> Result<Vec<SparseImage>, SparseError> {
        let bs = self.block_size as usize;
        // Room for a part header, its leading DONTCARE, and one RAW block
        let min = FILE_HEADER_LEN + 2 * CHUNK_HEADER_LEN + bs.max(4);
        if bufsize < min {
            return Err(SparseError::BufferTooSmall {
                bufsize,
                block_size: self.block_size,
            });
        }

        let mut parts = Vec::new();
        let mut part = SparseImage::new(self.block_size);
        let mut size = FILE_HEADER_LEN;
        let mut offset = 0u32;

        for chunk in &self.chunks {
            let mut chunk = chunk.clone();
            loop {
                let need = chunk.encoded_len();
                if size + need <= bufsize {
                    size += need;
                    offset += chunk.blocks;
                    part.chunks.push(chunk);
                    break;
                }
                if let ChunkData::Raw(data) = &chunk.data {
                    let fit = (bufsize - size).saturating_sub(CHUNK_HEADER_LEN) / bs;
                    if fit > 0 {
                        let (head, tail) = data.split_at(fit * bs);
                        part.chunks.push(Chunk {
                            blocks: fit as u32,
                            data: ChunkData::Raw(head.to_vec()),
                        });
                        offset += fit as u32;
                        chunk = Chunk {
                            blocks: chunk.blocks - fit as u32,
                            data: ChunkData::Raw(tail.to_vec()),
                        };
                    }
                }
                parts.push(std::mem::replace(&mut part, SparseImage::new(self.block_size)));
                size = FILE_HEADER_LEN;
                if offset > 0 {
                    part.chunks.push(Chunk {
                        blocks: offset,
                        data: ChunkData::DontCare,
                    });
                    size += CHUNK_HEADER_LEN;
                }
            }
        }
        parts.push(part);
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(block_size: u32) -> SparseImage {
        let bs = block_size as usize;
        let raw = |blocks: usize, seed: u8| ChunkData::Raw((0..blocks * bs).map(|i| (i as u8) ^ seed).collect());
        SparseImage {
            block_size,
            checksum: 0,
            chunks: vec![
                Chunk { blocks: 3, data: raw(3, 0x11) },
                Chunk { blocks: 5, data: ChunkData::Fill([0xde, 0xad, 0xbe, 0xef]) },
                Chunk { blocks: 2, data: ChunkData::DontCare },
                Chunk { blocks: 7, data: raw(7, 0x5a) },
                Chunk { blocks: 0, data: ChunkData::Crc32(0x1234_5678) },
                Chunk { blocks: 1, data: raw(1, 0xf0) },
            ],
        }
    }

    #[test]
    fn test_parse_encoded_image() {
        let image = sample(64);
        let bytes = image.to_bytes();
        assert!(SparseImage::is_sparse(&bytes));
        assert_eq!(bytes.len(), image.encoded_len());
        assert_eq!(SparseImage::parse(&bytes).unwrap(), image);
        assert_eq!(image.total_blocks(), 18);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let mut bytes = sample(64).to_bytes();
        assert_eq!(SparseImage::parse(&bytes[..100]), Err(SparseError::Truncated));
        bytes[28] = 0x00;
        assert!(matches!(SparseImage::parse(&bytes), Err(SparseError::BadChunkType(_))));
        bytes[0] = 0;
        assert!(matches!(SparseImage::parse(&bytes), Err(SparseError::BadMagic(_))));
    }

    #[test]
    fn test_parse_rejects_inconsistent_raw_size() {
        let mut bytes = sample(64).to_bytes();
        // total_size of the first RAW chunk
        bytes[36..40].copy_from_slice(&13u32.to_le_bytes());
        assert!(matches!(
            SparseImage::parse(&bytes),
            Err(SparseError::BadChunkSize { index: 0, .. })
        ));
    }

    #[test]
    fn test_expand_fill() {
        let image = SparseImage {
            block_size: 8,
            checksum: 0,
            chunks: vec![Chunk { blocks: 1, data: ChunkData::Fill([1, 2, 3, 4]) }],
        };
        assert_eq!(image.expand(), vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_data_ranges_skip_dontcare() {
        let image = sample(64);
        let expanded = image.expand();
        let ranges = image.data_ranges();
        let spans: Vec<(u64, usize)> = ranges.iter().map(|(off, data)| (*off, data.len())).collect();
        assert_eq!(spans, vec![(0, 512), (640, 512)]);
        for (off, data) in &ranges {
            let off = *off as usize;
            assert_eq!(&expanded[off..off + data.len()], data.as_slice());
        }
    }

    #[test]
    fn test_split_reconstructs_image() {
        let image = sample(64);
        let original = image.expand();
        for bufsize in [28 + 24 + 64, 200, 300, 517, 1000, 4096] {
            let parts = image.split(bufsize).unwrap();
            let mut rebuilt = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                assert!(part.encoded_len() <= bufsize, "part {} of bufsize {}", i, bufsize);
                if i > 0 {
                    assert!(matches!(part.chunks[0].data, ChunkData::DontCare));
                }
                part.apply_to(&mut rebuilt);
            }
            rebuilt.resize(original.len(), 0);
            assert_eq!(rebuilt, original, "bufsize {}", bufsize);
        }
    }

    #[test]
    fn test_split_never_cuts_non_raw_chunks() {
        let image = sample(64);
        let fill_blocks: Vec<u32> = image
            .split(200)
            .unwrap()
            .iter()
            .flat_map(|p| p.chunks.iter())
            .filter(|c| matches!(c.data, ChunkData::Fill(_)))
            .map(|c| c.blocks)
            .collect();
        assert_eq!(fill_blocks, vec![5]);
    }

    #[test]
    fn test_split_rejects_tiny_buffer() {
        assert!(matches!(
            sample(64).split(64),
            Err(SparseError::BufferTooSmall { .. })
        ));
    }
}
