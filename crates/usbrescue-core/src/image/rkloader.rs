//! Rockchip loader containers (`boot_merger` output).
//!
//! A 102-byte header points to three tables of 57-byte entries (471, 472
//! and loader). Each entry names a blob stored elsewhere in the file. The
//! whole file is sealed with a CRC32/ROCKCHIP trailer.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::crc::crc32_rockchip;
use super::slice_at;

pub const HEADER_LEN: usize = 102;
pub const ENTRY_LEN: usize = 57;
const NAME_LEN: usize = 40;

const RC4_KEY: [u8; 16] = [124, 78, 3, 4, 85, 5, 9, 7, 45, 44, 123, 56, 23, 13, 23, 17];
const RC4_BLOCK: usize = 512;
const RC4_ALIGN: usize = 4096;

/// SoCs whose ROM takes code 471/472 blobs in clear.
pub const NEWIDB_SOCS: &[&str] = &[
    "rk3506", "rk3506b", "rk3528", "rk3562", "rk3566", "rk3568", "rk3576", "rk3583", "rk3588",
    "rv1103b", "rv1106",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RkLoaderError {
    #[error("Invalid loader tag {0:?}")]
    BadTag([u8; 4]),

    #[error("Loader file is truncated")]
    Truncated,

    #[error("CRC mismatch: trailer 0x{stored:08x}, computed 0x{computed:08x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("Invalid index {index}, table {table} only has {count} entries")]
    BadIndex { table: EntryTable, index: usize, count: usize },

    #[error("Entry '{name}' data 0x{offset:x}+0x{size:x} lies outside the file")]
    EntryOutOfRange { name: String, offset: u32, size: u32 },
}

fn truncated(_: std::io::Error) -> RkLoaderError {
    RkLoaderError::Truncated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTable {
    Code471,
    Code472,
    Loader,
}

impl EntryTable {
    /// ROM code the entries of this table are sent with.
    pub fn code(self) -> u16 {
        match self {
            Self::Code471 | Self::Loader => 0x471,
            Self::Code472 => 0x472,
        }
    }
}

impl fmt::Display for EntryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code471 => write!(f, "471"),
            Self::Code472 => write!(f, "472"),
            Self::Loader => write!(f, "loader"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReleaseTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl fmt::Display for ReleaseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Location of one entry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct TableRef {
    count: u8,
    offset: u32,
    size: u8,
}

impl TableRef {
    fn read(cur: &mut Cursor<&[u8]>) -> Result<Self, RkLoaderError> {
        Ok(Self {
            count: cur.read_u8().map_err(truncated)?,
            offset: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            size: cur.read_u8().map_err(truncated)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RkEntry {
    pub kind: u32,
    pub name: String,
    pub data_offset: u32,
    pub data_size: u32,
    /// Delay in milliseconds to wait after sending this entry.
    pub delay_ms: u32,
}

impl RkEntry {
    fn parse(blob: &[u8], offset: usize) -> Result<Self, RkLoaderError> {
        let raw = slice_at(blob, offset, ENTRY_LEN).ok_or(RkLoaderError::Truncated)?;
        let mut cur = Cursor::new(raw);
        let _size = cur.read_u8().map_err(truncated)?;
        let kind = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut name = [0u8; NAME_LEN];
        cur.read_exact(&mut name).map_err(truncated)?;
        let units: Vec<u16> = name
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        Ok(Self {
            kind,
            name: String::from_utf16_lossy(&units),
            data_offset: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            data_size: cur.read_u32::<LittleEndian>().map_err(truncated)?,
            delay_ms: cur.read_u32::<LittleEndian>().map_err(truncated)?,
        })
    }
}

/// A parsed loader file. Entries borrow their data from the original blob.
#[derive(Debug)]
pub struct RkLoader<'a> {
    blob: &'a [u8],
    pub tag: [u8; 4],
    pub version: u32,
    pub merge_version: u32,
    pub release: ReleaseTime,
    /// Chip identifier, byte order restored.
    pub chip: [u8; 4],
    pub signed: bool,
    /// Whether the entries were RC4 scrambled by `boot_merger`.
    pub rc4: bool,
    pub code471: Vec<RkEntry>,
    pub code472: Vec<RkEntry>,
    pub loader: Vec<RkEntry>,
    pub crc: u32,
}

impl<'a> RkLoader<'a> {
    pub fn parse(blob: &'a [u8]) -> Result<Self, RkLoaderError> {
        if blob.len() < HEADER_LEN + 4 {
            return Err(RkLoaderError::Truncated);
        }
        let (body, trailer) = blob.split_at(blob.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32_rockchip(body);
        if stored != computed {
            return Err(RkLoaderError::CrcMismatch { stored, computed });
        }

        let mut cur = Cursor::new(blob);
        let mut tag = [0u8; 4];
        cur.read_exact(&mut tag).map_err(truncated)?;
        if &tag != b"BOOT" && &tag != b"LDR " {
            return Err(RkLoaderError::BadTag(tag));
        }
        let _size = cur.read_u16::<LittleEndian>().map_err(truncated)?;
        let version = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let merge_version = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let release = ReleaseTime {
            year: cur.read_u16::<LittleEndian>().map_err(truncated)?,
            month: cur.read_u8().map_err(truncated)?,
            day: cur.read_u8().map_err(truncated)?,
            hour: cur.read_u8().map_err(truncated)?,
            minute: cur.read_u8().map_err(truncated)?,
            second: cur.read_u8().map_err(truncated)?,
        };
        let mut chip = [0u8; 4];
        cur.read_exact(&mut chip).map_err(truncated)?;
        chip.reverse();
        let t471 = TableRef::read(&mut cur)?;
        let t472 = TableRef::read(&mut cur)?;
        let tloader = TableRef::read(&mut cur)?;
        let sign = cur.read_u8().map_err(truncated)?;
        let rc4_disabled = cur.read_u8().map_err(truncated)?;

        let table = |t: TableRef| -> Result<Vec<RkEntry>, RkLoaderError> {
            (0..t.count as usize)
                .map(|i| RkEntry::parse(blob, t.offset as usize + i * ENTRY_LEN))
                .collect()
        };

        Ok(Self {
            blob,
            tag,
            version,
            merge_version,
            release,
            chip,
            signed: sign == b'S',
            rc4: rc4_disabled == 0,
            code471: table(t471)?,
            code472: table(t472)?,
            loader: table(tloader)?,
            crc: stored,
        })
    }

    pub fn entries(&self, table: EntryTable) -> &[RkEntry] {
        match table {
            EntryTable::Code471 => &self.code471,
            EntryTable::Code472 => &self.code472,
            EntryTable::Loader => &self.loader,
        }
    }

    /// Data of entry `index` in `table`, with its post-send delay.
    pub fn entry_data(&self, table: EntryTable, index: usize) -> Result<(&'a [u8], u32), RkLoaderError> {
        let entries = self.entries(table);
        let entry = entries.get(index).ok_or(RkLoaderError::BadIndex {
            table,
            index,
            count: entries.len(),
        })?;
        let data = slice_at(self.blob, entry.data_offset as usize, entry.data_size as usize).ok_or_else(|| {
            RkLoaderError::EntryOutOfRange {
                name: entry.name.clone(),
                offset: entry.data_offset,
                size: entry.data_size,
            }
        })?;
        Ok((data, entry.delay_ms))
    }

    pub fn chip_name(&self) -> String {
        String::from_utf8_lossy(&self.chip).into_owned()
    }
}

impl fmt::Display for RkLoader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}.{} {} chip {} ({} x 471, {} x 472, {} x loader) crc 0x{:08x}",
            String::from_utf8_lossy(&self.tag).trim(),
            self.version >> 8,
            self.version & 0xff,
            self.release,
            self.chip_name(),
            self.code471.len(),
            self.code472.len(),
            self.loader.len(),
            self.crc
        )
    }
}

struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for b in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[self.s[self.i as usize].wrapping_add(self.s[self.j as usize]) as usize];
            *b ^= k;
        }
    }
}

/// Scramble a raw code 471/472 blob the way the ROM expects it: padded to
/// 4096 bytes, then RC4 with the key restarted on every 512-byte block.
/// New-IDB SoCs take the blob untouched.
pub fn rc4_scramble(blob: &[u8], soc: &str) -> Vec<u8> {
    if NEWIDB_SOCS.contains(&soc) {
        return blob.to_vec();
    }
    let mut out = blob.to_vec();
    out.resize(blob.len().div_ceil(RC4_ALIGN) * RC4_ALIGN, 0);
    for block in out.chunks_mut(RC4_BLOCK) {
        Rc4::new(&RC4_KEY).apply(block);
    }
    out
}
