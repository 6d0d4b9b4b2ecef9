//! i.MX Image Vector Table.

use thiserror::Error;
use tracing::debug;

use super::{slice_at, u32_le_at};

const IVT_HEADER_1: [u8; 4] = [0xd1, 0x00, 0x20, 0x40];
const IVT_HEADER_2: [u8; 4] = [0xd1, 0x00, 0x20, 0x41];
const IVT_SIZE: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IvtError {
    #[error("No IVT header in boot image")]
    NotFound,

    #[error("IVT at 0x{offset:x} is truncated")]
    Truncated { offset: usize },

    #[error("Boot data pointer 0x{pointer:08x} lies outside the image")]
    BootDataOutOfRange { pointer: u32 },

    #[error("Boot data declares an empty image")]
    EmptyBootData,

    #[error("DCD pointer 0x{pointer:08x} lies outside the image")]
    DcdOutOfRange { pointer: u32 },

    #[error("Boot data start 0x{start:08x} is above the IVT address 0x{addr:08x}")]
    InvalidLoadRange { start: u32, addr: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootData {
    pub start: u32,
    pub length: u32,
    pub plugin_flag: u32,
}

/// Parsed IVT, with its byte offset in the image it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ivt {
    pub offset: usize,
    pub header: u32,
    pub entry: u32,
    pub dcd: u32,
    pub boot_data_ptr: u32,
    /// Load address of the IVT itself.
    pub addr: u32,
    pub csf: u32,
    pub boot_data: BootData,
}

/// Image offset of a pointer into the loaded image, if it lands inside `blob`.
fn image_offset(blob: &[u8], ivt_offset: usize, ivt_addr: u32, pointer: u32) -> Option<usize> {
    let rel = (pointer as i64) - (ivt_addr as i64);
    let offset = (ivt_offset as i64).checked_add(rel)?;
    usize::try_from(offset).ok().filter(|&o| o < blob.len())
}

impl Ivt {
    /// Scan `blob` in 4-byte steps for the first usable IVT.
    ///
    /// IVTs of the second header version that flag a plugin image (the
    /// i.MX8MQ HDMI firmware) are skipped.
    pub fn find(blob: &[u8]) -> Result<Self, IvtError> {
        let mut offset = 0;
        while offset + 4 <= blob.len() {
            let word = &blob[offset..offset + 4];
            if word != IVT_HEADER_1 && word != IVT_HEADER_2 {
                offset += 4;
                continue;
            }
            let ivt = Self::parse_at(blob, offset)?;
            if word == IVT_HEADER_2 && ivt.boot_data.plugin_flag & 0xffff_fffe != 0 {
                debug!(offset, "Skipping plugin IVT");
                offset += 4;
                continue;
            }
            debug!(
                offset,
                entry = %format!("0x{:08x}", ivt.entry),
                addr = %format!("0x{:08x}", ivt.addr),
                dcd = %format!("0x{:08x}", ivt.dcd),
                boot_start = %format!("0x{:08x}", ivt.boot_data.start),
                boot_len = %format!("0x{:x}", ivt.boot_data.length),
                "IVT found"
            );
            return Ok(ivt);
        }
        Err(IvtError::NotFound)
    }

    fn parse_at(blob: &[u8], offset: usize) -> Result<Self, IvtError> {
        let raw = slice_at(blob, offset, IVT_SIZE).ok_or(IvtError::Truncated { offset })?;
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let (header, entry, dcd, boot_data_ptr, addr, csf) =
            (word(0), word(4), word(12), word(16), word(20), word(24));

        let bd_offset = image_offset(blob, offset, addr, boot_data_ptr).ok_or(
            IvtError::BootDataOutOfRange {
                pointer: boot_data_ptr,
            },
        )?;
        let bd = |i: usize| {
            u32_le_at(blob, bd_offset + i).ok_or(IvtError::BootDataOutOfRange {
                pointer: boot_data_ptr,
            })
        };
        let boot_data = BootData {
            start: bd(0)?,
            length: bd(4)?,
            plugin_flag: bd(8)?,
        };
        if boot_data.length == 0 {
            return Err(IvtError::EmptyBootData);
        }
        if dcd != 0 && image_offset(blob, offset, addr, dcd).is_none() {
            return Err(IvtError::DcdOutOfRange { pointer: dcd });
        }

        Ok(Self {
            offset,
            header,
            entry,
            dcd,
            boot_data_ptr,
            addr,
            csf,
            boot_data,
        })
    }

    /// Offset of the DCD table in the image, when the IVT has one.
    pub fn dcd_offset(&self, blob: &[u8]) -> Option<usize> {
        if self.dcd == 0 {
            return None;
        }
        image_offset(blob, self.offset, self.addr, self.dcd)
    }

    /// Bytes from the IVT to the end of the boot data region.
    pub fn load_size(&self) -> Result<u32, IvtError> {
        let invalid = IvtError::InvalidLoadRange {
            start: self.boot_data.start,
            addr: self.addr,
        };
        let lead = self.addr.checked_sub(self.boot_data.start).ok_or(invalid.clone())?;
        self.boot_data.length.checked_sub(lead).ok_or(invalid)
    }

    /// Image offset right after the region the boot ROM loads, where a
    /// combined boot image keeps U-Boot proper.
    pub fn payload_end(&self) -> Result<usize, IvtError> {
        Ok(self.offset + self.load_size()? as usize)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// IVT at `ivt_off`, loaded at 0x877ff400 with boot data right behind it.
    pub(crate) fn image(ivt_off: usize, len: usize, boot_len: u32, dcd: u32) -> Vec<u8> {
        let mut blob = vec![0u8; len];
        let addr = 0x877f_f400u32;
        let words = [
            u32::from_le_bytes(IVT_HEADER_1),
            0x8780_0000,
            0,
            dcd,
            addr + 0x20,
            addr,
            0,
            0,
        ];
        for (i, w) in words.iter().enumerate() {
            blob[ivt_off + i * 4..ivt_off + i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        let bd = ivt_off + 0x20;
        blob[bd..bd + 4].copy_from_slice(&(addr - 0x400).to_le_bytes());
        blob[bd + 4..bd + 8].copy_from_slice(&boot_len.to_le_bytes());
        blob
    }

    #[test]
    fn test_find_ivt() {
        let blob = image(0x400, 0x2000, 0x1800, 0x877f_f42c);
        let ivt = Ivt::find(&blob).unwrap();
        assert_eq!(ivt.offset, 0x400);
        assert_eq!(ivt.entry, 0x8780_0000);
        assert_eq!(ivt.dcd_offset(&blob), Some(0x42c));
        assert_eq!(ivt.load_size().unwrap(), 0x1400);
        assert_eq!(ivt.payload_end().unwrap(), 0x1800);
    }

    #[test]
    fn test_no_header() {
        assert_eq!(Ivt::find(&[0u8; 256]), Err(IvtError::NotFound));
    }

    #[test]
    fn test_zero_boot_length_rejected() {
        let blob = image(0, 0x400, 0, 0);
        assert_eq!(Ivt::find(&blob), Err(IvtError::EmptyBootData));
    }

    #[test]
    fn test_dcd_outside_image_rejected() {
        let blob = image(0, 0x400, 0x400, 0x9000_0000);
        assert_eq!(
            Ivt::find(&blob),
            Err(IvtError::DcdOutOfRange {
                pointer: 0x9000_0000
            })
        );
    }

    #[test]
    fn test_boot_data_pointer_outside_image_rejected() {
        let mut blob = image(0, 0x400, 0x400, 0);
        blob[16..20].copy_from_slice(&0x1000_0000u32.to_le_bytes());
        assert!(matches!(
            Ivt::find(&blob),
            Err(IvtError::BootDataOutOfRange { .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        let mut blob = vec![0u8; 16];
        blob[8..12].copy_from_slice(&IVT_HEADER_1);
        assert_eq!(Ivt::find(&blob), Err(IvtError::Truncated { offset: 8 }));
    }
}
