//! Firmware image formats.
//!
//! Pure parsers and encoders over in-memory buffers. Every offset or length
//! read from an image goes through the checked helpers below before it is
//! used to slice the image.

pub mod bootfiles;
pub mod crc;
pub mod dcd;
pub mod egon;
pub mod fdt;
pub mod flashlayout;
pub mod ivt;
pub mod mbr;
pub mod rkloader;
pub mod rom_container;
pub mod sparse;
pub mod uboot;

pub use dcd::{Dcd, DcdCommand, DcdError};
pub use ivt::{Ivt, IvtError};
pub use rkloader::{RkLoader, RkLoaderError};
pub use sparse::{SparseError, SparseImage};
pub use uboot::{UbootImage, UbootImageError};

/// `blob[offset..offset + len]`, or `None` when any part lies outside.
pub fn slice_at(blob: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    blob.get(offset..offset.checked_add(len)?)
}

pub fn u16_le_at(blob: &[u8], offset: usize) -> Option<u16> {
    slice_at(blob, offset, 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

pub fn u16_be_at(blob: &[u8], offset: usize) -> Option<u16> {
    slice_at(blob, offset, 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub fn u32_le_at(blob: &[u8], offset: usize) -> Option<u32> {
    slice_at(blob, offset, 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn u32_be_at(blob: &[u8], offset: usize) -> Option<u32> {
    slice_at(blob, offset, 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_reads() {
        let blob = [1u8, 2, 3, 4, 5];
        assert_eq!(u32_le_at(&blob, 0), Some(0x04030201));
        assert_eq!(u32_be_at(&blob, 1), Some(0x02030405));
        assert_eq!(u32_le_at(&blob, 2), None);
        assert_eq!(slice_at(&blob, usize::MAX, 2), None);
        assert_eq!(u16_be_at(&blob, 3), Some(0x0405));
    }
}
