//! Allwinner eGON boot headers, as found at the start of sunxi SPL images.

use thiserror::Error;

use super::{slice_at, u32_le_at};

const MAGIC: &[u8; 8] = b"eGON.BT0";
const CHECKSUM_STAMP: u32 = 0x5f0a_6c39;
const MAX_DT_NAME_LEN: usize = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EgonError {
    #[error("eGON header not found at beginning of SPL image")]
    BadMagic,

    #[error("SPL length {length} is invalid for an image of {len} bytes")]
    BadLength { length: u32, len: usize },

    #[error("Invalid checksum in SPL image")]
    BadChecksum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgonHeader {
    pub checksum: u32,
    /// Length of the SPL, header included.
    pub length: u32,
    /// Device tree name recorded by SPL header version 2 and later.
    pub dt_name: Option<String>,
}

impl EgonHeader {
    /// Parse the header and verify the checksum over the whole SPL.
    pub fn parse(blob: &[u8]) -> Result<Self, EgonError> {
        if slice_at(blob, 4, 8) != Some(&MAGIC[..]) {
            return Err(EgonError::BadMagic);
        }
        let checksum = u32_le_at(blob, 12).ok_or(EgonError::BadMagic)?;
        let length = u32_le_at(blob, 16).ok_or(EgonError::BadMagic)?;
        let spl = slice_at(blob, 0, length as usize)
            .filter(|s| s.len() % 4 == 0 && s.len() >= 32)
            .ok_or(EgonError::BadLength {
                length,
                len: blob.len(),
            })?;

        let sum = spl
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .fold(checksum.wrapping_mul(2).wrapping_sub(CHECKSUM_STAMP), u32::wrapping_sub);
        if sum != 0 {
            return Err(EgonError::BadChecksum);
        }

        Ok(Self {
            checksum,
            length,
            dt_name: Self::dt_name(blob),
        })
    }

    fn dt_name(blob: &[u8]) -> Option<String> {
        if slice_at(blob, 0x14, 3) != Some(b"SPL") || *blob.get(0x17)? < 2 {
            return None;
        }
        let offset = u32_le_at(blob, 0x20)? as usize;
        if offset == 0 {
            return None;
        }
        let tail = blob.get(offset..)?;
        let end = tail.iter().take(MAX_DT_NAME_LEN).position(|&b| b == 0)?;
        if end == 0 {
            return None;
        }
        std::str::from_utf8(&tail[..end]).ok().map(str::to_string)
    }

    /// Stamp a correct checksum into the header of `spl`.
    pub fn seal(spl: &mut [u8]) {
        if spl.len() < 16 {
            return;
        }
        spl[12..16].copy_from_slice(&CHECKSUM_STAMP.to_le_bytes());
        let sum = spl
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .fold(0u32, u32::wrapping_add);
        spl[12..16].copy_from_slice(&sum.to_le_bytes());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// SPL image of `len` bytes, with an optional dt name.
    pub(crate) fn spl(len: usize, dt_name: Option<&str>) -> Vec<u8> {
        let mut spl = vec![0u8; len];
        spl[0..4].copy_from_slice(&[0x0e, 0x00, 0x00, 0xea]);
        spl[4..12].copy_from_slice(MAGIC);
        spl[16..20].copy_from_slice(&(len as u32).to_le_bytes());
        if let Some(name) = dt_name {
            spl[0x14..0x17].copy_from_slice(b"SPL");
            spl[0x17] = 2;
            spl[0x20..0x24].copy_from_slice(&0x40u32.to_le_bytes());
            spl[0x40..0x40 + name.len()].copy_from_slice(name.as_bytes());
        }
        for (i, b) in spl.iter_mut().enumerate().skip(0x80) {
            *b = i as u8;
        }
        EgonHeader::seal(&mut spl);
        spl
    }

    #[test]
    fn test_parse_header() {
        let image = spl(0x200, Some("sun50i-a64-pine64"));
        let hdr = EgonHeader::parse(&image).unwrap();
        assert_eq!(hdr.length, 0x200);
        assert_eq!(hdr.dt_name.as_deref(), Some("sun50i-a64-pine64"));
        assert_eq!(EgonHeader::parse(&spl(0x100, None)).unwrap().dt_name, None);
    }

    #[test]
    fn test_rejects_bad_images() {
        let mut image = spl(0x200, None);
        image[0x150] ^= 1;
        assert_eq!(EgonHeader::parse(&image), Err(EgonError::BadChecksum));
        assert!(matches!(
            EgonHeader::parse(&image[..0x100]),
            Err(EgonError::BadLength { .. })
        ));
        image[4] = b'x';
        assert_eq!(EgonHeader::parse(&image), Err(EgonError::BadMagic));
    }
}
