//! Dummy STM32MP flash layout, wrapped in an STM32 v1 image header.
//!
//! The ROM of some STM32MP parts waits for a flash layout before accepting
//! the next boot stage. Recovery only needs one that names the two boot
//! partitions.

pub const HEADER_LEN: usize = 256;
const MAGIC: &[u8; 4] = b"STM2";
const HEADER_VERSION: u32 = 0x0001_0000;
/// Bit 0: no signature.
const OPTION_NO_SIGNATURE: u32 = 0x01;
const BINARY_TYPE_UBOOT: u8 = 0x00;

const FSBL_PARTID: u8 = 0x01;
const SSBL_PARTID: u8 = 0x03;

/// Layout TSV naming the fsbl and ssbl boot partitions.
pub fn layout_text() -> String {
    format!(
        "-\t0x{:02x}\tfsbl1-boot\tBinary\tnone\t0x0\n-\t0x{:02x}\tssbl-boot\tBinary\tnone\t0x0\n",
        FSBL_PARTID, SSBL_PARTID
    )
}

/// Wrap `payload` in an unsigned STM32 v1 header.
pub fn stm32_image(payload: &[u8]) -> Vec<u8> {
    let checksum = payload.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    let mut image = Vec::with_capacity(HEADER_LEN + payload.len());
    image.extend_from_slice(MAGIC);
    image.extend_from_slice(&[0u8; 64]);
    for word in [
        checksum,
        HEADER_VERSION,
        payload.len() as u32,
        0, // entry point
        0,
        0, // load address
        0,
        0, // version number
        OPTION_NO_SIGNATURE,
        0, // ecdsa algorithm
    ] {
        image.extend_from_slice(&word.to_le_bytes());
    }
    image.extend_from_slice(&[0u8; 64]);
    image.extend_from_slice(&[0u8; 83]);
    image.push(BINARY_TYPE_UBOOT);
    image.extend_from_slice(payload);
    image
}

pub fn build_image() -> Vec<u8> {
    stm32_image(layout_text().as_bytes())
}
