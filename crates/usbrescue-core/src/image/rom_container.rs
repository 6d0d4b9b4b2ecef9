//! i.MX8/i.MX9 ROM container images (SDPS first stage).

use super::{u32_le_at, slice_at};

const CONTAINER_HDR_ALIGNMENT: usize = 0x400;
const CONTAINER_TAG: u8 = 0x87;
const V2X_BOOTIMG_FLAG: u32 = 0x0b;
const ROM_CONTAINER_STRUCT_SIZE: usize = 16;
const ROM_BOOTIMG_STRUCT_SIZE: usize = 96;

fn container_at(blob: &[u8], index: usize) -> Option<usize> {
    let offset = index * CONTAINER_HDR_ALIGNMENT;
    (*blob.get(offset + 3)? == CONTAINER_TAG).then_some(offset)
}

/// Number of bytes of `blob` the boot ROM reads for the first stage.
///
/// Falls back to the whole blob when the image is not a ROM container or
/// its headers do not fit in the blob.
pub fn container_size(blob: &[u8]) -> usize {
    compute(blob).filter(|&size| size <= blob.len()).unwrap_or(blob.len())
}

fn compute(blob: &[u8]) -> Option<usize> {
    let mut index = 1;
    let mut header = container_at(blob, index)?;
    let first_flags = u32_le_at(blob, header + ROM_CONTAINER_STRUCT_SIZE + 24)?;
    if first_flags & 0x0f == V2X_BOOTIMG_FLAG {
        index = 2;
        header = container_at(blob, index)?;
    }
    let num_images = *blob.get(header + 11)? as usize;
    if num_images == 0 {
        return None;
    }
    let last = header + ROM_CONTAINER_STRUCT_SIZE + (num_images - 1) * ROM_BOOTIMG_STRUCT_SIZE;
    slice_at(blob, last, ROM_BOOTIMG_STRUCT_SIZE)?;
    let img_offset = u32_le_at(blob, last)? as usize;
    let img_size = u32_le_at(blob, last + 4)? as usize;
    let size = img_offset
        .checked_add(img_size)?
        .checked_add(index * CONTAINER_HDR_ALIGNMENT)?;
    Some(size.div_ceil(CONTAINER_HDR_ALIGNMENT) * CONTAINER_HDR_ALIGNMENT)
}
