//! Xilinx ZynqMP: the ROM takes the FSBL over DFU, the FSBL then takes the
//! rest of the boot image on a second alternate setting.

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tracing::{info, warn};

use super::FirmwareContext;
use crate::image::{slice_at, u32_le_at};
use crate::protocol::dfu::Dfu;
use crate::transport::UsbTransport;

const WIDTH_DETECTION: u32 = 0xaa99_5566;
const IMAGE_ID: &[u8; 4] = b"XNLX";

/// Alternate setting served by the ROM.
pub(crate) const ROM_PARTID: u8 = 0;
/// Alternate setting served by the FSBL.
pub(crate) const FSBL_PARTID: u8 = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BootImageError {
    #[error("Boot image header not found (width detection word 0x{0:08x})")]
    BadWidthDetection(u32),

    #[error("Boot image identification is not XNLX")]
    BadImageId,

    #[error("Boot image header checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    BadChecksum { stored: u32, computed: u32 },

    #[error("FSBL 0x{offset:x}+0x{len:x} lies outside the {size} byte boot image")]
    Truncated { offset: usize, len: usize, size: usize },
}

/// Fixed part of a ZynqMP boot image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootImageHeader {
    pub fsbl_exec_addr: u32,
    /// Offset of the PMU firmware, which the FSBL directly follows.
    pub source_offset: u32,
    pub pmufw_total_len: u32,
    pub fsbl_total_len: u32,
    pub attributes: u32,
}

impl BootImageHeader {
    pub fn parse(blob: &[u8]) -> Result<Self, BootImageError> {
        let word = |off| u32_le_at(blob, off).ok_or(BootImageError::BadWidthDetection(0));
        let width = word(0x20)?;
        if width != WIDTH_DETECTION {
            return Err(BootImageError::BadWidthDetection(width));
        }
        if slice_at(blob, 0x24, 4) != Some(&IMAGE_ID[..]) {
            return Err(BootImageError::BadImageId);
        }

        // Bitwise NOT of the sum of the header words before the checksum
        let mut sum = 0u32;
        for off in (0x20..0x48).step_by(4) {
            sum = sum.wrapping_add(word(off)?);
        }
        let stored = word(0x48)?;
        if stored != !sum {
            return Err(BootImageError::BadChecksum { stored, computed: !sum });
        }

        Ok(Self {
            fsbl_exec_addr: word(0x2c)?,
            source_offset: word(0x30)?,
            pmufw_total_len: word(0x38)?,
            fsbl_total_len: word(0x40)?,
            attributes: word(0x44)?,
        })
    }

    /// Length of the image prefix holding the header, PMU firmware and FSBL.
    pub fn fsbl_end(&self) -> usize {
        self.source_offset as usize + self.pmufw_total_len as usize + self.fsbl_total_len as usize
    }

    /// The part of `blob` the ROM needs to start the FSBL.
    pub fn fsbl_image<'b>(&self, blob: &'b [u8]) -> Result<&'b [u8], BootImageError> {
        blob.get(..self.fsbl_end()).ok_or(BootImageError::Truncated {
            offset: self.source_offset as usize,
            len: self.pmufw_total_len as usize + self.fsbl_total_len as usize,
            size: blob.len(),
        })
    }
}

fn download(ctx: &FirmwareContext<'_>, device: &dyn UsbTransport, blob: &[u8], partid: u8, detach: bool) -> Result<()> {
    let mut dfu = Dfu::new(device, ctx.sink, false)?;
    info!(partid, len = blob.len(), "Downloading file...");
    dfu.download_and_run(blob, partid, 0, blob.len())?;
    if detach {
        info!("Sending detach command...");
        dfu.detach(partid)?;
    }
    Ok(())
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    subfw: &str,
    blob: &[u8],
) -> Result<()> {
    match (name, subfw) {
        ("fsbl", _) => download(ctx, device, blob, ROM_PARTID, false),
        ("boot", "fsbl") => {
            warn!("Extracting FSBL from full boot image");
            let header = BootImageHeader::parse(blob).context("reading boot image header")?;
            info!(
                exec_addr = %format!("0x{:08x}", header.fsbl_exec_addr),
                len = header.fsbl_end(),
                "FSBL found in boot image"
            );
            let fsbl = header.fsbl_image(blob)?;
            download(ctx, device, fsbl, ROM_PARTID, false)
        }
        ("boot", "") => download(ctx, device, blob, FSBL_PARTID, true),
        _ => bail!("unsupported firmware {}", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::firmware::tests::{firmware_set, no_sleep, recovery_config};
    use crate::session::SessionConfig;
    use crate::transport::{MockTransport, dfu_layout};

    fn boot_image(fsbl_len: u32, tail: usize) -> Vec<u8> {
        let mut blob = vec![0u8; 0x800];
        let mut put = |off: usize, v: u32| blob[off..off + 4].copy_from_slice(&v.to_le_bytes());
        put(0x20, WIDTH_DETECTION);
        put(0x24, u32::from_le_bytes(*IMAGE_ID));
        put(0x2c, 0xfffc_0000);
        put(0x30, 0x800);
        put(0x38, 0x100);
        put(0x40, fsbl_len);
        let sum = (0x20..0x48)
            .step_by(4)
            .map(|off| u32::from_le_bytes(blob[off..off + 4].try_into().unwrap()))
            .fold(0u32, u32::wrapping_add);
        blob[0x48..0x4c].copy_from_slice(&(!sum).to_le_bytes());
        blob.resize(0x800 + 0x100 + fsbl_len as usize + tail, 0x5a);
        blob
    }

    fn ctx_run(device: &MockTransport, name: &str, subfw: &str, blob: &[u8]) -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = recovery_config("zynqmp", firmware_set(dir.path(), &[]));
        let session = SessionConfig::default();
        let ctx = FirmwareContext {
            config: &config,
            session: &session,
            sink: &NullSink,
            sleep: &no_sleep,
        };
        run(&ctx, device, name, subfw, blob)
    }

    #[test]
    fn test_header_parse() {
        let blob = boot_image(0x400, 0x1000);
        let header = BootImageHeader::parse(&blob).unwrap();
        assert_eq!(header.fsbl_exec_addr, 0xfffc_0000);
        assert_eq!(header.fsbl_end(), 0xd00);
        assert_eq!(header.fsbl_image(&blob).unwrap().len(), 0xd00);

        let mut bad = blob.clone();
        bad[0x2c] ^= 1;
        assert!(matches!(BootImageHeader::parse(&bad), Err(BootImageError::BadChecksum { .. })));
        assert_eq!(
            BootImageHeader::parse(&blob[..0x10]),
            Err(BootImageError::BadWidthDetection(0))
        );
        let header = BootImageHeader::parse(&boot_image(0x400, 0)).unwrap();
        assert!(header.fsbl_image(&blob[..0xc00]).is_err());
    }

    #[test]
    fn test_fsbl_extracted_to_rom_partition() {
        let device = MockTransport::new().with_layout(dfu_layout(&["ROM"]));
        let chunks = 0xd00usize.div_ceil(1024);
        device.queue_reply(&[0, 0, 0, 0, 2, 0]);
        for _ in 0..chunks {
            device.queue_reply(&[0, 0, 0, 0, 5, 0]);
        }
        device.queue_reply(&[0, 0, 0, 0, 2, 0]);
        let blob = boot_image(0x400, 0x1000);
        ctx_run(&device, "boot", "fsbl", &blob).unwrap();
        assert_eq!(device.writes().len(), 0);
        let sent: usize = device
            .control_outs()
            .iter()
            .filter(|(request, ..)| *request == 1)
            .map(|(_, _, _, data)| data.len())
            .sum();
        assert_eq!(sent, 0xd00);
        let dnloads = device.control_outs().iter().filter(|(request, ..)| *request == 1).count();
        assert_eq!(dnloads, chunks + 1);
        assert_eq!(device.pending_replies(), 0);
    }

    #[test]
    fn test_boot_image_detaches_fsbl_partition() {
        let device = MockTransport::new().with_layout(dfu_layout(&["ROM", "FSBL"]));
        for state in [2u8, 5, 2, 2] {
            device.queue_reply(&[0, 0, 0, 0, state, 0]);
        }
        ctx_run(&device, "boot", "", &[0x11; 32]).unwrap();
        assert_eq!(device.control_outs().last().unwrap().0, 0);
        assert_eq!(device.pending_replies(), 0);
        assert!(ctx_run(&device, "pmufw", "", &[0; 4]).is_err());
    }
}
