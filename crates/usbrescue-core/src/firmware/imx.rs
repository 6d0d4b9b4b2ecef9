//! NXP i.MX: SDP for IVT based images, SDPS for ROM containers.
//!
//! A single `flash-bin` may carry both the SPL and U-Boot proper. The SPL
//! part is what the IVT describes, U-Boot proper sits right behind it.

use anyhow::{Result, anyhow, bail};
use tracing::{info, warn};

use super::FirmwareContext;
use crate::image::dcd::Dcd;
use crate::image::ivt::Ivt;
use crate::image::rom_container;
use crate::protocol::Sdp;
use crate::protocol::memory::MemoryOps;
use crate::soc::SocModel;
use crate::transport::UsbTransport;
use crate::usb::UsbCandidate;

/// Largest single WRITE_FILE the ROM accepts.
const MAX_DOWNLOAD_SIZE: usize = 0x20_0000;
/// Bytes rewritten when clearing the DCD pointer. Some ROMs store a full
/// report 2 transfer, so the IVT alone is not enough.
const IVT_REWRITE_LEN: usize = 1024;

/// Models whose boot ROM speaks SDPS instead of SDP.
pub(crate) fn uses_sdps(soc: SocModel) -> bool {
    soc.is(&["imx8qxp", "imx8qm", "imx8dxl", "imx28", "imx815", "imx865", "imx93"])
}

/// Models whose SPL comes back as an SDPV device for a second stage.
pub(crate) fn has_sdps_second_stage(soc: SocModel) -> bool {
    soc.is(&["imx8qm", "imx8qxp"])
}

fn dcd_address(soc: SocModel) -> Option<u32> {
    match soc.name() {
        "imx6q" | "imx6sx" | "imx6d" | "imx6sl" | "imx6ul" | "imx6ull" | "imx6sll" | "imx8mq"
        | "imx8mm" => Some(0x0091_0000),
        "imx7d" => Some(0x0091_1000),
        "imx7ulp" => Some(0x2f01_8000),
        "imxrt106x" => Some(0x1000),
        _ => None,
    }
}

/// USB IDs an SDP-capable SPL may enumerate with, in lookup order.
///
/// `SPL1/*` entries are SDPV devices, which locate U-Boot proper in a
/// combined image on their own.
pub fn spl_candidates() -> Vec<UsbCandidate> {
    vec![
        UsbCandidate {
            name: "SPL/1",
            vid: 0x0525,
            pid: 0xb4a4,
            release: 0x0000..=0x04ff,
        },
        UsbCandidate {
            name: "SPL/2",
            vid: 0x0525,
            pid: 0xb4a4,
            release: 0x9999..=0x9999,
        },
        UsbCandidate {
            name: "SPL/3",
            vid: 0x3016,
            pid: 0x1001,
            release: 0x0000..=0x04ff,
        },
        UsbCandidate {
            name: "SPL1/1",
            vid: 0x0525,
            pid: 0xb4a4,
            release: 0x0500..=0x9998,
        },
        UsbCandidate {
            name: "SPL1/2",
            vid: 0x1fc9,
            pid: 0x0151,
            release: 0x0500..=0x9998,
        },
        UsbCandidate {
            name: "SPL1/3",
            vid: 0x3016,
            pid: 0x0100,
            release: 0x0500..=0x9998,
        },
    ]
}

pub(crate) fn is_sdpv(candidate: &UsbCandidate) -> bool {
    candidate.name.starts_with("SPL1/")
}

fn is_sdps_stage(name: &str, subfw: &str) -> bool {
    name == "u-boot-sdps" || (name == "flash-bin" && subfw == "spl-sdps")
}

fn sdps_write(ctx: &FirmwareContext<'_>, sdp: &Sdp<'_>, blob: &[u8]) -> Result<()> {
    let soc = ctx.config.soc;
    let size = rom_container::container_size(blob);
    let with_cbw = !soc.is(&["imx8qxp", "imx815"]);
    let chunk_size = if soc.is(&["imx815"]) { 1020 } else { 1024 };
    info!(size, with_cbw, chunk_size, "Writing first stage over SDPS");
    sdp.sdps_write(blob, size, with_cbw, chunk_size)?;
    Ok(())
}

fn write_dcd(ctx: &FirmwareContext<'_>, sdp: &Sdp<'_>, ivt: &Ivt, blob: &[u8]) -> Result<()> {
    let offset = ivt
        .dcd_offset(blob)
        .ok_or_else(|| anyhow!("No DCD data in boot image"))?;
    let dcd = Dcd::parse(blob, offset)?;
    let Some(addr) = dcd_address(ctx.config.soc) else {
        bail!(
            "DCD is not supported on {}, please choose a boot image without DCD",
            ctx.soc_name()
        );
    };

    info!(len = dcd.raw.len(), "Writing DCD...");
    if sdp.is_hid() {
        sdp.write_dcd(&dcd.raw, addr, 0, dcd.raw.len())?;
    } else {
        sdp.run_dcd(&dcd)?;
    }
    info!("Done writing DCD");
    Ok(())
}

/// Rewrite the loaded IVT with a null DCD pointer, for ROMs without
/// SKIP_DCD_HEADER.
fn clear_dcd(sdp: &mut Sdp<'_>, ivt: &Ivt, blob: &[u8]) -> Result<()> {
    let Some(head) = blob.get(ivt.offset..ivt.offset + IVT_REWRITE_LEN) else {
        warn!("Boot image is too small to clear DCD");
        return Ok(());
    };
    info!("Clearing DCD...");
    let mut patched = head.to_vec();
    patched[12..16].fill(0);
    sdp.write_blob(&patched, ivt.addr, 0, IVT_REWRITE_LEN)?;
    info!("Done clearing DCD");
    Ok(())
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    subfw: &str,
    blob: &[u8],
) -> Result<()> {
    let soc = ctx.config.soc;
    let mut sdp = Sdp::new(device, ctx.sink)?;

    if is_sdps_stage(name, subfw) {
        return sdps_write(ctx, &sdp, blob);
    }

    let ivt = Ivt::find(blob).map_err(|e| anyhow!("No IVT header in boot image: {}", e))?;

    if name == "u-boot-with-dcd" {
        write_dcd(ctx, &sdp, &ivt, blob)?;
    }

    info!(firmware = name, "Downloading firmware...");
    if name == "flash-bin" && subfw == "u-boot" {
        let offset = ivt.payload_end()?;
        if offset >= blob.len() {
            bail!("Invalid offset 0x{:x} found for U-Boot proper in boot image", offset);
        }
        // SPL picks the load address of U-Boot proper itself.
        sdp.write_blob(blob, 0, offset, blob.len() - offset)?;
        info!("Jumping to firmware...");
        sdp.jump(0)?;
        return Ok(());
    }

    let mut size = ivt.load_size()? as usize;
    let available = blob.len() - ivt.offset;
    if size > available {
        warn!(size, available, "Write size is too large, truncating...");
        size = available;
    }
    let mut written = 0;
    while written < size {
        let len = (size - written).min(MAX_DOWNLOAD_SIZE);
        sdp.write_blob(blob, ivt.addr + written as u32, ivt.offset + written, len)?;
        written += len;
    }

    let spl_stage = name == "u-boot-with-dcd" || name == "SPL" || (name == "flash-bin" && subfw == "spl");
    if spl_stage {
        if soc.is(&["imx6q", "imx6d", "imx6sl"]) {
            clear_dcd(&mut sdp, &ivt, blob)?;
        } else {
            info!("Skipping DCD header...");
            sdp.skip_dcd_header()?;
        }
    }

    info!(firmware = name, addr = %format!("0x{:08x}", ivt.addr), "Jumping to firmware");
    sdp.jump(ivt.addr)?;
    Ok(())
}
