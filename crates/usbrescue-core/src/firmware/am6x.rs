//! TI AM6x: ROM and SPL both expose DFU with named alternate settings.

use anyhow::{Result, anyhow, bail};
use tracing::info;

use super::FirmwareContext;
use crate::protocol::dfu::{self, Dfu};
use crate::transport::UsbTransport;

/// DFU alternate setting receiving `name`, and whether the device must be
/// detached afterwards.
fn target(am62lx: bool, name: &str) -> Option<(&'static str, bool)> {
    match (am62lx, name) {
        (_, "tiboot3") => Some(("bootloader", false)),
        (true, "tispl") => Some(("bootloader", false)),
        (false, "tispl") => Some(("tispl.bin", false)),
        (false, "sysfw") => Some(("sysfw.itb", true)),
        (_, "u-boot") => Some(("u-boot.img", true)),
        _ => None,
    }
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    blob: &[u8],
) -> Result<()> {
    let am62lx = ctx.config.soc.is(&["am62lx"]);
    let Some((partname, detach)) = target(am62lx, name) else {
        bail!("unsupported firmware {}", name);
    };

    info!("Searching for partition id...");
    let partid = dfu::search_partid(device, partname, false)
        .ok_or_else(|| anyhow!("No DFU altsetting found with iInterface='{}'", partname))?;

    let mut dfu = Dfu::new(device, ctx.sink, false)?;
    info!(partid, partname, "Downloading file...");
    dfu.download_and_run(blob, partid, 0, blob.len())?;
    if detach {
        info!("Sending detach command...");
        dfu.detach(partid)?;
    }
    Ok(())
}
