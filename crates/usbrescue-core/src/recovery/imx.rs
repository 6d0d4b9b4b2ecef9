//! i.MX: SPL (or a DCD U-Boot) into the ROM over SDP/SDPS, then U-Boot into
//! the SPL's SDP gadget.

use anyhow::{Result, bail};
use tracing::info;

use super::RecoveryContext;
use crate::firmware::imx::{has_sdps_second_stage, is_sdpv, uses_sdps};
use crate::firmware::spl_candidates;

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let soc = ctx.config.soc;
    let config = ctx.config;
    let dev = ctx.acquire()?;

    if uses_sdps(soc) {
        ctx.run_firmware(dev.as_ref(), "flash-bin", "spl-sdps")?;
        if !has_sdps_second_stage(soc) {
            return Ok(());
        }
    } else if config.firmware.contains("u-boot-with-dcd") {
        return ctx.run_firmware(dev.as_ref(), "u-boot-with-dcd", "");
    } else if config.firmware.contains("SPL") {
        ctx.run_firmware(dev.as_ref(), "SPL", "")?;
    } else {
        ctx.run_firmware(dev.as_ref(), "flash-bin", "spl")?;
    }
    info!("SDP command sequence done, closing ROM device");
    drop(dev);

    info!("Waiting for SPL device...");
    let candidates = spl_candidates();
    let timeout = ctx.session.spl_wait();
    let (index, dev) = ctx.find_any(&candidates, timeout)?;

    // i.MX8 boot containers carry U-Boot too, which only SDPV can find
    if soc.name().contains("imx8") {
        if !is_sdpv(&candidates[index]) {
            bail!("The installed SPL version does not support autofinding U-Boot");
        }
        ctx.run_firmware(dev.as_ref(), "flash-bin", "u-boot")
    } else {
        ctx.run_firmware(dev.as_ref(), "u-boot", "")
    }
}
