//! STM32MP: TF-A into the ROM, then the FIP into the TF-A DFU gadget.

use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use super::RecoveryContext;
use crate::image::flashlayout;
use crate::protocol::dfu::{self, Dfu};

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let soc = ctx.config.soc;
    let dev = ctx.acquire()?;
    ctx.run_firmware(dev.as_ref(), "tf-a", "")?;

    let mut dfu = Dfu::new(dev.as_ref(), ctx.sink, true)?;
    if soc.is(&["stm32mp13", "stm32mp25"]) {
        info!("Sending detach command to SPL...");
        let phase = dfu.stm32_get_phase()?;
        dfu.detach(phase)?;
    }

    // The ROM of the MP15 waits for a flash layout before running TF-A
    if soc.is(&["stm32mp15"]) {
        let phase = dfu.stm32_get_phase()?;
        let part0 = dfu::search_partid(dev.as_ref(), "@Partition0", true)
            .ok_or_else(|| anyhow!("No DFU altsetting found with iInterface='Partition0*'"))?;
        if phase == part0 {
            info!("Downloading flash layout...");
            let layout = flashlayout::build_image();
            dfu.download_and_run(&layout, part0, 0, layout.len())?;
        }
    }

    if soc.is(&["stm32mp13"]) {
        ctx.sleep(Duration::from_millis(1500));
    }
    if let Err(e) = dev.reset() {
        debug!(error = %e, "Reset failed, device already gone");
    }
    ctx.sleep(Duration::from_millis(500));
    drop(dfu);
    drop(dev);

    let mut dev = ctx.reacquire_after("tf-a")?;
    if soc.is(&["stm32mp25"]) {
        ctx.run_firmware(dev.as_ref(), "fip-ddr", "")?;
        ctx.sleep(Duration::from_secs(1));
        dev = ctx.reacquire_after("fip-ddr")?;
    }

    ctx.run_firmware(dev.as_ref(), "fip", "")?;
    info!("Sending detach command to U-Boot...");
    let mut dfu = Dfu::new(dev.as_ref(), ctx.sink, true)?;
    let phase = dfu.stm32_get_phase()?;
    dfu.detach(phase)?;
    Ok(())
}
