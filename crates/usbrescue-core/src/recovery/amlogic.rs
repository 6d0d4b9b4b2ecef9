//! Amlogic: BL2 into the ROM, then U-Boot through BL2.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use super::RecoveryContext;
use crate::firmware::amlogic::uses_fip_protocol;

const BL2_START: Duration = Duration::from_secs(2);

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let dev = ctx.acquire()?;
    if uses_fip_protocol(ctx.config.soc) {
        debug!("Using the G12 and SM1 recovery protocol");
        ctx.run_firmware(dev.as_ref(), "u-boot-fip", "BL2")?;
        info!("Waiting for BL2 to start...");
        ctx.sleep(BL2_START);
        ctx.run_firmware(dev.as_ref(), "u-boot-fip", "U-Boot")
    } else {
        debug!("Using the GX and AXG recovery protocol");
        ctx.run_firmware(dev.as_ref(), "bl2", "")?;
        ctx.run_firmware(dev.as_ref(), "u-boot", "")
    }
}
