//! ZynqMP: FSBL into the ROM, then the boot image into the FSBL.

use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use super::RecoveryContext;
use crate::firmware::zynqmp::FSBL_PARTID;
use crate::protocol::dfu;

const FSBL_START: Duration = Duration::from_millis(500);

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let dev = ctx.acquire()?;
    if ctx.config.firmware.contains("fsbl") {
        ctx.run_firmware(dev.as_ref(), "fsbl", "")?;
    } else {
        warn!("No FSBL image given, will attempt to extract it from full boot image");
        ctx.run_firmware(dev.as_ref(), "boot", "fsbl")?;
    }
    drop(dev);

    ctx.sleep(FSBL_START);
    // The ROM gadget can still be around at the same path for a while
    let dev = ctx.reacquire_until(&|d| dfu::list_partids(d).contains(&FSBL_PARTID))?;
    ctx.run_firmware(dev.as_ref(), "boot", "")
}
