//! Broadcom: bootcode into the ROM, then serve bootcode's file requests.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use super::RecoveryContext;

const BOOTCODE_START: Duration = Duration::from_secs(2);

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let dev = ctx.acquire()?;
    ctx.run_firmware(dev.as_ref(), "bootfiles", "bootcode")?;
    drop(dev);

    info!("Waiting for bootcode to start...");
    ctx.sleep(BOOTCODE_START);
    let dev = ctx.reacquire_after("bootfiles")?;
    ctx.run_firmware(dev.as_ref(), "bootfiles", "bootcode_firmwares")
}
