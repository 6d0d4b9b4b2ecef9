//! Allwinner: reset the FEL device, then SPL and U-Boot over FEL.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::RecoveryContext;
use crate::protocol::Fel;

const FEL_RETRIES: u32 = 5;

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let dev = ctx.acquire()?;
    // FEL devices sometimes only answer after a port reset
    if let Err(e) = dev.reset() {
        warn!(error = %e, "Failed to reset FEL device");
    }
    drop(dev);
    ctx.sleep(Duration::from_secs(1));
    let dev = ctx.reacquire()?;

    let timeout = ctx.session.transfer_timeout();
    let fel = Fel::new(dev.as_ref(), ctx.sink, timeout)?;
    let mut attempt = 1;
    loop {
        match fel.verify_device() {
            Ok(_) => break,
            Err(e) if attempt < FEL_RETRIES => {
                debug!(attempt, error = %e, "FEL device not ready, retrying");
                ctx.sleep(Duration::from_secs(1));
                attempt += 1;
            }
            Err(e) => return Err(e).context("FEL device did not answer VERIFY_DEVICE"),
        }
    }

    // Images may come separately or as one file
    if ctx.config.firmware.contains("u-boot-with-spl") {
        ctx.run_firmware(dev.as_ref(), "u-boot-with-spl", "")
    } else {
        ctx.run_firmware(dev.as_ref(), "spl", "")?;
        ctx.run_firmware(dev.as_ref(), "u-boot", "")
    }
}
