//! SAMA5: clock and RAM applets through the SAM-BA monitor, then U-Boot.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::RecoveryContext;
use crate::firmware::sama5;

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    info!("Connecting to SAM-BA monitor...");
    let dev = ctx.acquire()?;
    // The monitor sometimes needs a reset before it answers
    if let Err(e) = dev.reset() {
        warn!(error = %e, "Failed to reset SAM-BA device");
    }
    drop(dev);
    ctx.sleep(Duration::from_secs(1));
    let dev = ctx.reacquire()?;

    ctx.with_firmware(|fw| sama5::prepare(fw, dev.as_ref()))?;

    info!("Initializing clock tree...");
    ctx.run_firmware(dev.as_ref(), "lowlevel", "")?;
    info!("Initializing external RAM...");
    ctx.run_firmware(dev.as_ref(), "extram", "")?;

    ctx.with_firmware(|fw| sama5::remap(fw, dev.as_ref()))?;
    info!("Installing U-Boot...");
    ctx.run_firmware(dev.as_ref(), "u-boot", "")
}
