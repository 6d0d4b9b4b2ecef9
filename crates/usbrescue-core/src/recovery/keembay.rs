//! Keem Bay: the whole FIP goes to the ROM's fastboot gadget.

use anyhow::Result;

use super::RecoveryContext;

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let dev = ctx.acquire()?;
    ctx.run_firmware(dev.as_ref(), "fip", "")
}
