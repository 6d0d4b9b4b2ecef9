//! Intel Keem Bay: the ROM takes its FIP through a fastboot download.

use anyhow::{Result, bail};
use tracing::info;

use super::FirmwareContext;
use crate::protocol::Fastboot;
use crate::transport::UsbTransport;

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    blob: &[u8],
) -> Result<()> {
    if name != "fip" {
        bail!("unsupported firmware {}", name);
    }
    let fastboot = Fastboot::new(device, ctx.sink, ctx.session.fastboot_timeout())?;
    info!("Downloading file...");
    fastboot.send(blob)?;
    Ok(())
}
