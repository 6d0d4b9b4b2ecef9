//! TI AM6x and AM62Lx: tiboot3 into the ROM, then tispl and U-Boot into the
//! successive DFU gadgets.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use super::RecoveryContext;
use crate::events::RecoveryPhase;
use crate::protocol::dfu;
use crate::transport::UsbTransport;

/// Without this delay the re-enumerated device is present but not ready.
const SETTLE: Duration = Duration::from_secs(1);
const UBOOT_START: Duration = Duration::from_secs(2);

/// Install `name`, which resets the device, and wait for it to come back.
fn send_and_reacquire(
    ctx: &mut RecoveryContext<'_>,
    dev: Box<dyn UsbTransport>,
    name: &str,
) -> Result<Box<dyn UsbTransport>> {
    ctx.run_firmware(dev.as_ref(), name, "")?;
    drop(dev);
    ctx.sleep(SETTLE);
    ctx.reacquire_after(name)
}

fn recover_am62lx(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let dev = ctx.acquire()?;
    let dev = send_and_reacquire(ctx, dev, "tiboot3")?;
    let dev = send_and_reacquire(ctx, dev, "tispl")?;
    ctx.sleep(SETTLE);
    ctx.run_firmware(dev.as_ref(), "u-boot", "")?;
    ctx.sleep(UBOOT_START);
    Ok(())
}

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    if ctx.config.soc.is(&["am62lx"]) {
        return recover_am62lx(ctx);
    }

    let dev = ctx.acquire()?;
    let mut dev = send_and_reacquire(ctx, dev, "tiboot3")?;

    // Some U-Boot versions need tiboot3 twice
    if dfu::search_partid(dev.as_ref(), "bootloader", false).is_some() {
        info!("ROM still present, sending tiboot3 again");
        ctx.enter(RecoveryPhase::Phase1Transfer);
        dev = send_and_reacquire(ctx, dev, "tiboot3")?;
    }

    ctx.run_firmware(dev.as_ref(), "tispl", "")?;
    ctx.run_firmware(dev.as_ref(), "u-boot", "")?;
    drop(dev);
    ctx.sleep(UBOOT_START);

    // Newer U-Boot only runs SPL from the above and takes u-boot once more
    match ctx.reacquire_after("u-boot") {
        Ok(dev) => ctx.run_firmware(dev.as_ref(), "u-boot", ""),
        Err(e) => {
            info!(reason = %format!("{:#}", e), "No device after U-Boot, done");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::run_recovery;
    use crate::events::RecoveryPhase::*;
    use crate::transport::{MockProvider, MockTransport, dfu_layout};

    fn dfu_device(names: &[&str], states: &[u8]) -> MockTransport {
        let device = MockTransport::new().with_layout(dfu_layout(names));
        for state in states {
            device.queue_reply(&[0, 0, 0, 0, *state, 0]);
        }
        device
    }

    const FILES: [(&str, &[u8]); 3] = [("tiboot3", b"T3"), ("tispl", b"SPL"), ("u-boot", b"UB")];

    #[test]
    fn test_am65_flow_without_second_u_boot() {
        let provider = MockProvider::new();
        provider.push(dfu_device(&["bootloader"], &[2, 5, 2]));
        let spl = dfu_device(&["tispl.bin", "u-boot.img"], &[2, 5, 2, 2, 5, 2, 2]);
        provider.push(spl.clone());

        let (result, sink) = run_recovery("am625", &FILES, |_| {}, &provider);
        result.unwrap();
        assert_eq!(spl.pending_replies(), 0);
        assert_eq!(
            provider.calls(),
            vec!["acquire 1-1", "reacquire 1-1", "reacquire 1-1"]
        );
        assert_eq!(
            sink.phases(),
            vec![Phase1Transfer, ReenumerationWait, Phase2Transfer, ReenumerationWait]
        );
    }

    #[test]
    fn test_tiboot3_resent_while_rom_remains() {
        let provider = MockProvider::new();
        provider.push(dfu_device(&["bootloader"], &[2, 5, 2]));
        provider.push(dfu_device(&["bootloader"], &[2, 5, 2]));
        provider.push(dfu_device(&["tispl.bin", "u-boot.img"], &[2, 5, 2, 2, 5, 2, 2]));
        let last = dfu_device(&["u-boot.img"], &[2, 5, 2, 2]);
        provider.push(last.clone());

        let (result, _) = run_recovery("am625", &FILES, |_| {}, &provider);
        result.unwrap();
        assert_eq!(last.pending_replies(), 0);
        assert_eq!(provider.calls().len(), 4);
    }
}
