//! Rockchip: DDR init and USB plug code into the mask ROM, then the U-Boot
//! FIT into the loaded SPL.

use anyhow::{Result, bail};

use super::RecoveryContext;

pub(super) fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    let config = ctx.config;
    let has = |name: &str| config.firmware.contains(name);
    if !has("xpl") && !(has("code471") && has("code472")) {
        bail!(
            "Missing xpl or code471 ('*_ddr_*.bin' or 'mkimage-in-simple-bin.mkimage-u-boot-tpl') / \
             code472 ('*_usbplug_*.bin' or 'mkimage-in-simple-bin.mkimage-u-boot-spl') binary configuration"
        );
    }

    let dev = ctx.acquire()?;
    // Loader built by boot_merger
    let last = if has("xpl") {
        ctx.run_firmware(dev.as_ref(), "xpl", "")?;
        "xpl"
    } else {
        for name in ["code471", "code472"] {
            ctx.run_firmware(dev.as_ref(), name, "")?;
            ctx.artifact_delay(name);
        }
        "code472"
    };
    drop(dev);

    if has("u-boot-fit") {
        let dev = ctx.reacquire_after(last)?;
        ctx.run_firmware(dev.as_ref(), "u-boot-fit", "")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::run_recovery;
    use crate::protocol::rockchip::{CODE_471, CODE_472};
    use crate::transport::{MockProvider, MockTransport, bulk_layout};

    #[test]
    fn test_missing_loader_rejected_before_io() {
        let provider = MockProvider::new();
        let (result, _) = run_recovery("rk3399", &[("code471", b"ddr")], |_| {}, &provider);
        assert!(format!("{:#}", result.unwrap_err()).contains("code472"));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_split_loader_codes_in_order() {
        let rom = MockTransport::new().with_layout(bulk_layout(0xff));
        let provider = MockProvider::new();
        provider.push(rom.clone());
        let files: [(&str, &[u8]); 2] = [("code471", &[1u8; 16]), ("code472", &[2u8; 16])];
        let (result, _) = run_recovery("rk3588", &files, |_| {}, &provider);
        result.unwrap();
        let codes: Vec<u16> = rom.control_outs().iter().map(|c| c.2).collect();
        assert_eq!(codes, vec![CODE_471, CODE_472]);
        assert_eq!(provider.calls(), vec!["acquire 1-1"]);
    }
}
