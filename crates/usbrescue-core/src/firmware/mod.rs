//! Firmware dispatch: which protocol calls install a named artifact.
//!
//! This module is split into submodules by SoC family:
//! - `stm32mp`, `am6x`, `zynqmp`: DFU based ROMs
//! - `keembay`: fastboot ROM
//! - `imx`: SDP and SDPS
//! - `sunxi`: FEL, with SPL staging through the FEL-to-SPL thunk
//! - `amlogic`, `rockchip`, `bcm`: vendor bulk protocols
//! - `sama5`: SAM-BA monitor and its applets

mod am6x;
pub(crate) mod amlogic;
mod bcm;
pub(crate) mod imx;
mod keembay;
mod rockchip;
pub(crate) mod sama5;
mod stm32mp;
mod sunxi;
pub(crate) mod zynqmp;

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::RecoveryConfig;
use crate::events::EventSink;
use crate::session::SessionConfig;
use crate::soc::SocFamily;
use crate::transport::UsbTransport;

pub use imx::spl_candidates;
pub use sama5::check_chip_id;
pub use sunxi::SocInfo;
pub use zynqmp::BootImageHeader;

/// Everything a firmware handler reads besides the device itself.
pub struct FirmwareContext<'a> {
    pub config: &'a RecoveryConfig,
    pub session: &'a SessionConfig,
    pub sink: &'a dyn EventSink,
    /// Blocking pause between protocol steps.
    pub sleep: &'a dyn Fn(Duration),
}

impl FirmwareContext<'_> {
    pub(crate) fn pause(&self, duration: Duration) {
        (self.sleep)(duration);
    }

    pub(crate) fn soc_name(&self) -> &'static str {
        self.config.soc.name()
    }
}

/// Install firmware `name` on `device`.
///
/// `subfw` selects a part of the artifact when one file carries several
/// stages (`flash-bin`/`spl`, `u-boot-fip`/`BL2`, ...). Empty otherwise.
pub fn run_firmware(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    subfw: &str,
) -> Result<()> {
    let blob = ctx
        .config
        .firmware
        .load_blob(name)
        .with_context(|| format!("loading firmware '{}'", name))?;

    info!(firmware = name, len = blob.len(), "Installing firmware");
    if !subfw.is_empty() {
        info!(subfirmware = subfw, "Subfirmware");
    }

    match ctx.config.soc.family() {
        SocFamily::Stm32mp => stm32mp::run(ctx, device, name, &blob),
        SocFamily::Am6x => am6x::run(ctx, device, name, &blob),
        SocFamily::Keembay => keembay::run(ctx, device, name, &blob),
        SocFamily::Zynqmp => zynqmp::run(ctx, device, name, subfw, &blob),
        SocFamily::Imx => imx::run(ctx, device, name, subfw, &blob),
        SocFamily::Sunxi => sunxi::run(ctx, device, name, &blob),
        SocFamily::Amlogic => amlogic::run(ctx, device, name, subfw, &blob),
        SocFamily::Rockchip => rockchip::run(ctx, device, name, &blob),
        SocFamily::Bcm => bcm::run(ctx, device, name, subfw, &blob),
        SocFamily::Sama5 => sama5::run(ctx, device, name, &blob),
    }
    .with_context(|| format!("installing firmware '{}' on {}", name, device.path()))?;

    info!(firmware = name, "Done installing firmware");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    use crate::config::{FirmwareArtifact, FirmwareSet};
    use crate::soc::SocModel;

    pub(crate) fn no_sleep(_: Duration) {}

    /// Firmware set whose artifacts are written to files under `dir`.
    pub(crate) fn firmware_set(dir: &Path, files: &[(&str, &[u8])]) -> FirmwareSet {
        let mut set = FirmwareSet::default();
        for (name, data) in files {
            let path = dir.join(name);
            std::fs::write(&path, data).unwrap();
            set.insert(
                name,
                FirmwareArtifact {
                    path: Some(path),
                    ..Default::default()
                },
            );
        }
        set
    }

    pub(crate) fn recovery_config(soc: &str, firmware: FirmwareSet) -> RecoveryConfig {
        let soc: SocModel = soc.parse().unwrap();
        let usb = Some("1-1".parse().unwrap());
        RecoveryConfig::new(soc, usb, firmware).unwrap()
    }

    #[test]
    fn test_missing_artifact_is_reported_before_io() {
        let config = recovery_config("stm32mp15", FirmwareSet::default());
        let session = SessionConfig::default();
        let ctx = FirmwareContext {
            config: &config,
            session: &session,
            sink: &crate::events::NullSink,
            sleep: &no_sleep,
        };
        let device = crate::transport::MockTransport::new();
        let err = run_firmware(&ctx, &device, "tf-a", "").unwrap_err();
        assert!(format!("{:#}", err).contains("loading firmware 'tf-a'"));
        assert!(device.io_log().is_empty());
    }
}
