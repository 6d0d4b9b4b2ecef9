//! STM32MP: every stage goes through DfuSe alternate settings.

use anyhow::{Result, anyhow, bail};
use tracing::info;

use super::FirmwareContext;
use crate::protocol::dfu::{self, Dfu};
use crate::transport::UsbTransport;

/// Alternate setting name prefixes accepted for each artifact, in order of
/// preference. Loader versions disagree on how they name them.
fn partition_prefixes(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "tf-a" => Some(&["@FSBL"]),
        "fip" => Some(&["@Partition3", "@SSBL", "@FIP"]),
        "fip-ddr" => Some(&["@DDR FIP"]),
        _ => None,
    }
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    blob: &[u8],
) -> Result<()> {
    let Some(prefixes) = partition_prefixes(name) else {
        bail!("unsupported firmware {}", name);
    };

    info!("Searching for partition id...");
    let partid = prefixes
        .iter()
        .find_map(|prefix| dfu::search_partid(device, prefix, true))
        .ok_or_else(|| anyhow!("No DFU altsetting found with iInterface in {:?}*", prefixes))?;

    let mut dfu = Dfu::new(device, ctx.sink, true)?;
    info!(partid, "Downloading file...");
    dfu.download_and_run(blob, partid, 0, blob.len())?;

    if name == "fip-ddr" {
        info!("Sending detach command...");
        let fip = dfu::search_partid(device, "@FIP", true)
            .ok_or_else(|| anyhow!("No DFU altsetting found with iInterface in [\"@FIP\"]*"))?;
        dfu.detach(fip)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::firmware::tests::{firmware_set, no_sleep, recovery_config};
    use crate::session::SessionConfig;
    use crate::transport::{MockIo, MockTransport, dfu_layout};

    fn status(state: u8) -> [u8; 6] {
        [0, 0, 0, 0, state, 0]
    }

    fn ctx_run(device: &MockTransport, name: &str) -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = recovery_config("stm32mp15", firmware_set(dir.path(), &[]));
        let session = SessionConfig::default();
        let ctx = FirmwareContext {
            config: &config,
            session: &session,
            sink: &NullSink,
            sleep: &no_sleep,
        };
        run(&ctx, device, name, &[0x5a; 16])
    }

    #[test]
    fn test_fip_uses_first_matching_prefix() {
        let device = MockTransport::new().with_layout(dfu_layout(&["@FSBL", "@SSBL", "@Partition3"]));
        for state in [2, 5, 2] {
            device.queue_reply(&status(state));
        }
        ctx_run(&device, "fip").unwrap();
        assert_eq!(device.io_log()[0], MockIo::SetAlt { interface: 0, alt: 2 });
        assert_eq!(device.pending_replies(), 0);
    }

    #[test]
    fn test_fip_ddr_detaches_fip() {
        let device = MockTransport::new().with_layout(dfu_layout(&["@DDR FIP", "@FIP"]));
        for state in [2, 5, 2, 2] {
            device.queue_reply(&status(state));
        }
        ctx_run(&device, "fip-ddr").unwrap();
        let alts: Vec<_> = device
            .io_log()
            .into_iter()
            .filter_map(|io| match io {
                MockIo::SetAlt { alt, .. } => Some(alt),
                _ => None,
            })
            .collect();
        assert_eq!(alts, vec![0, 1]);
        let detach = device.control_outs().pop().unwrap();
        assert_eq!(detach.0, 0);
    }

    #[test]
    fn test_unknown_firmware_and_missing_partition() {
        let device = MockTransport::new().with_layout(dfu_layout(&["@FSBL"]));
        assert!(ctx_run(&device, "u-boot").is_err());
        assert!(ctx_run(&device, "fip").is_err());
        assert!(device.io_log().is_empty());
    }
}
