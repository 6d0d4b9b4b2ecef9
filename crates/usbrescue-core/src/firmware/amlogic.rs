//! Amlogic: two generations of the ROM download protocol.
//!
//! Newer parts (protocol 1) take a `u-boot-fip` whose head is BL2; BL2
//! then pulls the rest of the FIP through AMLC requests. Older GX and AXG
//! parts (protocol 2) take separate `bl2` and `u-boot` images plus small
//! parameter blocks telling BL2 what to do.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use super::FirmwareContext;
use crate::protocol::Amlogic;
use crate::protocol::amlogic::STAGE_MINOR_SPL;
use crate::soc::SocModel;
use crate::transport::UsbTransport;

const BL2_DEFAULT_LOAD_ADDR: u32 = 0xfffa_0000;
const BL2_FIP_LEN: usize = 0x1_0000;
const BL2_FIP_BLOCK_LENGTH: usize = 4096;

const BL2_BLOCK_LENGTH: usize = 64;
const UBOOT_BLOCK_LENGTH: usize = 16384;
const DEFAULT_UBOOT_LOAD_ADDR: u32 = 0x0200_c000;

/// BL2 parameter block: initialise DDR.
const RUNPARA_DDRINIT: [u8; 32] = [
    0xab, 0xcd, 0x12, 0x34, 0x00, 0x02, 0x00, 0x00, 0xdf, 0xc0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x40, 0x00, 0xcc, 0xc0, 0x82, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00,
];

/// BL2 parameter block: run the FIP image loaded behind it.
const RUNPARA_RUNFIPIMG: [u8; 48] = [
    0xab, 0xcd, 0x12, 0x34, 0x00, 0x02, 0x00, 0x00, 0xe1, 0xc0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x00, 0x02,
    0x00, 0x40, 0x0a, 0x00, 0x57, 0x62, 0xcc, 0x85, 0xc6, 0x7e, 0x5e, 0x10, 0xd4, 0xf8, 0x84, 0xdf,
];

const BL2_SETTLE: Duration = Duration::from_secs(1);

/// Parts whose ROM takes a single `u-boot-fip`.
pub(crate) fn uses_fip_protocol(soc: SocModel) -> bool {
    soc.is(&["s905d2", "s905y2", "s905x2", "a311d", "s922x", "s905x3", "s905d3"])
}

/// BL2 and BL2 parameter load addresses for protocol 2 parts.
fn bl2_addresses(soc: SocModel) -> Option<(u32, u32)> {
    match soc.name() {
        "s905d" | "s905x" | "s905w" | "s905l" | "s905m2" | "s805x" | "s805y" | "s912" | "s905"
        | "s905h" | "s905m" => Some((0xd900_0000, 0xd900_c000)),
        "a113x" | "a113d" => Some((0xfffc_0000, 0xfffc_c000)),
        _ => None,
    }
}

/// Address from artifact metadata, or `default` with a warning.
fn load_addr(
    ctx: &FirmwareContext<'_>,
    artifact: &str,
    key: &str,
    field: impl Fn(&crate::config::FirmwareArtifact) -> Option<u64>,
    default: u32,
) -> Result<u32> {
    match ctx.config.firmware.get(artifact).and_then(field) {
        Some(addr) => u32::try_from(addr).map_err(|_| anyhow!("'{}':'{}' 0x{:x} is out of range", artifact, key, addr)),
        None => {
            warn!(
                "'{}':'{}' not found in firmware file, using default address 0x{:x}",
                artifact, key, default
            );
            Ok(default)
        }
    }
}

fn run_fip(ctx: &FirmwareContext<'_>, aml: &Amlogic<'_>, subfw: &str, blob: &[u8]) -> Result<()> {
    match subfw {
        "BL2" => {
            aml.identify()?;
            let addr = load_addr(
                ctx,
                "u-boot-fip",
                "bl2-load-addr",
                |a| a.bl2_load_addr,
                BL2_DEFAULT_LOAD_ADDR,
            )?;
            let bl2 = &blob[..blob.len().min(BL2_FIP_LEN)];
            info!(addr = %format!("0x{:08x}", addr), "Sending BL2 to ROM code...");
            aml.write_large(addr, bl2, BL2_FIP_BLOCK_LENGTH, false)?;
            debug!("Starting BL2...");
            aml.run(addr, true)?;
        }
        "U-Boot" => {
            info!("Sending U-Boot to BL2...");
            aml.serve_fip(blob)?;
        }
        _ => bail!("Unexpected subfirmware '{}'", subfw),
    }
    Ok(())
}

fn run_split(ctx: &FirmwareContext<'_>, aml: &Amlogic<'_>, name: &str, blob: &[u8]) -> Result<()> {
    let Some((bl2_addr, runpara_addr)) = bl2_addresses(ctx.config.soc) else {
        bail!("No BL2 load address for SoC {}", ctx.soc_name());
    };

    if name == "bl2" {
        aml.identify()?;
        info!(addr = %format!("0x{:08x}", bl2_addr), "Sending firmware 'bl2'");
        aml.write_blob_simple(bl2_addr, blob)?;
        debug!("Sending BL2 DDR initialisation sequence");
        aml.write_large(runpara_addr, &RUNPARA_DDRINIT, RUNPARA_DDRINIT.len(), false)?;
        debug!("Starting firmware 'bl2'");
        aml.run(bl2_addr, true)?;
        ctx.pause(BL2_SETTLE);
        if aml.identify()?.stage_minor == STAGE_MINOR_SPL {
            debug!("Starting BL2 DDR initialisation sequence");
            aml.run(runpara_addr, true)?;
            ctx.pause(BL2_SETTLE);
        }
        return Ok(());
    }

    let uboot_addr = load_addr(ctx, "u-boot", "load-addr", |a| a.load_addr, DEFAULT_UBOOT_LOAD_ADDR)?;
    let bl2 = ctx
        .config
        .firmware
        .load_blob("bl2")
        .context("firmware 'u-boot' needs 'bl2' on this SoC")?;
    info!(addr = %format!("0x{:08x}", bl2_addr), "Sending firmware 'bl2'");
    aml.write_large(bl2_addr, &bl2, BL2_BLOCK_LENGTH, false)?;
    debug!("Sending BL2 run FIP image sequence");
    aml.write_large(runpara_addr, &RUNPARA_RUNFIPIMG, RUNPARA_RUNFIPIMG.len(), false)?;
    info!(addr = %format!("0x{:08x}", uboot_addr), "Sending firmware 'u-boot'");
    aml.write_large(uboot_addr, blob, UBOOT_BLOCK_LENGTH, true)?;

    if aml.identify()?.stage_minor == STAGE_MINOR_SPL {
        debug!("Starting firmware 'u-boot'");
        aml.run(runpara_addr, true)?;
    } else {
        debug!("Starting firmware 'bl2'");
        aml.run(bl2_addr, true)?;
    }
    Ok(())
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    subfw: &str,
    blob: &[u8],
) -> Result<()> {
    let aml = Amlogic::new(device, ctx.sink)?;
    match name {
        "u-boot-fip" => run_fip(ctx, &aml, subfw, blob),
        "bl2" | "u-boot" => run_split(ctx, &aml, name, blob),
        _ => bail!("Unexpected firmware '{}'", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FirmwareArtifact, FirmwareSet};
    use crate::events::NullSink;
    use crate::firmware::tests::{firmware_set, no_sleep, recovery_config};
    use crate::session::SessionConfig;
    use crate::transport::{MockTransport, bulk_layout};

    const REQ_RUN_IN_ADDR: u8 = 0x05;
    const REQ_WR_LARGE_MEM: u8 = 0x11;

    fn identify_reply(stage_minor: u8) -> [u8; 8] {
        [0, 9, 0, stage_minor, 0, 0, 0, 0]
    }

    fn ctx_run(soc: &str, firmware: FirmwareSet, device: &MockTransport, name: &str, subfw: &str, blob: &[u8]) -> Result<()> {
        let config = recovery_config(soc, firmware);
        let session = SessionConfig::default();
        let ctx = FirmwareContext {
            config: &config,
            session: &session,
            sink: &NullSink,
            sleep: &no_sleep,
        };
        run(&ctx, device, name, subfw, blob)
    }

    fn runs(device: &MockTransport) -> Vec<(u16, u16)> {
        device
            .control_outs()
            .into_iter()
            .filter(|(req, ..)| *req == REQ_RUN_IN_ADDR)
            .map(|(_, value, index, _)| (value, index))
            .collect()
    }

    #[test]
    fn test_gx_bl2_starts_ddr_init_once_in_spl() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        device.queue_reply(&identify_reply(0));
        device.queue_reply(&identify_reply(STAGE_MINOR_SPL));
        ctx_run("s905x", FirmwareSet::default(), &device, "bl2", "", &[0x11; 100]).unwrap();

        assert_eq!(runs(&device), vec![(0xd900, 0x0000), (0xd900, 0xc000)]);
        let large: Vec<_> = device
            .control_outs()
            .into_iter()
            .filter(|(req, ..)| *req == REQ_WR_LARGE_MEM)
            .collect();
        assert_eq!(large.len(), 1);
        assert_eq!((large[0].1, large[0].2), (32, 1));
        assert_eq!(device.writes(), vec![RUNPARA_DDRINIT.to_vec()]);
    }

    #[test]
    fn test_axg_uboot_uses_configured_load_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = firmware_set(dir.path(), &[("bl2", &[0x22; 128]), ("u-boot", b"unused")]);
        firmware.insert(
            "u-boot",
            FirmwareArtifact {
                path: Some(dir.path().join("u-boot")),
                load_addr: Some(0x0300_0000),
                ..Default::default()
            },
        );
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        device.queue_reply(&identify_reply(0));
        ctx_run("a113d", firmware, &device, "u-boot", "", &[0x33; 100]).unwrap();

        let large: Vec<_> = device
            .control_outs()
            .into_iter()
            .filter(|(req, ..)| *req == REQ_WR_LARGE_MEM)
            .map(|(_, value, _, control)| (value, control))
            .collect();
        assert_eq!(large.len(), 3);
        assert_eq!(&large[0].1[..4], &0xfffc_0000u32.to_le_bytes());
        assert_eq!(large[1].0, 48);
        assert_eq!(&large[2].1[..4], &0x0300_0000u32.to_le_bytes());
        assert_eq!(&large[2].1[4..8], &(UBOOT_BLOCK_LENGTH as u32).to_le_bytes());
        // still in the ROM: BL2 runs the FIP parameters itself
        assert_eq!(runs(&device), vec![(0xfffc, 0x0000)]);
    }

    #[test]
    fn test_fip_bl2_uses_head_of_image() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        device.queue_reply(&identify_reply(0));
        let fip = vec![0x44; 0x1_2000];
        ctx_run("s905x3", FirmwareSet::default(), &device, "u-boot-fip", "BL2", &fip).unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), BL2_FIP_LEN / BL2_FIP_BLOCK_LENGTH);
        assert_eq!(runs(&device), vec![(0xfffa, 0x0000)]);
    }

    #[test]
    fn test_unknown_names() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        assert!(ctx_run("s905x3", FirmwareSet::default(), &device, "u-boot-fip", "BL31", &[0; 4]).is_err());
        assert!(ctx_run("s905x3", FirmwareSet::default(), &device, "bl2", "", &[0; 4]).is_err());
        assert!(ctx_run("s905x", FirmwareSet::default(), &device, "fip", "", &[0; 4]).is_err());
        assert!(device.control_outs().is_empty());
    }

    #[test]
    fn test_model_groups() {
        let soc = |name: &str| name.parse::<SocModel>().unwrap();
        assert!(uses_fip_protocol(soc("a311d")));
        assert!(!uses_fip_protocol(soc("s912")));
        assert_eq!(bl2_addresses(soc("s912")), Some((0xd900_0000, 0xd900_c000)));
        assert_eq!(bl2_addresses(soc("s905x3")), None);
    }
}
