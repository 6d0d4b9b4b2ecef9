//! Microchip SAMA5: SAM-BA applets for clocks and DRAM, then U-Boot.
//!
//! Applets are loaded at a per-SoC SRAM address. Their parameters go in a
//! mailbox right behind the applet's first word; the applet writes its
//! status back into the same mailbox before returning to the monitor.

use anyhow::{Result, anyhow, bail};
use tracing::info;

use super::FirmwareContext;
use crate::config::{ConfigError, FirmwareArtifact};
use crate::protocol::memory::MemoryOps;
use crate::protocol::{CdcAcm, SambaMonitor};
use crate::soc::SocModel;
use crate::transport::UsbTransport;

const APPLET_CMD_INITIALIZE: u32 = 0;
/// Not a valid status, lets us tell whether the applet wrote one.
const APPLET_STATUS_UNSET: u32 = 0xffff_ffff;
const COMM_TYPE_USB: u32 = 0;
const TRACE_LEVEL_DEBUG: u32 = 5;

/// L2 cache controller register, cleared to use the L2 cache as SRAM.
const SFR_L2CC_HRAMC: u32 = 0xf803_0058;

/// External RAM presets known to the extram applet.
const RAM_PRESETS: &[(&str, u32)] = &[
    ("DDR2_MT47H128M8:Preset 0 (4 x MT47H128M8)", 0),
    ("DDR2_MT47H64M16:Preset 1 (1 x MT47H64M16)", 1),
    ("DDR2_MT47H64M16:Preset 17 (2 x MT47H64M16)", 17),
    ("DDR2_MT47H128M16:Preset 2 (2 x MT47H128M16)", 2),
    ("DDR2_MT47H128M16:Preset 18 (1 x MT47H128M16)", 18),
    ("LPDDR2_MT42L128M16:Preset 3 (2 x MT42L128M16)", 3),
    ("DDR3_MT41K128M16:Preset 4 (2 x MT41K128M16)", 4),
    ("DDR3_MT41K128M16:Preset 11 (1 x MT41K128M16)", 11),
    ("LPDDR3_EDF8164A3MA:Preset 5 (EDF8164A3MA)", 5),
    ("SDRAM_IS42S16100E:Preset 6 (IS42S16100E)", 6),
    ("SDRAM_W981216BH:Preset 7 (W981216BH)", 7),
    ("DDR2_W971GG6SB:Preset 8 (W971GG6SB)", 8),
    ("DDR2_W972GG6KB:Preset 9 (W972GG6KB)", 9),
    ("DDR2_W972GG6KB:Preset 12 (W972GG6KB_16)", 12),
    ("SDRAM_AS4C16M16SA:Preset 10 (AS4C16M16SA)", 10),
    ("LPDDR2_AD220032D:Preset 13 (AD220032D)", 13),
    ("LPDDR2_AD210032D:Preset 14 (AD210032D)", 14),
    ("DDR2_W9712G6KB:Preset 15 (W9712G6KB)", 15),
    ("DDR2_W9751G6KB:Preset 16 (W9751G6KB)", 16),
];

fn status_name(status: u32) -> &'static str {
    match status {
        0x00 => "APPLET_SUCCESS",
        0x01 => "APPLET_DEV_UNKNOWN",
        0x02 => "APPLET_WRITE_FAIL",
        0x03 => "APPLET_READ_FAIL",
        0x04 => "APPLET_PROTECT_FAIL",
        0x05 => "APPLET_UNPROTECT_FAIL",
        0x06 => "APPLET_ERASE_FAIL",
        0x07 => "APPLET_NO_DEV",
        0x08 => "APPLET_ALIGN_ERROR",
        0x09 => "APPLET_BAD_BLOCK",
        0x0a => "APPLET_PMECC_CONFIG",
        0x0f => "APPLET_FAIL",
        _ => "unknown status",
    }
}

fn applet_address(soc: SocModel) -> Option<u32> {
    match soc.name() {
        "sama5d2" => Some(0x0022_0000),
        "sama5d3" => Some(0x0030_0000),
        "sama5d4" => Some(0x0020_0000),
        _ => None,
    }
}

/// Register whose bit 0 remaps the ROM addresses to SRAM0.
pub(crate) fn remap_register(soc: SocModel) -> Option<u32> {
    match soc.name() {
        "sama5d2" => Some(0x0060_0000),
        "sama5d3" => Some(0x0080_0000),
        "sama5d4" => Some(0x0070_0000),
        _ => None,
    }
}

struct ChipId {
    cidr: u32,
    mask: u32,
    value: u32,
    /// EXID register and accepted values, for parts that need it.
    exid: Option<(u32, &'static [u32])>,
}

fn chip_id(soc: SocModel) -> Option<ChipId> {
    match soc.name() {
        "sama5d2" => Some(ChipId {
            cidr: 0xfc06_9000,
            mask: 0xffff_ffe0,
            value: 0x8a5c_08c0,
            exid: None,
        }),
        "sama5d3" => Some(ChipId {
            cidr: 0xffff_ee40,
            mask: 0xffff_fffe,
            value: 0x8a5c_07c2,
            exid: Some((
                0xffff_ee44,
                &[0x0044_4300, 0x0041_4300, 0x0041_4301, 0x0058_4300, 0x0000_4301],
            )),
        }),
        "sama5d4" => Some(ChipId {
            cidr: 0xfc06_9040,
            mask: 0xffff_ffe0,
            value: 0x8a5c_07c0,
            exid: None,
        }),
        _ => None,
    }
}

/// Check the CIDR (and EXID where relevant) of the connected chip against
/// `soc`.
pub fn check_chip_id<M: MemoryOps>(mem: &mut M, soc: SocModel) -> Result<()> {
    let id = chip_id(soc).ok_or_else(|| anyhow!("No chip id for {}", soc))?;
    let cidr = mem.read32(id.cidr)?;
    let mut valid = cidr & id.mask == id.value;
    if let Some((reg, accepted)) = id.exid {
        let exid = mem.read32(reg)?;
        valid &= accepted.contains(&exid);
    }
    if !valid {
        bail!(
            "Invalid CIDR 0x{:08x} or EXID, chip model not recognized, please check your soc model argument",
            cidr
        );
    }
    Ok(())
}

fn open_monitor<'a>(ctx: &FirmwareContext<'a>, device: &'a dyn UsbTransport) -> Result<SambaMonitor<'a>> {
    let port = CdcAcm::new(device, ctx.session.transfer_timeout())?;
    Ok(SambaMonitor::new(port, ctx.sink)?)
}

/// Connect to the monitor and check it runs on the expected chip. SAMA5D2
/// also gets its L2 cache turned into SRAM for the applets.
pub(crate) fn prepare(ctx: &FirmwareContext<'_>, device: &dyn UsbTransport) -> Result<()> {
    let mut monitor = open_monitor(ctx, device)?;
    info!(version = %monitor.version()?, "SAM-BA monitor connected");
    info!("Checking chip id...");
    check_chip_id(&mut monitor, ctx.config.soc)?;
    if ctx.config.soc.is(&["sama5d2"]) {
        monitor.write32(SFR_L2CC_HRAMC, 0)?;
    }
    Ok(())
}

/// Remap ROM addresses to SRAM0 once DRAM is up.
pub(crate) fn remap(ctx: &FirmwareContext<'_>, device: &dyn UsbTransport) -> Result<()> {
    let reg = remap_register(ctx.config.soc).ok_or_else(|| anyhow!("No remap register for {}", ctx.soc_name()))?;
    let mut monitor = open_monitor(ctx, device)?;
    monitor.write32(reg, 1)?;
    Ok(())
}

fn required<T>(artifact: &str, key: &'static str, value: Option<T>) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::MissingKey {
        artifact: artifact.to_string(),
        key,
    })
}

/// Mailbox parameters following the common header.
fn applet_params(name: &str, artifact: &FirmwareArtifact) -> Result<Vec<u32>> {
    match name {
        "lowlevel" => Ok(vec![0]),
        "extram" => {
            let preset = required(name, "preset", artifact.preset.as_deref())?;
            let value = RAM_PRESETS
                .iter()
                .find(|(known, _)| *known == preset)
                .map(|(_, value)| *value)
                .ok_or_else(|| anyhow!("Unsupported preset '{}' for extram applet", preset))?;
            Ok(vec![0, value])
        }
        _ => bail!("Error: Unsupported firmware {}", name),
    }
}

fn run_applet<M: MemoryOps>(mem: &mut M, address: u32, mailbox: &[u32], blob: &[u8]) -> Result<u32> {
    mem.write_blob(blob, address, 0, blob.len())?;
    for (i, word) in mailbox.iter().enumerate() {
        mem.write32(address + 4 + 4 * i as u32, *word)?;
    }
    mem.jump(address)?;
    Ok(mem.read32(address + 8)?)
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    blob: &[u8],
) -> Result<()> {
    let artifact = ctx.config.firmware.artifact(name)?;

    if name == "u-boot" {
        let addr = required(name, "address", artifact.address)?;
        let addr = u32::try_from(addr).map_err(|_| anyhow!("U-Boot address 0x{:x} is out of range", addr))?;
        let mut monitor = open_monitor(ctx, device)?;
        info!(addr = %format!("0x{:08x}", addr), "Downloading U-Boot...");
        monitor.write_blob(blob, addr, 0, blob.len())?;
        info!("Jumping to U-Boot...");
        monitor.jump(addr)?;
        return Ok(());
    }

    let params = applet_params(name, artifact)?;
    let address = applet_address(ctx.config.soc).ok_or_else(|| anyhow!("No applet address for {}", ctx.soc_name()))?;
    let mut mailbox = vec![
        APPLET_CMD_INITIALIZE,
        APPLET_STATUS_UNSET,
        COMM_TYPE_USB,
        TRACE_LEVEL_DEBUG,
        required(name, "console_instance", artifact.console_instance)?,
        required(name, "console_ioset", artifact.console_ioset)?,
    ];
    mailbox.extend(params);

    let mut monitor = open_monitor(ctx, device)?;
    info!(applet = name, addr = %format!("0x{:08x}", address), "Running applet...");
    let status = run_applet(&mut monitor, address, &mailbox, blob)?;
    if status != 0 {
        bail!("{} applet returned error status: {}", name, status_name(status));
    }
    info!(applet = name, "Applet done");
    Ok(())
}
