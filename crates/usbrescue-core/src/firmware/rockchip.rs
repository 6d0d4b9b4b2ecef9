//! Rockchip mask ROM: code 471/472 blobs over control transfers, then
//! U-Boot FIT over the DFU gadget of the loaded SPL.

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tracing::info;

use super::FirmwareContext;
use crate::image::rkloader::{self, EntryTable, RkLoader};
use crate::protocol::dfu::{self, Dfu};
use crate::protocol::rockchip::{CODE_471, CODE_472};
use crate::protocol::RockchipRom;
use crate::transport::UsbTransport;

fn send_loader(ctx: &FirmwareContext<'_>, rom: &RockchipRom<'_>, blob: &[u8]) -> Result<()> {
    let loader = RkLoader::parse(blob)?;
    info!("{}", loader);
    for table in [EntryTable::Code471, EntryTable::Code472] {
        for index in 0..loader.entries(table).len() {
            let (data, delay_ms) = loader.entry_data(table, index)?;
            info!(entry = %table, index, len = data.len(), "Downloading loader entry...");
            rom.write_blob(data, table.code())?;
            if delay_ms > 0 {
                info!("Sleeping {}ms", delay_ms);
                ctx.pause(Duration::from_millis(delay_ms as u64));
            }
        }
    }
    Ok(())
}

fn send_fit(ctx: &FirmwareContext<'_>, device: &dyn UsbTransport, blob: &[u8]) -> Result<()> {
    let partid = dfu::search_partid(device, "u-boot.itb", false)
        .ok_or_else(|| anyhow!("Missing u-boot.itb DFU partition"))?;
    let mut dfu = Dfu::new(device, ctx.sink, false)?;
    info!(partid, "Downloading U-Boot FIT...");
    dfu.download_and_run(blob, partid, 0, blob.len())?;
    dfu.detach(partid)?;
    Ok(())
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    blob: &[u8],
) -> Result<()> {
    let code = match name {
        "u-boot-fit" => return send_fit(ctx, device, blob),
        "xpl" => None,
        "code471" => Some(CODE_471),
        "code472" => Some(CODE_472),
        _ => bail!("unsupported firmware {}", name),
    };

    let rom = RockchipRom::new(device, ctx.sink)?;
    match code {
        None => send_loader(ctx, &rom, blob),
        Some(code) => {
            info!("Downloading {}...", name);
            let scrambled = rkloader::rc4_scramble(blob, ctx.soc_name());
            rom.write_blob(&scrambled, code)?;
            Ok(())
        }
    }
}
