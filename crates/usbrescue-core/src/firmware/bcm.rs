//! Broadcom BCM2711/BCM2712: bootcode from the `bootfiles` archive, then a
//! file server answering bootcode's requests.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use super::FirmwareContext;
use crate::image::bootfiles::Bootfiles;
use crate::image::mbr;
use crate::protocol::bcm::BootcodeCommand;
use crate::protocol::{BcmRom, BootcodeServer};
use crate::soc::SocModel;
use crate::transport::UsbTransport;

const ROM_SETTLE: Duration = Duration::from_secs(2);
const BOOT_IMG_SETTLE: Duration = Duration::from_secs(3);

/// Archive subfolder and bootcode file name.
fn layout(soc: SocModel) -> Option<(&'static str, &'static str)> {
    match soc.name() {
        "bcm2711" => Some(("2711", "bootcode4.bin")),
        "bcm2712" => Some(("2712", "bootcode5.bin")),
        _ => None,
    }
}

/// `boot` firmware as served to bootcode. With a `u-boot` artifact
/// configured, a copy of the image is patched to boot it.
fn boot_image(ctx: &FirmwareContext<'_>) -> Result<Vec<u8>> {
    let mut image = ctx.config.firmware.load_blob("boot")?;
    if ctx.config.firmware.contains("u-boot") {
        info!("U-Boot found in recovery config, patching 'boot' firmware");
        let uboot = ctx.config.firmware.load_blob("u-boot")?;
        mbr::patch_boot_image(&mut image, &uboot).context("adding U-Boot to 'boot' firmware")?;
    } else {
        debug!("U-Boot not found in recovery config, using unmodified 'boot' firmware");
    }
    Ok(image)
}

fn requested_file(ctx: &FirmwareContext<'_>, files: &Bootfiles<'_>, subfolder: &str, name: &str) -> Result<Vec<u8>> {
    match name {
        "boot.img" => boot_image(ctx),
        "config.txt" => Ok(ctx.config.firmware.load_raw("config")?),
        _ => Ok(files.fetch(subfolder, name)?),
    }
}

fn serve_bootcode(ctx: &FirmwareContext<'_>, device: &dyn UsbTransport, files: &Bootfiles<'_>, subfolder: &str) -> Result<()> {
    let server = BootcodeServer::new(device, ctx.sink);
    info!("Serving bootcode requests...");
    let mut cached: Option<(String, Vec<u8>)> = None;
    loop {
        let (command, name) = server.next_command()?;
        if command == BootcodeCommand::Done {
            break;
        }
        debug!(?command, file = %name, "Serving bootcode request");

        // GET_FILE_SIZE and GET_FILE come in pairs for the same file.
        let file = match cached.take() {
            Some((cached_name, data)) if cached_name == name => data,
            _ => requested_file(ctx, files, subfolder, &name)?,
        };
        match command {
            BootcodeCommand::GetFileSize => server.send_file_size(&file)?,
            BootcodeCommand::GetFile => {
                server.send_file(&name, &file)?;
                info!(file = %name, "Served requested file");
                if name == "boot.img" {
                    info!("Waiting for 'boot' firmware to load...");
                    ctx.pause(BOOT_IMG_SETTLE);
                }
            }
            BootcodeCommand::Done => {}
        }
        cached = Some((name, file));
    }
    info!("Done serving bootcode requests");
    Ok(())
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    subfw: &str,
    blob: &[u8],
) -> Result<()> {
    if name != "bootfiles" {
        bail!("Unexpected firmware '{}'", name);
    }
    let Some((subfolder, bootcode_name)) = layout(ctx.config.soc) else {
        bail!("Unexpected SoC {}", ctx.soc_name());
    };
    let files = Bootfiles::new(blob);

    match subfw {
        "bootcode" => {
            let bootcode = files.fetch(subfolder, bootcode_name)?;
            info!("Sending 'bootfiles'/{} to ROM code...", bootcode_name);
            let rom = BcmRom::new(device);
            rom.send_file(&bootcode)?;
            debug!("Waiting for ROM code to process file");
            ctx.pause(ROM_SETTLE);
            rom.status()
                .with_context(|| format!("transfer of 'bootfiles'/{} to ROM code", bootcode_name))?;
            Ok(())
        }
        "bootcode_firmwares" => serve_bootcode(ctx, device, &files, subfolder),
        _ => bail!("Unexpected subfirmware '{}'", subfw),
    }
}
