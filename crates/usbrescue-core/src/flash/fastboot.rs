//! Running fastboot command lists against U-Boot.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::image::sparse::SparseImage;
use crate::protocol::{Fastboot, FastbootCommand};

/// Parse the `downloadsize` variable, reported in hex.
pub fn parse_download_size(value: &str) -> Option<usize> {
    let digits = value.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    usize::from_str_radix(digits, 16).ok().filter(|&size| size > 0)
}

/// Download `path` and flash it to `part`. Sparse images larger than the
/// download buffer are sent as several sparse parts, each flashed in turn.
///
/// The buffer is what the device reports, lowered to `cap` when given.
pub fn flash_file(fast: &Fastboot<'_>, path: &Path, part: &str, cap: Option<usize>) -> Result<()> {
    let blob = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if SparseImage::is_sparse(&blob) {
        let value = fast.getvar("downloadsize")?;
        let reported = parse_download_size(&value)
            .with_context(|| format!("invalid fastboot download size '{}'", value))?;
        let bufsize = cap.map_or(reported, |cap| cap.min(reported));
        if blob.len() > bufsize {
            let image = SparseImage::parse(&blob)
                .with_context(|| format!("reading sparse image {}", path.display()))?;
            let parts = image.split(bufsize)?;
            for (i, sparse) in parts.iter().enumerate() {
                info!(part, index = i + 1, count = parts.len(), "Flashing sparse part");
                fast.send(&sparse.to_bytes())?;
                fast.flash(part)?;
            }
            return Ok(());
        }
    }
    fast.send(&blob)?;
    fast.flash(part)?;
    Ok(())
}

/// Run `commands` in order. A download directly followed by a flash goes
/// through [`flash_file`].
pub fn run_commands(fast: &Fastboot<'_>, commands: &[FastbootCommand]) -> Result<()> {
    let mut i = 0;
    while i < commands.len() {
        let command = &commands[i];
        info!(command = %command, "Sending command");
        if let (FastbootCommand::Download(path), Some(FastbootCommand::Flash(part))) =
            (command, commands.get(i + 1))
        {
            flash_file(fast, path, part, None).with_context(|| format!("flashing {} to {}", path.display(), part))?;
            i += 2;
            continue;
        }
        fast.run(command).with_context(|| format!("fastboot command '{}'", command))?;
        i += 1;
    }
    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::NullSink;
    use crate::image::sparse::{Chunk, ChunkData};
    use crate::transport::{MockTransport, bulk_layout};

    fn written(device: &MockTransport) -> Vec<String> {
        device
            .writes()
            .iter()
            .filter(|w| w.len() < 64 && w.iter().all(|b| b.is_ascii_graphic() || *b == b' '))
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    #[test]
    fn test_download_size_parsing() {
        assert_eq!(parse_download_size("0x08000000"), Some(0x0800_0000));
        assert_eq!(parse_download_size("2000"), Some(0x2000));
        assert_eq!(parse_download_size("0x0"), None);
        assert_eq!(parse_download_size("zz"), None);
    }

    #[test]
    fn test_plain_commands_in_order() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        device.queue_reply(b"OKAY");
        device.queue_reply(b"OKAY");
        let fast = Fastboot::new(&device, &NullSink, Duration::from_secs(1)).unwrap();
        let commands = vec![
            FastbootCommand::OemRun("mmc dev 0".into()),
            FastbootCommand::Continue,
        ];
        run_commands(&fast, &commands).unwrap();
        assert_eq!(written(&device), vec!["oem run:mmc dev 0", "continue"]);
    }

    #[test]
    fn test_large_sparse_image_sent_in_parts() {
        let image = SparseImage {
            block_size: 64,
            checksum: 0,
            chunks: vec![
                Chunk { blocks: 4, data: ChunkData::Raw(vec![0xa5; 256]) },
                Chunk { blocks: 4, data: ChunkData::DontCare },
                Chunk { blocks: 4, data: ChunkData::Raw(vec![0x5a; 256]) },
            ],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs.simg");
        std::fs::write(&path, image.to_bytes()).unwrap();
        let parts = image.split(0x180).unwrap();
        assert!(parts.len() > 1);

        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        device.queue_reply(b"OKAY0x00000180");
        for part in &parts {
            device.queue_reply(format!("DATA{:08x}", part.encoded_len()).as_bytes());
            device.queue_reply(b"OKAY");
            device.queue_reply(b"OKAY");
        }
        let fast = Fastboot::new(&device, &NullSink, Duration::from_secs(1)).unwrap();
        let commands = vec![
            FastbootCommand::Download(path),
            FastbootCommand::Flash("rootfs".into()),
        ];
        run_commands(&fast, &commands).unwrap();

        let flashes = written(&device).iter().filter(|w| *w == "flash:rootfs").count();
        assert_eq!(flashes, parts.len());
        assert_eq!(device.pending_replies(), 0);
    }
}
