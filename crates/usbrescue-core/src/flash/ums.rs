//! Copying images to a board exposed as a USB mass storage device.
//!
//! The block device or mount point only shows up once U-Boot's `ums`
//! gadget is running, so both operations wait for their destination first.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::image::sparse::SparseImage;

const PATH_RETRIES: u32 = 5;
const PATH_RETRY_SLEEP: Duration = Duration::from_secs(2);

/// Wait for `path` to exist, sleeping between checks.
pub fn wait_for_path(path: &Path, sleep: &dyn Fn(Duration)) -> Result<()> {
    info!(path = %path.display(), "Waiting for path...");
    let mut retries = 0;
    while !path.exists() {
        if retries >= PATH_RETRIES {
            bail!("Timeout: file or directory {} does not exist", path.display());
        }
        sleep(PATH_RETRY_SLEEP);
        retries += 1;
        info!("Retrying: find {} {}/{}", path.display(), retries, PATH_RETRIES);
    }
    Ok(())
}

/// Copy `src` to `dest`, or into `dest` when it is a directory. Returns
/// the path written.
pub fn copy_to_path(src: &Path, dest: &Path, sleep: &dyn Fn(Duration)) -> Result<PathBuf> {
    let target = if dest.is_dir() {
        let name = src
            .file_name()
            .with_context(|| format!("{} has no file name", src.display()))?;
        dest.join(name)
    } else {
        if let Some(dir) = dest.parent().filter(|d| !d.as_os_str().is_empty()) {
            wait_for_path(dir, sleep)?;
        }
        dest.to_path_buf()
    };
    info!(src = %src.display(), dest = %target.display(), "Copying file...");
    fs::copy(src, &target)
        .with_context(|| format!("copying {} to {}", src.display(), target.display()))?;
    Ok(target)
}

/// Write `src` to the start of block device `blockdev`, at most `size`
/// bytes of it. Sparse images only have their data ranges written.
/// Returns the number of bytes written.
pub fn write_raw(src: &Path, blockdev: &Path, size: Option<u64>, sleep: &dyn Fn(Duration)) -> Result<u64> {
    wait_for_path(blockdev, sleep)?;
    let mut file = File::open(src).with_context(|| format!("opening {}", src.display()))?;
    let mut dev = OpenOptions::new()
        .read(true)
        .write(true)
        .open(blockdev)
        .with_context(|| format!("opening {}", blockdev.display()))?;

    let mut magic = [0u8; 4];
    let is_sparse = file.read_exact(&mut magic).is_ok() && SparseImage::is_sparse(&magic);
    file.seek(SeekFrom::Start(0))?;

    let written = if is_sparse {
        let mut blob = Vec::new();
        file.read_to_end(&mut blob)?;
        let image = SparseImage::parse(&blob)
            .with_context(|| format!("reading sparse image {}", src.display()))?;
        let limit = size.unwrap_or(image.raw_size());
        info!(src = %src.display(), dev = %blockdev.display(), "Writing sparse image data ranges...");
        let mut written = 0u64;
        for (offset, data) in image.data_ranges() {
            if offset >= limit {
                break;
            }
            let len = (data.len() as u64).min(limit - offset) as usize;
            dev.seek(SeekFrom::Start(offset))?;
            dev.write_all(&data[..len])?;
            written += len as u64;
        }
        written
    } else {
        let limit = match size {
            Some(size) => size,
            None => file.metadata()?.len(),
        };
        info!(
            src = %src.display(),
            dev = %blockdev.display(),
            "Copying {} bytes...",
            limit
        );
        io::copy(&mut file.take(limit), &mut dev)
            .with_context(|| format!("writing {}", blockdev.display()))?
    };
    dev.sync_all()?;
    info!("Done");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::image::sparse::{Chunk, ChunkData};

    #[test]
    fn test_wait_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let slept = Cell::new(0);
        let sleep = |_: Duration| slept.set(slept.get() + 1);
        assert!(wait_for_path(&dir.path().join("sdb"), &sleep).is_err());
        assert_eq!(slept.get(), PATH_RETRIES);
        wait_for_path(dir.path(), &sleep).unwrap();
    }

    #[test]
    fn test_copy_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("Image");
        fs::write(&src, b"kernel").unwrap();
        let mount = dir.path().join("mnt");
        fs::create_dir(&mount).unwrap();

        let written = copy_to_path(&src, &mount, &|_: Duration| {}).unwrap();
        assert_eq!(written, mount.join("Image"));
        assert_eq!(fs::read(written).unwrap(), b"kernel");
    }

    #[test]
    fn test_raw_write_keeps_tail_of_device() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("boot.img");
        fs::write(&src, [1u8; 100]).unwrap();
        let dev = dir.path().join("sdb");
        fs::write(&dev, [0xffu8; 200]).unwrap();

        assert_eq!(write_raw(&src, &dev, Some(64), &|_: Duration| {}).unwrap(), 64);
        let content = fs::read(&dev).unwrap();
        assert_eq!(content.len(), 200);
        assert!(content[..64].iter().all(|&b| b == 1));
        assert!(content[64..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_sparse_write_skips_dontcare() {
        let image = SparseImage {
            block_size: 16,
            checksum: 0,
            chunks: vec![
                Chunk { blocks: 1, data: ChunkData::Raw(vec![1; 16]) },
                Chunk { blocks: 2, data: ChunkData::DontCare },
                Chunk { blocks: 1, data: ChunkData::Fill([2; 4]) },
            ],
        };
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("rootfs.simg");
        fs::write(&src, image.to_bytes()).unwrap();
        let dev = dir.path().join("sdb");
        fs::write(&dev, [0xffu8; 64]).unwrap();

        assert_eq!(write_raw(&src, &dev, None, &|_: Duration| {}).unwrap(), 32);
        let content = fs::read(&dev).unwrap();
        assert_eq!(&content[..16], &[1; 16]);
        assert_eq!(&content[16..48], &[0xff; 32]);
        assert_eq!(&content[48..64], &[2; 16]);
    }
}
