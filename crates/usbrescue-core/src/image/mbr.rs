//! MBR partition table and the FAT patch applied to Raspberry Pi boot images.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use thiserror::Error;
use tracing::debug;

use super::{slice_at, u16_le_at, u32_le_at};

pub const SECTOR_SIZE: u64 = 512;
const MBR_LEN: usize = 512;
const BOOT_SIGNATURE: u16 = 0xaa55;
const PARTITION_TABLE: usize = 446;
const ENTRY_LEN: usize = 16;
const STATUS_ACTIVE: u8 = 1 << 7;

/// Partition types usable as FAT with LBA addressing.
const FAT_LBA_TYPES: [u8; 6] = [0x01, 0x04, 0x06, 0x0b, 0x0c, 0x0e];

const KERNEL_FILE: &str = "KERNEL8.IMG";
const UBOOT_FILE: &str = "u-boot.bin";
const CONFIG_FILE: &str = "CONFIG.TXT";
pub const CONFIG_SECTION: &str = "\n# Start of settings added by usbrescue\n\
[all]\n\
kernel=u-boot.bin\n\
arm_64bit=1\n\
# End of settings added by usbrescue\n";

#[derive(Error, Debug)]
pub enum MbrError {
    #[error("Boot image is too small to hold an MBR")]
    Truncated,

    #[error("Invalid MBR signature 0x{0:04x}")]
    BadSignature(u16),

    #[error("Partition is not active (status 0x{0:02x})")]
    Inactive(u8),

    #[error("Partition type 0x{0:02x} is not FAT with LBA")]
    NotFat(u8),

    #[error("Partition at byte 0x{0:x} lies outside the image")]
    OutOfRange(u64),

    #[error("FAT filesystem error: {0}")]
    Fat(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionEntry {
    pub status: u8,
    pub kind: u8,
    pub lba_first: u32,
    pub lba_count: u32,
}

impl PartitionEntry {
    fn parse(raw: &[u8]) -> Option<Self> {
        Some(Self {
            status: *raw.first()?,
            kind: *raw.get(4)?,
            lba_first: u32_le_at(raw, 8)?,
            lba_count: u32_le_at(raw, 12)?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status & STATUS_ACTIVE != 0
    }

    pub fn is_fat_lba(&self) -> bool {
        self.is_active() && FAT_LBA_TYPES.contains(&self.kind)
    }

    /// Byte offset of an active FAT partition.
    pub fn fat_start_offset(&self) -> Result<u64, MbrError> {
        if !self.is_active() {
            return Err(MbrError::Inactive(self.status));
        }
        if !self.is_fat_lba() {
            return Err(MbrError::NotFat(self.kind));
        }
        Ok(self.lba_first as u64 * SECTOR_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
    pub partitions: [PartitionEntry; 4],
}

impl Mbr {
    pub fn parse(blob: &[u8]) -> Result<Self, MbrError> {
        let sector = slice_at(blob, 0, MBR_LEN).ok_or(MbrError::Truncated)?;
        let signature = u16_le_at(sector, MBR_LEN - 2).ok_or(MbrError::Truncated)?;
        if signature != BOOT_SIGNATURE {
            return Err(MbrError::BadSignature(signature));
        }
        let mut partitions = [PartitionEntry::default(); 4];
        for (i, p) in partitions.iter_mut().enumerate() {
            let raw = slice_at(sector, PARTITION_TABLE + i * ENTRY_LEN, ENTRY_LEN).ok_or(MbrError::Truncated)?;
            *p = PartitionEntry::parse(raw).ok_or(MbrError::Truncated)?;
        }
        Ok(Self { partitions })
    }
}

/// Make a boot image start U-Boot instead of Linux: drop the kernel from
/// the first partition, add `u-boot.bin`, and append a config section that
/// selects it.
pub fn patch_boot_image(image: &mut [u8], uboot: &[u8]) -> Result<(), MbrError> {
    let mbr = Mbr::parse(image)?;
    let offset = mbr.partitions[0].fat_start_offset()?;
    debug!(offset = %format!("0x{:x}", offset), "First partition FAT offset");
    let volume = image
        .get_mut(offset as usize..)
        .filter(|v| !v.is_empty())
        .ok_or(MbrError::OutOfRange(offset))?;

    let fs = fatfs::FileSystem::new(Cursor::new(volume), fatfs::FsOptions::new())?;
    {
        let root = fs.root_dir();
        match root.remove(KERNEL_FILE) {
            Ok(()) => debug!("Removed {} from boot image", KERNEL_FILE),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No {} to remove from boot image", KERNEL_FILE)
            }
            Err(e) => return Err(e.into()),
        }

        let mut file = root.create_file(UBOOT_FILE)?;
        file.truncate()?;
        file.write_all(uboot)?;
        file.flush()?;

        let mut config = root.open_file(CONFIG_FILE)?;
        let mut content = String::new();
        config.read_to_string(&mut content)?;
        content.push_str(CONFIG_SECTION);
        config.seek(SeekFrom::Start(0))?;
        config.write_all(content.as_bytes())?;
        config.truncate()?;
        config.flush()?;
        debug!(config = %content.replace('\n', "\\n"), "Updated config.txt");
    }
    fs.unmount()?;
    Ok(())
}
