//! Allwinner FEL.
//!
//! The SPL cannot simply be written to SRAM: parts of it overlap memory the
//! boot ROM still needs to return to FEL mode. Those parts go to backup
//! areas, and a small thunk swaps them in before running the SPL and back
//! out when the SPL returns. The thunk binary and the SoC memory map are
//! supplied by the `spl` artifact (`thunk` and `soc-info` keys).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::FirmwareContext;
use crate::config::{ConfigError, FirmwareArtifact};
use crate::image::egon::EgonHeader;
use crate::image::uboot::UbootImage;
use crate::protocol::{Fel, MemoryOps};
use crate::transport::UsbTransport;

const UBOOT_MIN_OFFSET: usize = 0x8000;
const SPL_SETTLE: Duration = Duration::from_millis(500);
const FEL_RETURN_MAGIC: &[u8; 8] = b"eGON.FEL";

const MMU_TT_SIZE: u32 = 0x4000;
const MMU_TT_ENTRIES: usize = (MMU_TT_SIZE / 4) as usize;
const DRAM_BASE: u32 = 0x4000_0000;
const DRAM_END: u32 = 0xc000_0000;
const UNSET_WORD: u32 = 0xcafe_deca;

/// ACTLR |= 2, enabling the L2 cache.
const L2_ENABLE_PROG: [u8; 16] = [
    0x30, 0x2f, 0x11, 0xee, 0x02, 0x20, 0x82, 0xe3, 0x30, 0x2f, 0x01, 0xee, 0x1e, 0xff, 0x2f, 0xe1,
];

/// Store TTBR0 and TTBCR.N into the two trailing words when SCTLR.M is set.
const MMU_CHECK_PROG: [u8; 44] = [
    0x10, 0x0f, 0x11, 0xee, 0x01, 0x00, 0x10, 0xe2, 0x04, 0x00, 0x00, 0x0a, 0x50, 0x0f, 0x12, 0xee,
    0x07, 0x20, 0x00, 0xe2, 0x0c, 0x20, 0x8f, 0xe5, 0x10, 0x0f, 0x12, 0xee, 0x00, 0x00, 0x8f, 0xe5,
    0x1e, 0xff, 0x2f, 0xe1, 0xca, 0xde, 0xfe, 0xca, 0xca, 0xde, 0xfe, 0xca,
];

/// Load DACR, TTBCR and TTBR0 from the trailing words. TTBR0 is appended.
const MMU_SETUP_PROG: [u8; 44] = [
    0x1c, 0x00, 0x9f, 0xe5, 0x10, 0x0f, 0x03, 0xee, 0x18, 0x00, 0x9f, 0xe5, 0x50, 0x0f, 0x02, 0xee,
    0x14, 0x00, 0x9f, 0xe5, 0x10, 0x0f, 0x02, 0xee, 0x4f, 0xf0, 0x7f, 0xf5, 0x6f, 0xf0, 0x7f, 0xf5,
    0x1e, 0xff, 0x2f, 0xe1, 0x55, 0x55, 0x55, 0x55, 0x00, 0x00, 0x00, 0x00,
];

/// Clear SCTLR.M, SCTLR.Z and SCTLR.I.
const MMU_DISABLE_PROG: [u8; 20] = [
    0x10, 0x0f, 0x11, 0xee, 0x01, 0x00, 0xc0, 0xe3, 0x06, 0x0b, 0xc0, 0xe3, 0x10, 0x0f, 0x01, 0xee,
    0x1e, 0xff, 0x2f, 0xe1,
];

/// Invalidate TLB, icache and branch predictor, then set SCTLR.M, Z and I.
const MMU_RESTORE_PROG: [u8; 44] = [
    0x00, 0x00, 0xa0, 0xe3, 0x17, 0x0f, 0x08, 0xee, 0x15, 0x0f, 0x07, 0xee, 0xd5, 0x0f, 0x07, 0xee,
    0x4f, 0xf0, 0x7f, 0xf5, 0x6f, 0xf0, 0x7f, 0xf5, 0x10, 0x0f, 0x11, 0xee, 0x01, 0x00, 0x80, 0xe3,
    0x06, 0x0b, 0x80, 0xe3, 0x10, 0x0f, 0x01, 0xee, 0x1e, 0xff, 0x2f, 0xe1,
];

/// Write the entry point to RVBAR and request a warm reset into AArch64.
/// RVBAR address and entry point are appended.
const RMR_PROG: [u8; 44] = [
    0x24, 0x00, 0x9f, 0xe5, 0x24, 0x10, 0x9f, 0xe5, 0x00, 0x10, 0x80, 0xe5, 0x4f, 0xf0, 0x7f, 0xf5,
    0x6f, 0xf0, 0x7f, 0xf5, 0x50, 0x0f, 0x1c, 0xee, 0x03, 0x00, 0x80, 0xe3, 0x50, 0x0f, 0x0c, 0xee,
    0x6f, 0xf0, 0x7f, 0xf5, 0x03, 0xf0, 0x20, 0xe3, 0xfd, 0xff, 0xff, 0xea,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SramArea {
    pub start: u32,
    pub size: u32,
}

/// SRAM used by the boot ROM, and where its content is parked while the
/// SPL runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RomRegion {
    pub start: u32,
    pub backup: u32,
    pub size: u32,
}

/// SRAM layout of one Allwinner SoC.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SocInfo {
    /// Scratch area for the small helper programs.
    pub safe_addr: u32,
    pub spl_start: u32,
    pub sram_size: u32,
    pub thunk: SramArea,
    #[serde(default)]
    pub rom: Vec<RomRegion>,
    /// Where to build a translation table when the ROM left the MMU off.
    #[serde(default)]
    pub tt_addr: Option<u32>,
    #[serde(default)]
    pub rvbar_addr: Option<u32>,
}

impl SocInfo {
    /// Parse a SoC map. The document is either the map itself or a
    /// collection of maps keyed by SoC name.
    pub fn from_yaml_str(content: &str, soc: &str) -> Result<Self, serde_yaml::Error> {
        let doc: serde_yaml::Value = serde_yaml::from_str(content)?;
        match doc.get(soc) {
            Some(entry) => serde_yaml::from_value(entry.clone()),
            None => serde_yaml::from_value(doc),
        }
    }

    pub fn load(path: &Path, soc: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading SoC info {}", path.display()))?;
        Self::from_yaml_str(&content, soc).with_context(|| format!("parsing SoC info {}", path.display()))
    }
}

/// Slice of the SPL image and where it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fragment {
    offset: u32,
    dest: u32,
    size: u32,
}

fn intersects(start1: u32, size1: u32, start2: u32, size2: u32) -> bool {
    let (start1, size1, start2, size2) = (start1 as u64, size1 as u64, start2 as u64, size2 as u64);
    if start2 < start1 {
        start2 + size2 > start1
    } else {
        start2 < start1 + size1
    }
}

/// Split the SPL around the ROM regions it overlaps.
///
/// Returns the fragments to write and the region table for the thunk:
/// `(start, backup, size)` little endian words per ROM region, terminated
/// by an all zero entry.
fn plan_fragments(info: &SocInfo, spl_len: u32) -> Result<(Vec<Fragment>, Vec<u8>)> {
    let spl_start = info.spl_start;
    let spl_end = spl_start as u64 + spl_len as u64;
    let mut fragments = Vec::new();
    let mut table = Vec::with_capacity(12 * (info.rom.len() + 1));
    let mut offset = 0u32;
    let mut sram = spl_start;

    for region in &info.rom {
        for word in [region.start, region.backup, region.size] {
            table.extend_from_slice(&word.to_le_bytes());
        }
        if !intersects(spl_start, spl_len, region.start, region.size) {
            continue;
        }

        let mut r = *region;
        if r.start < spl_start {
            let shift = spl_start - r.start;
            r.backup += shift;
            r.size = r.size.saturating_sub(shift);
            r.start = spl_start;
        }
        if r.start as u64 + r.size as u64 > spl_end {
            r.size = (spl_end - r.start as u64) as u32;
        }
        if intersects(spl_start, spl_len, r.backup, r.size) {
            bail!("Backup area 0x{:x} for ROM region 0x{:x} intersects with SPL's area", r.backup, region.start);
        }

        let gap = r
            .start
            .checked_sub(sram)
            .ok_or_else(|| anyhow!("ROM regions overlap or are not sorted (0x{:x})", region.start))?;
        fragments.push(Fragment {
            offset,
            dest: sram,
            size: gap,
        });
        offset += gap;
        fragments.push(Fragment {
            offset,
            dest: r.backup,
            size: r.size,
        });
        offset += r.size;
        sram = r.start + r.size;
    }
    table.extend_from_slice(&[0u8; 12]);

    fragments.push(Fragment {
        offset,
        dest: sram,
        size: spl_len - offset,
    });
    debug!(?fragments, "SPL fragments");
    Ok((fragments, table))
}

fn run_prog<M: MemoryOps>(mem: &mut M, addr: u32, prog: &[u8]) -> Result<()> {
    mem.write_blob(prog, addr, 0, prog.len())?;
    mem.jump(addr)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TranslationTable {
    addr: u32,
    entries: Vec<u32>,
}

/// Back up the ROM's translation table, or set up a flat one when the ROM
/// left the MMU off and the SoC map gives a place for it.
fn check_mmu<M: MemoryOps>(mem: &mut M, info: &SocInfo) -> Result<Option<TranslationTable>> {
    run_prog(mem, info.safe_addr, &MMU_CHECK_PROG)?;
    let ret = info.safe_addr + MMU_CHECK_PROG.len() as u32;
    let tt_addr = mem.read32(ret - 8)?;

    if tt_addr == UNSET_WORD {
        info!("MMU not enabled by ROM");
        let Some(tt_addr) = info.tt_addr else {
            return Ok(None);
        };
        info!(tt_addr = %format!("0x{:08x}", tt_addr), "Generating custom MMU translation table");
        let mut prog = MMU_SETUP_PROG.to_vec();
        prog.extend_from_slice(&tt_addr.to_le_bytes());
        run_prog(mem, info.safe_addr, &prog)?;

        let mut entries: Vec<u32> = (0..MMU_TT_ENTRIES as u32).map(|i| 0x0000_0de2 | (i << 20)).collect();
        entries[0] |= 0x1000;
        entries[MMU_TT_ENTRIES - 1] |= 0x1000;
        return Ok(Some(TranslationTable { addr: tt_addr, entries }));
    }

    let ttbcr_n = mem.read32(ret - 4)? & 7;
    let mask = (1u32 << (14 - ttbcr_n)) - 1;
    if tt_addr & mask != 0 {
        bail!("Invalid MMU TT address 0x{:x} with alignment mask 0x{:x}", tt_addr, mask);
    }
    debug!(
        tt_addr = %format!("0x{:08x}", tt_addr),
        mask = %format!("0x{:x}", mask),
        "Backing up MMU translation table"
    );
    let mut entries = Vec::with_capacity(MMU_TT_ENTRIES);
    for i in 0..MMU_TT_ENTRIES as u32 {
        let entry = mem.read32(tt_addr + 4 * i)?;
        if (entry >> 1) & 1 != 1 || (entry >> 18) & 1 != 0 || entry >> 20 != i {
            bail!("Not a valid MMU TT entry 0x{:x}", entry);
        }
        entries.push(entry);
    }
    Ok(Some(TranslationTable { addr: tt_addr, entries }))
}

fn disable_mmu<M: MemoryOps>(mem: &mut M, info: &SocInfo) -> Result<()> {
    info!("Disabling MMU...");
    run_prog(mem, info.safe_addr, &MMU_DISABLE_PROG)
}

/// Write back the table, with DRAM mapped write-back cacheable and the
/// last section (ROM) cacheable, then turn the MMU back on.
fn restore_mmu<M: MemoryOps>(mem: &mut M, info: &SocInfo, mut tt: TranslationTable) -> Result<()> {
    const ATTR_MASK: u32 = (7 << 12) | (1 << 3) | (1 << 2);
    for entry in &mut tt.entries[(DRAM_BASE >> 20) as usize..(DRAM_END >> 20) as usize] {
        *entry = (*entry & !ATTR_MASK) | (1 << 12);
    }
    if let Some(last) = tt.entries.last_mut() {
        *last = (*last & !ATTR_MASK) | (1 << 12) | (1 << 3) | (1 << 2);
    }

    info!("Restoring MMU...");
    let table: Vec<u8> = tt.entries.iter().flat_map(|e| e.to_le_bytes()).collect();
    mem.write_blob(&table, tt.addr, 0, table.len())?;
    run_prog(mem, info.safe_addr, &MMU_RESTORE_PROG)
}

fn enables_l2(soc: &str) -> bool {
    matches!(soc, "a10" | "a10s" | "a13" | "r8")
}

/// Stage the SPL through the thunk and wait for it to return to FEL.
/// Returns the SPL length and the device tree name it records.
fn run_spl<M: MemoryOps>(
    ctx: &FirmwareContext<'_>,
    mem: &mut M,
    info: &SocInfo,
    thunk: &[u8],
    blob: &[u8],
) -> Result<(u32, Option<String>)> {
    let header = EgonHeader::parse(blob)?;
    let spl_len = header.length;
    if let Some(dt_name) = &header.dt_name {
        info!(dt_name = %dt_name, "SPL device tree name");
    }

    if enables_l2(ctx.soc_name()) {
        info!("Enabling L2 cache");
        run_prog(mem, info.safe_addr, &L2_ENABLE_PROG)?;
    }

    let tt = check_mmu(mem, info)?;
    disable_mmu(mem, info)?;

    if spl_len > info.sram_size {
        bail!("This SPL image is too large for this SoC's SRAM");
    }
    if intersects(info.spl_start, spl_len, info.thunk.start, info.thunk.size) {
        bail!("SRAM area for thunk overlaps with SRAM area for SPL");
    }

    info!("Writing SPL fragments...");
    let (fragments, regions) = plan_fragments(info, spl_len)?;
    for f in fragments.iter().filter(|f| f.size > 0) {
        mem.write_blob(blob, f.dest, f.offset as usize, f.size as usize)?;
    }

    let mut full_thunk = thunk.to_vec();
    full_thunk.extend_from_slice(&info.spl_start.to_le_bytes());
    full_thunk.extend_from_slice(&regions);
    if full_thunk.len() > info.thunk.size as usize {
        bail!(
            "Thunk of {} bytes does not fit its {} byte SRAM area",
            full_thunk.len(),
            info.thunk.size
        );
    }
    info!("Jumping to thunk...");
    mem.write_blob(&full_thunk, info.thunk.start, 0, full_thunk.len())?;
    mem.jump(info.thunk.start)?;

    ctx.pause(SPL_SETTLE);
    if let Some(tt) = tt {
        restore_mmu(mem, info, tt)?;
    }

    let mut ret = mem.read32(info.spl_start + 4)?.to_le_bytes().to_vec();
    ret.extend_from_slice(&mem.read32(info.spl_start + 8)?.to_le_bytes());
    if ret != FEL_RETURN_MAGIC {
        bail!("Invalid return value found in SPL SRAM");
    }
    Ok((spl_len, header.dt_name))
}

fn rmr_jump<M: MemoryOps>(mem: &mut M, info: &SocInfo, entry: u32) -> Result<()> {
    info!(entry = %format!("0x{:08x}", entry), "Entering second stage firmware using RMR request");
    let Some(rvbar) = info.rvbar_addr else {
        bail!("Cannot jump to U-Boot, your SoC does not have an address defined for RVBAR");
    };
    let mut prog = RMR_PROG.to_vec();
    prog.extend_from_slice(&rvbar.to_le_bytes());
    prog.extend_from_slice(&entry.to_le_bytes());
    run_prog(mem, info.safe_addr, &prog)
}

/// Load a FIT or legacy U-Boot image and start it. The SoC map is only
/// needed for AArch64 entry points.
fn run_uboot<M: MemoryOps>(
    mem: &mut M,
    blob: &[u8],
    dt_name: Option<&str>,
    soc_info: impl FnOnce() -> Result<SocInfo>,
) -> Result<()> {
    let plan = UbootImage::parse(blob)?.plan(dt_name)?;
    for segment in &plan.segments {
        info!(
            image = %segment.name,
            addr = %format!("0x{:08x}", segment.addr),
            len = segment.data.len(),
            "Downloading image..."
        );
        mem.write_blob(segment.data, segment.addr, 0, segment.data.len())?;
    }
    let entry = plan
        .entry
        .ok_or_else(|| anyhow!("No entry point found in U-Boot image"))?;

    info!("Jumping to U-Boot...");
    if plan.arm64 {
        rmr_jump(mem, &soc_info()?, entry)
    } else {
        mem.jump(entry)?;
        Ok(())
    }
}

/// First of `name`, `spl` and `u-boot-with-spl` whose artifact sets `key`.
fn staging_file<'c>(
    ctx: &FirmwareContext<'c>,
    name: &str,
    key: &'static str,
    field: fn(&FirmwareArtifact) -> Option<&Path>,
) -> Result<&'c Path, ConfigError> {
    [name, "spl", "u-boot-with-spl"]
        .iter()
        .filter_map(|n| ctx.config.firmware.get(n))
        .find_map(field)
        .ok_or_else(|| ConfigError::MissingKey {
            artifact: name.to_string(),
            key,
        })
}

fn load_soc_info(ctx: &FirmwareContext<'_>, name: &str) -> Result<SocInfo> {
    let path = staging_file(ctx, name, "soc-info", |a| a.soc_info.as_deref())?;
    SocInfo::load(path, ctx.soc_name())
}

fn load_thunk(ctx: &FirmwareContext<'_>, name: &str) -> Result<Vec<u8>> {
    let path = staging_file(ctx, name, "thunk", |a| a.thunk.as_deref())?;
    std::fs::read(path).with_context(|| format!("reading thunk {}", path.display()))
}

pub(super) fn run(
    ctx: &FirmwareContext<'_>,
    device: &dyn UsbTransport,
    name: &str,
    blob: &[u8],
) -> Result<()> {
    if !matches!(name, "spl" | "u-boot" | "u-boot-with-spl") {
        bail!("unsupported firmware {}", name);
    }

    let mut fel = Fel::new(device, ctx.sink, ctx.session.transfer_timeout())?;
    let version = fel.verify_device()?;
    debug!(soc_id = %format!("0x{:04x}", version.soc_id()), "FEL device");

    match name {
        "spl" => {
            let info = load_soc_info(ctx, name)?;
            let thunk = load_thunk(ctx, name)?;
            run_spl(ctx, &mut fel, &info, &thunk, blob)?;
            Ok(())
        }
        // No dt name here: a standalone U-Boot FIT needs a default
        // configuration.
        "u-boot" => run_uboot(&mut fel, blob, None, || load_soc_info(ctx, name)),
        _ => {
            let info = load_soc_info(ctx, name)?;
            let thunk = load_thunk(ctx, name)?;
            info!("Running SPL part of image");
            let (spl_len, dt_name) = run_spl(ctx, &mut fel, &info, &thunk, blob)?;
            let offset = (spl_len as usize).max(UBOOT_MIN_OFFSET);
            let Some(uboot) = blob.get(offset..) else {
                warn!(offset, len = blob.len(), "No U-Boot after SPL");
                bail!("U-Boot offset 0x{:x} is past the end of the image", offset);
            };
            info!(offset = %format!("0x{:x}", offset), "Running U-Boot part of image");
            run_uboot(&mut fel, uboot, dt_name.as_deref(), || Ok(info))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::convert::Infallible;

    use super::*;
    use crate::events::NullSink;
    use crate::firmware::tests::{firmware_set, recovery_config};
    use crate::image::egon::tests::spl;
    use crate::image::uboot::tests::{fit, legacy};
    use crate::session::SessionConfig;
    use crate::transport::MockTransport;

    /// Byte addressed memory that plays the thunk's part on return.
    #[derive(Default)]
    struct SimMemory {
        bytes: HashMap<u32, u8>,
        jumps: Vec<u32>,
        /// Thunk address and SPL start: jumping there marks a FEL return.
        fel_return: Option<(u32, u32)>,
    }

    impl SimMemory {
        fn bytes_at(&self, addr: u32, len: usize) -> Vec<u8> {
            (0..len as u32)
                .map(|i| self.bytes.get(&(addr + i)).copied().unwrap_or(0))
                .collect()
        }

        fn store(&mut self, addr: u32, data: &[u8]) {
            for (i, b) in data.iter().enumerate() {
                self.bytes.insert(addr + i as u32, *b);
            }
        }
    }

    impl MemoryOps for SimMemory {
        type Error = Infallible;

        fn read32(&mut self, addr: u32) -> Result<u32, Infallible> {
            let b = self.bytes_at(addr, 4);
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        fn write32(&mut self, addr: u32, value: u32) -> Result<(), Infallible> {
            self.store(addr, &value.to_le_bytes());
            Ok(())
        }

        fn write_blob(&mut self, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), Infallible> {
            self.store(addr, &blob[offset..offset + size]);
            Ok(())
        }

        fn jump(&mut self, addr: u32) -> Result<(), Infallible> {
            self.jumps.push(addr);
            if let Some((thunk, spl_start)) = self.fel_return {
                if addr == thunk {
                    self.store(spl_start + 4, FEL_RETURN_MAGIC);
                }
            }
            Ok(())
        }
    }

    fn soc_info() -> SocInfo {
        SocInfo {
            safe_addr: 0x2000,
            spl_start: 0x10000,
            sram_size: 0x8000,
            thunk: SramArea {
                start: 0x1a200,
                size: 0x200,
            },
            rom: vec![
                RomRegion {
                    start: 0x11c00,
                    backup: 0x1a400,
                    size: 0x400,
                },
                RomRegion {
                    start: 0x15c00,
                    backup: 0x1a800,
                    size: 0x1400,
                },
            ],
            tt_addr: None,
            rvbar_addr: Some(0x0170_00a0),
        }
    }

    fn with_ctx<T>(soc: &str, f: impl FnOnce(&FirmwareContext<'_>) -> T) -> (T, Vec<Duration>) {
        let dir = tempfile::tempdir().unwrap();
        let config = recovery_config(soc, firmware_set(dir.path(), &[]));
        let session = SessionConfig::default();
        let pauses = RefCell::new(Vec::new());
        let sleep = |d: Duration| pauses.borrow_mut().push(d);
        let ctx = FirmwareContext {
            config: &config,
            session: &session,
            sink: &NullSink,
            sleep: &sleep,
        };
        let out = f(&ctx);
        (out, pauses.into_inner())
    }

    #[test]
    fn test_spl_split_around_rom_regions() {
        let (fragments, table) = plan_fragments(&soc_info(), 0x6000).unwrap();
        assert_eq!(
            fragments,
            vec![
                Fragment { offset: 0, dest: 0x10000, size: 0x1c00 },
                Fragment { offset: 0x1c00, dest: 0x1a400, size: 0x400 },
                Fragment { offset: 0x2000, dest: 0x12000, size: 0x3c00 },
                Fragment { offset: 0x5c00, dest: 0x1a800, size: 0x400 },
                Fragment { offset: 0x6000, dest: 0x16000, size: 0 },
            ]
        );
        // unclipped regions plus terminator
        assert_eq!(table.len(), 36);
        assert_eq!(&table[12..24], &[0x00, 0x5c, 0x01, 0, 0x00, 0xa8, 0x01, 0, 0x00, 0x14, 0, 0]);
        assert_eq!(&table[24..], &[0u8; 12]);

        let (fragments, _) = plan_fragments(&soc_info(), 0x1000).unwrap();
        assert_eq!(fragments, vec![Fragment { offset: 0, dest: 0x10000, size: 0x1000 }]);
    }

    #[test]
    fn test_backup_inside_spl_is_rejected() {
        let mut info = soc_info();
        info.rom[0].backup = 0x13000;
        assert!(plan_fragments(&info, 0x6000).is_err());
    }

    #[test]
    fn test_spl_staging() {
        let info = soc_info();
        let image = spl(0x2400, Some("sun8i-h3-orangepi-pc"));
        let thunk = [0xaa; 0x40];
        let mut mem = SimMemory {
            fel_return: Some((info.thunk.start, info.spl_start)),
            ..Default::default()
        };
        let (result, pauses) = with_ctx("h3", |ctx| run_spl(ctx, &mut mem, &info, &thunk, &image));
        let (spl_len, dt_name) = result.unwrap();
        assert_eq!(spl_len, 0x2400);
        assert_eq!(dt_name.as_deref(), Some("sun8i-h3-orangepi-pc"));
        assert_eq!(pauses, vec![SPL_SETTLE]);
        // MMU check, MMU disable, thunk
        assert_eq!(mem.jumps, vec![0x2000, 0x2000, 0x1a200]);

        assert_eq!(mem.bytes_at(0x10100, 4), image[0x100..0x104].to_vec());
        assert_eq!(mem.bytes_at(0x11c00, 4), vec![0; 4]);
        assert_eq!(mem.bytes_at(0x1a400, 0x400), image[0x1c00..0x2000].to_vec());
        assert_eq!(mem.bytes_at(0x12000, 0x400), image[0x2000..].to_vec());
        assert_eq!(mem.bytes_at(0x1a240, 4), 0x10000u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_spl_without_fel_return_fails() {
        let info = soc_info();
        let image = spl(0x400, None);
        let mut mem = SimMemory::default();
        let (result, _) = with_ctx("a13", |ctx| run_spl(ctx, &mut mem, &info, &[0; 4], &image));
        assert!(format!("{:#}", result.unwrap_err()).contains("Invalid return value"));
        // L2 enable comes first on a13
        assert_eq!(mem.jumps, vec![0x2000, 0x2000, 0x2000, 0x1a200]);
    }

    #[test]
    fn test_spl_checks_sram_map() {
        let mut info = soc_info();
        info.sram_size = 0x200;
        let image = spl(0x400, None);
        let mut mem = SimMemory::default();
        assert!(with_ctx("h3", |ctx| run_spl(ctx, &mut mem, &info, &[0; 4], &image)).0.is_err());

        let mut info = soc_info();
        info.thunk.start = 0x10200;
        assert!(with_ctx("h3", |ctx| run_spl(ctx, &mut mem, &info, &[0; 4], &image)).0.is_err());
    }

    #[test]
    fn test_generated_translation_table_is_restored() {
        let mut info = soc_info();
        info.tt_addr = Some(0x4400_0000);
        let image = spl(0x400, None);
        let mut mem = SimMemory {
            fel_return: Some((info.thunk.start, info.spl_start)),
            ..Default::default()
        };
        with_ctx("h3", |ctx| run_spl(ctx, &mut mem, &info, &[0; 4], &image))
            .0
            .unwrap();

        let entry = |mem: &mut SimMemory, i: u32| mem.read32(0x4400_0000 + 4 * i).unwrap();
        assert_eq!(entry(&mut mem, 0), 0x0000_1de2);
        assert_eq!(entry(&mut mem, 0x400), 0x4000_1de2);
        assert_eq!(entry(&mut mem, 0xc00), 0xc000_0de2);
        assert_eq!(entry(&mut mem, 0xfff), 0xfff0_1dee);
        assert_eq!(mem.bytes_at(0x2000, 44), MMU_RESTORE_PROG.to_vec());
    }

    #[test]
    fn test_legacy_uboot_jumps_to_load_address() {
        let image = legacy(b"U-Boot proper");
        let mut mem = SimMemory::default();
        run_uboot(&mut mem, &image, None, || bail!("not needed")).unwrap();
        assert_eq!(mem.bytes_at(0x4a00_0000, 13), b"U-Boot proper".to_vec());
        assert_eq!(mem.jumps, vec![0x4a00_0000]);
    }

    #[test]
    fn test_arm64_fit_uses_rmr() {
        let image = fit(false);
        let mut mem = SimMemory::default();
        run_uboot(&mut mem, &image, None, || Ok(soc_info())).unwrap();
        assert_eq!(mem.bytes_at(0x44000, 4), b"BL31".to_vec());
        assert_eq!(mem.bytes_at(0x4a00_0008, 4), b"DTB!".to_vec());
        assert_eq!(mem.jumps, vec![0x2000]);
        let tail = mem.bytes_at(0x2000 + 44, 8);
        assert_eq!(&tail[..4], &0x0170_00a0u32.to_le_bytes());
        assert_eq!(&tail[4..], &0x44000u32.to_le_bytes());

        let mut info = soc_info();
        info.rvbar_addr = None;
        let mut mem = SimMemory::default();
        let err = run_uboot(&mut mem, &image, None, || Ok(info)).unwrap_err();
        assert!(err.to_string().contains("RVBAR"));
    }

    #[test]
    fn test_soc_info_from_yaml() {
        let yaml = "
h3:
  safe_addr: 0x2000
  spl_start: 0x0
  sram_size: 0x8000
  thunk: { start: 0xa200, size: 0x200 }
  rom:
    - { start: 0x5c00, backup: 0xa400, size: 0x400 }
a64:
  safe_addr: 0x12000
  spl_start: 0x10000
  sram_size: 0x8000
  thunk: { start: 0x1a200, size: 0x200 }
  rvbar_addr: 0x17000a0
";
        let info = SocInfo::from_yaml_str(yaml, "a64").unwrap();
        assert_eq!(info.spl_start, 0x10000);
        assert_eq!(info.rvbar_addr, Some(0x0170_00a0));
        assert!(info.rom.is_empty());
        assert_eq!(SocInfo::from_yaml_str(yaml, "h3").unwrap().rom.len(), 1);

        let single = "safe_addr: 8192\nspl_start: 0\nsram_size: 32768\nthunk: { start: 41472, size: 512 }\n";
        assert_eq!(SocInfo::from_yaml_str(single, "h3").unwrap().thunk.start, 0xa200);
    }

    #[test]
    fn test_unknown_firmware_rejected_before_io() {
        let device = MockTransport::new();
        let (result, _) = with_ctx("h3", |ctx| run(ctx, &device, "boot0", &[]));
        assert!(result.is_err());
        assert!(device.io_log().is_empty());
    }
}
