//! Extended fastboot mode.
//!
//! A small command interpreter on top of U-Boot's fastboot gadget. Images
//! larger than the fastboot buffer are cut into buffer-sized sections, each
//! sent with `download` and written with an `oem run` U-Boot command, so
//! any offset of an MMC or MTD device can be reached. Sparse images only
//! have their data ranges written.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::parse_size;
use crate::image::sparse::SparseImage;
use crate::protocol::{Fastboot, FastbootCommand, FastbootError};

pub const MMC_LBA_SIZE: u64 = 512;

pub const HELP: &str = "\
usbrescue extended Fastboot mode
syntax: <cmd> <arg1> <arg2> ...
commands:

exit : leave the session
quit : leave the session
help : show this help text

set <var> <value>: set the value of an environment variable
print [<var>]: print the value of an environment variable, or all of them

run <fastboot_cmd>: run a Fastboot command given as verb[:arg]

gpt <partitions>: write a GPT partition table to the target mmc device

flash <image_path> <image_offset> [<partition_name> | hwpart <number>]
	Write the file at <image_path> to the target device, <image_offset>
	bytes into it or into the given partition. Sparse images only have
	their data ranges written.
	Required environment variables:
		- target
		- fb-addr
		- eraseblk-size (only for MTD targets)
	Optional environment variables:
		- fb-size

Environment variables:

target: mmc0, mmc1, ... or an MTD device such as nand0 or spi-nand0
fb-addr: address in memory of the Fastboot buffer
eraseblk-size: size in bytes of an erase block on the target Flash device
fb-size: size in bytes of the Fastboot buffer, can only reduce the size
         U-Boot reports
";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UbootCmdError {
    #[error("Invalid input syntax: {0}")]
    Syntax(String),

    #[error("Invalid command {0}, type 'help' for help")]
    UnknownCommand(String),

    #[error("undefined variable {0}")]
    UndefinedVariable(String),

    #[error("please set the '{0}' environment variable")]
    MissingVariable(&'static str),

    #[error("Invalid value '{value}' for '{var}'")]
    InvalidValue { var: &'static str, value: String },

    #[error("{0}")]
    UnsupportedTarget(&'static str),

    #[error("{what} 0x{value:x} is not aligned with a 0x{align:x}-byte block")]
    Misaligned {
        what: &'static str,
        value: u64,
        align: u64,
    },

    #[error(
        "Cannot increase Fastboot buffer size! Default size is 0x{default:x}, requested size is 0x{requested:x}"
    )]
    BufferGrow { default: u64, requested: u64 },

    #[error("Fastboot buffer of 0x{size:x} bytes cannot hold a 0x{align:x}-byte block")]
    BufferTooSmall { size: u64, align: u64 },

    #[error(
        "The given value for fb-addr: 0x{0:x} seems incorrect! comparison of written check pattern failed"
    )]
    BadBufferAddress(u64),
}

/// Where in the target device an image goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashPart {
    /// GPT partition on MMC, MTD partition otherwise.
    Named(String),
    /// eMMC hardware partition.
    HwPart(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashArgs {
    pub path: PathBuf,
    pub offset: u64,
    pub part: Option<FlashPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UbootCommand {
    Exit,
    Help,
    Set { var: String, value: String },
    Print(Option<String>),
    Run(FastbootCommand),
    Gpt(String),
    Flash(FlashArgs),
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

fn syntax(msg: &str) -> UbootCmdError {
    UbootCmdError::Syntax(msg.to_string())
}

impl FromStr for UbootCommand {
    type Err = UbootCmdError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (op, rest) = match line.split_once(char::is_whitespace) {
            Some((op, rest)) => (op, rest.trim()),
            None => (line, ""),
        };
        if !is_word(op) {
            return Err(syntax(line));
        }

        Ok(match op {
            "exit" | "quit" => UbootCommand::Exit,
            "help" => UbootCommand::Help,
            "set" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
                [var, value] if is_word(var) && is_word(value) => UbootCommand::Set {
                    var: var.to_string(),
                    value: value.to_string(),
                },
                _ => return Err(syntax("invalid characters or number of args in command")),
            },
            "print" if rest.is_empty() => UbootCommand::Print(None),
            "print" if is_word(rest) => UbootCommand::Print(Some(rest.to_string())),
            "print" => return Err(syntax("invalid characters or multiple args in command")),
            "run" => UbootCommand::Run(rest.parse().map_err(|e: FastbootError| syntax(&e.to_string()))?),
            "gpt" if !rest.is_empty() => UbootCommand::Gpt(rest.to_string()),
            "gpt" => return Err(syntax("missing partition list")),
            "flash" => UbootCommand::Flash(parse_flash_args(rest)?),
            _ => return Err(UbootCmdError::UnknownCommand(op.to_string())),
        })
    }
}

fn parse_flash_args(args: &str) -> Result<FlashArgs, UbootCmdError> {
    let usage = || syntax("expected flash <image_path> <image_offset> [<partition>]");
    let (path, rest) = args.split_once(char::is_whitespace).ok_or_else(usage)?;
    let path = path.trim_matches('"');
    let rest = rest.trim();
    let (offset, part) = match rest.split_once(char::is_whitespace) {
        Some((offset, part)) => (offset, Some(part.trim())),
        None => (rest, None),
    };
    let offset = parse_size(offset).map_err(|_| UbootCmdError::InvalidValue {
        var: "image_offset",
        value: offset.to_string(),
    })?;
    let part = match part {
        None => None,
        Some(part) => match part.strip_prefix("hwpart") {
            Some(num) => Some(FlashPart::HwPart(num.trim().parse().map_err(|_| {
                UbootCmdError::InvalidValue {
                    var: "hwpart",
                    value: num.trim().to_string(),
                }
            })?)),
            None => Some(FlashPart::Named(part.to_string())),
        },
    };
    Ok(FlashArgs {
        path: PathBuf::from(path),
        offset,
        part,
    })
}

fn parse_hex(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
}

fn check_aligned(what: &'static str, value: u64, align: u64) -> Result<(), UbootCmdError> {
    if align == 0 || value % align != 0 {
        return Err(UbootCmdError::Misaligned { what, value, align });
    }
    Ok(())
}

/// Byte written at the start of the buffer to check `fb-addr`.
fn check_pattern() -> u8 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u8)
        .unwrap_or(0xa5)
}

enum Target {
    Mmc(u32),
    Mtd(String),
}

/// Storage a section is written to.
enum Medium {
    Mmc,
    Mtd(String),
}

pub struct FastbootUboot<'a> {
    fast: Fastboot<'a>,
    env: BTreeMap<String, String>,
    checked: bool,
    stop: bool,
}

impl<'a> FastbootUboot<'a> {
    pub fn new(fast: Fastboot<'a>) -> Self {
        Self {
            fast,
            env: BTreeMap::new(),
            checked: false,
            stop: false,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn set_var(&mut self, var: &str, value: &str) {
        self.env.insert(var.to_string(), value.to_string());
    }

    pub fn fastboot(&self) -> &Fastboot<'a> {
        &self.fast
    }

    fn request_env(&self, var: &'static str) -> Result<&str, UbootCmdError> {
        self.env
            .get(var)
            .map(String::as_str)
            .ok_or(UbootCmdError::MissingVariable(var))
    }

    fn env_int(&self, var: &'static str) -> Result<u64, UbootCmdError> {
        let value = self.request_env(var)?;
        parse_size(value).map_err(|_| UbootCmdError::InvalidValue {
            var,
            value: value.to_string(),
        })
    }

    fn target(&self) -> Result<Target, UbootCmdError> {
        let target = self.request_env("target")?;
        match target.strip_prefix("mmc") {
            Some(num) => num.parse().map(Target::Mmc).map_err(|_| UbootCmdError::InvalidValue {
                var: "target",
                value: target.to_string(),
            }),
            None => Ok(Target::Mtd(target.to_string())),
        }
    }

    /// Run one line. Blank lines and `#` comments are skipped. Returns the
    /// text the command printed, if any.
    pub fn run_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let command: UbootCommand = line.parse()?;
        self.execute(&command)
    }

    /// Run a command script, stopping at the first failure.
    pub fn run_script<S: AsRef<str>>(&mut self, lines: &[S]) -> Result<()> {
        for line in lines {
            let line = line.as_ref();
            info!("running command {}", line);
            if let Some(text) = self.run_line(line).with_context(|| format!("command '{}'", line))? {
                info!("{}", text);
            }
            if self.stop {
                break;
            }
        }
        Ok(())
    }

    /// Read commands from `input` until `exit` or end of input. Command
    /// errors and fastboot failures are printed and the session goes on.
    pub fn interactive(&mut self, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<()> {
        self.stop = false;
        let mut line = String::new();
        while !self.stop {
            write!(out, "usbrescue > ")?;
            out.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            match self.run_line(&line) {
                Ok(Some(text)) => writeln!(out, "{}", text)?,
                Ok(None) => {}
                Err(e) => {
                    if let Some(err) = e.downcast_ref::<UbootCmdError>() {
                        writeln!(out, "CLI Error: {}", err)?;
                    } else if let Some(FastbootError::Fail(msg)) = e.downcast_ref::<FastbootError>() {
                        writeln!(out, "Fastboot Error: {}", msg)?;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn execute(&mut self, command: &UbootCommand) -> Result<Option<String>> {
        match command {
            UbootCommand::Exit => {
                self.stop = true;
                Ok(Some("Leaving interactive session...".to_string()))
            }
            UbootCommand::Help => Ok(Some(HELP.to_string())),
            UbootCommand::Set { var, value } => {
                self.set_var(var, value);
                Ok(Some(format!("setting '{}' to '{}'", var, value)))
            }
            UbootCommand::Print(None) => Ok(Some(serde_yaml::to_string(&self.env)?.trim_end().to_string())),
            UbootCommand::Print(Some(var)) => match self.env.get(var) {
                Some(value) => Ok(Some(value.clone())),
                None => Err(UbootCmdError::UndefinedVariable(var.clone()).into()),
            },
            UbootCommand::Run(cmd) => {
                info!("Sending command {}", cmd);
                if let FastbootCommand::Getvar(var) = cmd {
                    return Ok(Some(self.fast.getvar(var)?));
                }
                self.fast.run(cmd)?;
                Ok(None)
            }
            UbootCommand::Gpt(partitions) => {
                self.gpt(partitions)?;
                Ok(None)
            }
            UbootCommand::Flash(args) => {
                self.flash(args)?;
                Ok(None)
            }
        }
    }

    fn gpt(&self, partitions: &str) -> Result<()> {
        let Target::Mmc(dev) = self.target()? else {
            return Err(UbootCmdError::UnsupportedTarget("GPT partitioning not supported for MTD targets").into());
        };
        self.fast.oem_run(&format!("gpt write mmc {} '{}'", dev, partitions))?;
        self.fast.oem_run(&format!("part list mmc {}", dev))?;
        Ok(())
    }

    /// Check that `fb-addr` really is the fastboot buffer: a byte sent
    /// with `download` must read back at that address.
    fn preflash_checks(&mut self) -> Result<()> {
        if self.checked {
            return Ok(());
        }
        info!("Running pre-flash checks...");
        let fb_addr = self.env_int("fb-addr")?;
        self.request_env("target")?;

        let pattern = check_pattern();
        self.fast.send(&[pattern])?;
        self.fast
            .oem_run(&format!("mw.b 0x{:x} 0x{:x} 1", fb_addr + 1, pattern))?;
        match self
            .fast
            .oem_run(&format!("cmp.b 0x{:x} 0x{:x} 1", fb_addr, fb_addr + 1))
        {
            Err(FastbootError::Fail(_)) => return Err(UbootCmdError::BadBufferAddress(fb_addr).into()),
            other => other?,
        }
        self.checked = true;
        Ok(())
    }

    /// Download buffer size reported by U-Boot, reduced to `fb-size`.
    fn fb_size(&self) -> Result<u64> {
        let value = self.fast.getvar("downloadsize")?;
        let size = parse_hex(&value).filter(|&size| size > 0).ok_or_else(|| {
            anyhow!(
                "Invalid Fastboot buffer size '{}'! Please check Fastboot gadget parameters!",
                value
            )
        })?;
        if !self.env.contains_key("fb-size") {
            return Ok(size);
        }
        let requested = self.env_int("fb-size")?;
        if requested > size {
            return Err(UbootCmdError::BufferGrow {
                default: size,
                requested,
            }
            .into());
        }
        debug!(size = %format!("0x{:x}", requested), "Fastboot buffer size");
        Ok(requested)
    }

    /// Select the MMC device or hardware partition. Returns the byte offset
    /// of `part` in the device.
    fn select_mmc(&self, dev: u32, part: Option<&FlashPart>) -> Result<u64> {
        match part {
            None => {
                debug!(dev, "Setting MMC device");
                self.fast.oem_run(&format!("mmc dev {}", dev))?;
                Ok(0)
            }
            Some(FlashPart::HwPart(hwpart)) => {
                debug!(dev, hwpart, "Setting MMC device");
                self.fast.oem_run(&format!("mmc dev {} {}", dev, hwpart))?;
                Ok(0)
            }
            Some(FlashPart::Named(name)) => {
                self.fast
                    .oem_run(&format!("mmc dev {}; part list mmc {}", dev, dev))?;
                debug!(part = %name, "Fetching partition start");
                self.fast.oem_run(&format!(
                    "gpt setenv mmc {} {};setenv fastboot.part_start ${{gpt_partition_addr}}",
                    dev, name
                ))?;
                let value = self.fast.getvar("part_start")?;
                let lba = parse_hex(&value)
                    .ok_or_else(|| anyhow!("Invalid start '{}' for partition {}", value, name))?;
                Ok(lba * MMC_LBA_SIZE)
            }
        }
    }

    fn write_section(&self, medium: &Medium, fb_addr: u64, blob: &[u8], dest: u64) -> Result<()> {
        let len = blob.len() as u64;
        match medium {
            Medium::Mmc => {
                check_aligned("destination offset", dest, MMC_LBA_SIZE)?;
                self.fast.send(blob)?;
                self.fast.oem_run(&format!(
                    "mmc write 0x{:x} 0x{:x} 0x{:x}",
                    fb_addr,
                    dest / MMC_LBA_SIZE,
                    len / MMC_LBA_SIZE
                ))?;
            }
            Medium::Mtd(part) => {
                debug!(part = %part, dest = %format!("0x{:x}", dest), len, "Erasing flash area");
                self.fast
                    .oem_run(&format!("mtd erase {} 0x{:x} 0x{:x}", part, dest, len))?;
                self.fast.send(blob)?;
                self.fast.oem_run(&format!(
                    "mtd write {} 0x{:x} 0x{:x} 0x{:x}",
                    part, fb_addr, dest, len
                ))?;
            }
        }
        Ok(())
    }

    /// Write `data` at `dest` in sections that fit the buffer, each padded
    /// to `align`.
    fn flash_range(&self, medium: &Medium, data: &[u8], dest: u64, align: u64, fb_size: u64) -> Result<()> {
        let fb_addr = self.env_int("fb-addr")?;
        let section = (fb_size / align) * align;
        if section == 0 {
            return Err(UbootCmdError::BufferTooSmall { size: fb_size, align }.into());
        }
        let total = data.len() as u64;
        let mut flashed = 0u64;
        for piece in data.chunks(section as usize) {
            let mut blob = piece.to_vec();
            blob.resize(piece.len().div_ceil(align as usize) * align as usize, 0);
            debug!(
                len = blob.len(),
                dest = %format!("0x{:x}", dest + flashed),
                "Flashing section"
            );
            self.write_section(medium, fb_addr, &blob, dest + flashed)?;
            flashed += piece.len() as u64;
            info!("flashed {}/{} bytes", flashed, total);
        }
        Ok(())
    }

    fn flash(&mut self, args: &FlashArgs) -> Result<()> {
        self.preflash_checks()?;
        let fb_size = self.fb_size()?;

        let blob = fs::read(&args.path).with_context(|| format!("reading {}", args.path.display()))?;
        info!(path = %args.path.display(), "Flashing file");
        let ranges = if SparseImage::is_sparse(&blob) {
            info!("Sparse image, flashing data ranges only");
            SparseImage::parse(&blob)
                .with_context(|| format!("reading sparse image {}", args.path.display()))?
                .data_ranges()
        } else {
            vec![(0, blob)]
        };

        let (medium, base, align) = match self.target()? {
            Target::Mmc(dev) => {
                info!("Flashing to MMC device...");
                check_aligned("image offset", args.offset, MMC_LBA_SIZE)?;
                let base = self.select_mmc(dev, args.part.as_ref())?;
                (Medium::Mmc, base, MMC_LBA_SIZE)
            }
            Target::Mtd(target) => {
                info!("Flashing to MTD device...");
                let part = match &args.part {
                    None => target,
                    Some(FlashPart::Named(name)) => name.clone(),
                    Some(FlashPart::HwPart(_)) => {
                        return Err(UbootCmdError::UnsupportedTarget(
                            "hardware partitions only exist on MMC targets",
                        )
                        .into());
                    }
                };
                let eraseblk = self.env_int("eraseblk-size")?;
                check_aligned("image offset", args.offset, eraseblk)?;
                (Medium::Mtd(part), 0, eraseblk)
            }
        };

        let count = ranges.len();
        for (i, (range_offset, data)) in ranges.iter().enumerate() {
            if count > 1 {
                info!("Flashing sparse range {}/{}", i + 1, count);
            }
            self.flash_range(&medium, data, base + args.offset + range_offset, align, fb_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::NullSink;
    use crate::image::sparse::{Chunk, ChunkData};
    use crate::transport::{MockTransport, bulk_layout};

    fn oem_commands(device: &MockTransport) -> Vec<String> {
        device
            .writes()
            .iter()
            .filter(|w| w.starts_with(b"oem run:"))
            .map(|w| String::from_utf8_lossy(&w[8..]).into_owned())
            .collect()
    }

    /// Replies to the pre-flash check and the buffer size query.
    fn queue_checks(device: &MockTransport, downloadsize: &str) {
        for reply in ["DATA00000001", "OKAY", "OKAY", "OKAY"] {
            device.queue_reply(reply.as_bytes());
        }
        device.queue_reply(format!("OKAY{}", downloadsize).as_bytes());
    }

    fn queue_section(device: &MockTransport, len: usize, oem_count: usize) {
        device.queue_reply(format!("DATA{:08x}", len).as_bytes());
        for _ in 0..=oem_count {
            device.queue_reply(b"OKAY");
        }
    }

    fn session<'a>(device: &'a MockTransport, vars: &[(&str, &str)]) -> FastbootUboot<'a> {
        let fast = Fastboot::new(device, &NullSink, Duration::from_secs(1)).unwrap();
        let mut session = FastbootUboot::new(fast);
        for (var, value) in vars {
            session.set_var(var, value);
        }
        session
    }

    fn image(dir: &tempfile::TempDir, data: &[u8]) -> String {
        let path = dir.path().join("image.bin");
        fs::write(&path, data).unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "set target mmc1".parse::<UbootCommand>().unwrap(),
            UbootCommand::Set {
                var: "target".into(),
                value: "mmc1".into()
            }
        );
        assert_eq!(
            "flash \"sdcard.img\" 0x200 hwpart 1".parse::<UbootCommand>().unwrap(),
            UbootCommand::Flash(FlashArgs {
                path: PathBuf::from("sdcard.img"),
                offset: 0x200,
                part: Some(FlashPart::HwPart(1)),
            })
        );
        assert_eq!(
            "run oem_run:mmc dev 0".parse::<UbootCommand>().unwrap(),
            UbootCommand::Run(FastbootCommand::OemRun("mmc dev 0".into()))
        );
        assert_eq!("quit".parse::<UbootCommand>().unwrap(), UbootCommand::Exit);
        assert!(matches!(
            "set target".parse::<UbootCommand>(),
            Err(UbootCmdError::Syntax(_))
        ));
        assert!(matches!(
            "print a b".parse::<UbootCommand>(),
            Err(UbootCmdError::Syntax(_))
        ));
        assert_eq!(
            "frobnicate now".parse::<UbootCommand>(),
            Err(UbootCmdError::UnknownCommand("frobnicate".into()))
        );
        assert!("flash image.bin 4X".parse::<UbootCommand>().is_err());
    }

    #[test]
    fn test_flash_mmc_whole_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir, &[0x42; 3000]);
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        queue_checks(&device, "0x00002000");
        device.queue_reply(b"OKAY");
        for _ in 0..3 {
            queue_section(&device, 0x400, 1);
        }
        let mut session = session(
            &device,
            &[("target", "mmc1"), ("fb-addr", "0x80000000"), ("fb-size", "0x400")],
        );
        session.run_line(&format!("flash {} 0x200", path)).unwrap();

        let oem = oem_commands(&device);
        assert!(oem[0].starts_with("mw.b 0x80000001 "));
        assert_eq!(oem[1], "cmp.b 0x80000000 0x80000001 1");
        assert_eq!(
            oem[2..].to_vec(),
            vec![
                "mmc dev 1",
                "mmc write 0x80000000 0x1 0x2",
                "mmc write 0x80000000 0x3 0x2",
                "mmc write 0x80000000 0x5 0x2",
            ]
        );
        assert_eq!(device.pending_replies(), 0);
    }

    #[test]
    fn test_flash_mmc_gpt_partition() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir, &[0x42; 512]);
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        queue_checks(&device, "0x00002000");
        device.queue_reply(b"OKAY");
        device.queue_reply(b"OKAY");
        device.queue_reply(b"OKAY0x800");
        queue_section(&device, 0x200, 1);
        let mut session = session(&device, &[("target", "mmc0"), ("fb-addr", "0x80000000")]);
        session.run_line(&format!("flash {} 0 rootfs", path)).unwrap();

        let oem = oem_commands(&device);
        assert_eq!(oem[2], "mmc dev 0; part list mmc 0");
        assert_eq!(
            oem[3],
            "gpt setenv mmc 0 rootfs;setenv fastboot.part_start ${gpt_partition_addr}"
        );
        assert_eq!(oem[4], "mmc write 0x80000000 0x800 0x1");
    }

    #[test]
    fn test_flash_mtd_erases_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir, &[0x42; 600]);
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        queue_checks(&device, "0x00002000");
        for reply in ["OKAY", "DATA00000400", "OKAY", "OKAY"] {
            device.queue_reply(reply.as_bytes());
        }
        let mut session = session(
            &device,
            &[
                ("target", "spi-nand0"),
                ("fb-addr", "0x80000000"),
                ("fb-size", "0x400"),
                ("eraseblk-size", "0x200"),
            ],
        );
        session.run_line(&format!("flash {} 0x400", path)).unwrap();
        assert_eq!(
            oem_commands(&device)[2..].to_vec(),
            vec![
                "mtd erase spi-nand0 0x400 0x400",
                "mtd write spi-nand0 0x80000000 0x400 0x400",
            ]
        );
    }

    #[test]
    fn test_sparse_image_writes_data_ranges() {
        let sparse = SparseImage {
            block_size: 512,
            checksum: 0,
            chunks: vec![
                Chunk { blocks: 1, data: ChunkData::Raw(vec![1; 512]) },
                Chunk { blocks: 8, data: ChunkData::DontCare },
                Chunk { blocks: 1, data: ChunkData::Fill([2; 4]) },
            ],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir, &sparse.to_bytes());
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        queue_checks(&device, "0x00002000");
        device.queue_reply(b"OKAY");
        queue_section(&device, 0x200, 1);
        queue_section(&device, 0x200, 1);
        let mut session = session(&device, &[("target", "mmc0"), ("fb-addr", "0x80000000")]);
        session.run_line(&format!("flash {} 0", path)).unwrap();
        assert_eq!(
            oem_commands(&device)[3..].to_vec(),
            vec!["mmc write 0x80000000 0x0 0x1", "mmc write 0x80000000 0x9 0x1"]
        );
    }

    #[test]
    fn test_misaligned_mtd_offset_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir, &[0x42; 16]);
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        queue_checks(&device, "0x00002000");
        let mut session = session(
            &device,
            &[("target", "nand0"), ("fb-addr", "0x80000000"), ("eraseblk-size", "0x20000")],
        );
        let err = session.run_line(&format!("flash {} 0x100", path)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UbootCmdError>(),
            Some(UbootCmdError::Misaligned { value: 0x100, .. })
        ));
    }

    #[test]
    fn test_buffer_cannot_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(&dir, &[0x42; 16]);
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        queue_checks(&device, "0x200");
        let mut session = session(
            &device,
            &[("target", "mmc0"), ("fb-addr", "0x80000000"), ("fb-size", "0x400")],
        );
        let err = session.run_line(&format!("flash {} 0", path)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<UbootCmdError>(),
            Some(&UbootCmdError::BufferGrow {
                default: 0x200,
                requested: 0x400
            })
        );
    }

    #[test]
    fn test_wrong_buffer_address_detected() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        for reply in ["DATA00000001", "OKAY", "OKAY", "FAILbyte at 0x80000000 differs"] {
            device.queue_reply(reply.as_bytes());
        }
        let mut session = session(&device, &[("target", "mmc0"), ("fb-addr", "0x80000000")]);
        let err = session.run_line("flash image.bin 0").unwrap_err();
        assert_eq!(
            err.downcast_ref::<UbootCmdError>(),
            Some(&UbootCmdError::BadBufferAddress(0x8000_0000))
        );
    }

    #[test]
    fn test_gpt_needs_mmc_target() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        device.queue_reply(b"OKAY");
        device.queue_reply(b"OKAY");
        let mut session = session(&device, &[("target", "mmc2")]);
        session.run_line("gpt name=boot,size=64M;name=rootfs,size=-").unwrap();
        assert_eq!(
            oem_commands(&device),
            vec!["gpt write mmc 2 'name=boot,size=64M;name=rootfs,size=-'", "part list mmc 2"]
        );

        session.set_var("target", "nand0");
        assert!(session.run_line("gpt name=boot,size=64M").is_err());
    }

    #[test]
    fn test_interactive_reports_errors_and_exits() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        let mut session = session(&device, &[]);
        let mut input = "set target mmc0\nprint target\n\n# comment\nfrobnicate\nprint nothing\nflash a.img 0\nexit\nprint target\n".as_bytes();
        let mut out = Vec::new();
        session.interactive(&mut input, &mut out).unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("setting 'target' to 'mmc0'\n"));
        assert!(out.contains("\nmmc0\n") || out.contains("> mmc0\n"));
        assert!(out.contains("CLI Error: Invalid command frobnicate"));
        assert!(out.contains("CLI Error: undefined variable nothing"));
        assert!(out.contains("CLI Error: please set the 'fb-addr' environment variable"));
        assert!(out.ends_with("Leaving interactive session...\n"));
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_script_stops_on_failure() {
        let device = MockTransport::new().with_layout(bulk_layout(0xff));
        device.queue_reply(b"OKAY");
        device.queue_reply(b"FAILunknown command");
        let mut session = session(&device, &[]);
        let script = ["run oem_run:mmc dev 0", "run oem_run:bogus", "run oem_run:never"];
        assert!(session.run_script(&script).is_err());
        assert_eq!(oem_commands(&device), vec!["mmc dev 0", "bogus"]);
    }
}
