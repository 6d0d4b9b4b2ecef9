//! Fastboot host driver, as spoken by U-Boot's fastboot gadget.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument};

use super::dnload_iter;
use crate::events::EventSink;
use crate::transport::{BulkPair, DeviceLayout, TransportError, UsbSpeed, UsbTransport};

const RESPONSE_LEN: usize = 256;

/// Interface triple of the fastboot function.
const FASTBOOT_CLASS: (u8, u8, u8) = (0xff, 0x42, 0x03);

/// True when the device exposes a fastboot interface.
pub fn is_fastboot(layout: &DeviceLayout) -> bool {
    layout
        .alt_settings
        .iter()
        .any(|alt| (alt.class, alt.subclass, alt.protocol) == FASTBOOT_CLASS)
}

#[derive(Error, Debug)]
pub enum FastbootError {
    #[error("No bulk IN/OUT endpoint pair found in device")]
    NoBulkPair,

    #[error("Packet of {len} bytes exceeds the {max}-byte limit")]
    PacketTooLong { len: usize, max: usize },

    #[error("Fastboot fail with message: {0}")]
    Fail(String),

    #[error("Malformed DATA reply: {0}")]
    MalformedData(String),

    #[error("Device accepted {accepted} bytes, {declared} were declared")]
    DataLengthMismatch { declared: usize, accepted: usize },

    #[error("Expected DATA reply to download command")]
    NoDataPhase,

    #[error("Timeout while completing fastboot transaction")]
    Timeout,

    #[error("Unknown fastboot command '{0}'")]
    UnknownCommand(String),

    #[error("Fastboot command '{0}' requires an argument")]
    MissingArgument(String),

    #[error("Cannot read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Final reply to a fastboot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `OKAY` with whatever followed the prefix.
    Okay(Vec<u8>),
    /// `DATA`: the device is ready to receive this many bytes.
    Data(usize),
}

/// Typed form of the `verb[:arg]` command strings accepted on the command
/// line and in flashing scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastbootCommand {
    Getvar(String),
    Download(PathBuf),
    Erase(String),
    Flash(String),
    Boot,
    Continue,
    Reboot,
    RebootBootloader,
    Powerdown,
    UCmd(String),
    ACmd(String),
    OemRun(String),
    OemFormat,
    OemPartconf(String),
    OemBootbus(String),
}

impl FromStr for FastbootCommand {
    type Err = FastbootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (verb, arg) = match s.split_once(':') {
            Some((verb, arg)) => (verb, Some(arg)),
            None => (s, None),
        };
        let need = |arg: Option<&str>| {
            arg.filter(|a| !a.is_empty())
                .map(str::to_string)
                .ok_or_else(|| FastbootError::MissingArgument(verb.to_string()))
        };
        Ok(match verb {
            "getvar" => FastbootCommand::Getvar(need(arg)?),
            "download" => FastbootCommand::Download(PathBuf::from(need(arg)?)),
            "erase" => FastbootCommand::Erase(need(arg)?),
            "flash" => FastbootCommand::Flash(need(arg)?),
            "boot" => FastbootCommand::Boot,
            "continue" => FastbootCommand::Continue,
            "reboot" => FastbootCommand::Reboot,
            "reboot-bootloader" => FastbootCommand::RebootBootloader,
            "powerdown" => FastbootCommand::Powerdown,
            "UCmd" | "ucmd" => FastbootCommand::UCmd(need(arg)?),
            "ACmd" | "acmd" => FastbootCommand::ACmd(need(arg)?),
            "oem_run" | "oem run" => FastbootCommand::OemRun(need(arg)?),
            "oem_format" | "oem format" => FastbootCommand::OemFormat,
            "oem_partconf" | "oem partconf" => FastbootCommand::OemPartconf(need(arg)?),
            "oem_bootbus" | "oem bootbus" => FastbootCommand::OemBootbus(need(arg)?),
            _ => return Err(FastbootError::UnknownCommand(s.to_string())),
        })
    }
}

impl fmt::Display for FastbootCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastbootCommand::Getvar(v) => write!(f, "getvar:{}", v),
            FastbootCommand::Download(p) => write!(f, "download:{}", p.display()),
            FastbootCommand::Erase(p) => write!(f, "erase:{}", p),
            FastbootCommand::Flash(p) => write!(f, "flash:{}", p),
            FastbootCommand::Boot => write!(f, "boot"),
            FastbootCommand::Continue => write!(f, "continue"),
            FastbootCommand::Reboot => write!(f, "reboot"),
            FastbootCommand::RebootBootloader => write!(f, "reboot-bootloader"),
            FastbootCommand::Powerdown => write!(f, "powerdown"),
            FastbootCommand::UCmd(c) => write!(f, "UCmd:{}", c),
            FastbootCommand::ACmd(c) => write!(f, "ACmd:{}", c),
            FastbootCommand::OemRun(c) => write!(f, "oem run:{}", c),
            FastbootCommand::OemFormat => write!(f, "oem format"),
            FastbootCommand::OemPartconf(a) => write!(f, "oem partconf:{}", a),
            FastbootCommand::OemBootbus(a) => write!(f, "oem bootbus:{}", a),
        }
    }
}

/// Fastboot session over the first bulk endpoint pair of the device.
pub struct Fastboot<'a> {
    transport: &'a dyn UsbTransport,
    sink: &'a dyn EventSink,
    pair: BulkPair,
    max_size: usize,
    timeout: Duration,
}

impl<'a> Fastboot<'a> {
    pub fn new(
        transport: &'a dyn UsbTransport,
        sink: &'a dyn EventSink,
        timeout: Duration,
    ) -> Result<Self, FastbootError> {
        let pair = transport
            .layout()
            .bulk_pair()
            .ok_or(FastbootError::NoBulkPair)?;
        let max_size = match transport.speed() {
            UsbSpeed::High => 512,
            UsbSpeed::Super | UsbSpeed::SuperPlus => 1024,
            UsbSpeed::Low | UsbSpeed::Full => 64,
        };
        debug!(ep_in = pair.ep_in, ep_out = pair.ep_out, max_size, "Fastboot endpoints");
        Ok(Self {
            transport,
            sink,
            pair,
            max_size,
            timeout,
        })
    }

    /// Maximum command packet and data chunk size for the bus speed.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Read replies until a final one arrives. `INFO` and `TEXT` lines are
    /// forwarded to the sink.
    fn response(&self, accept_data: bool) -> Result<Response, FastbootError> {
        let deadline = Instant::now() + self.timeout * 10;
        while Instant::now() < deadline {
            let ret = self
                .transport
                .read_timeout(self.pair.ep_in, RESPONSE_LEN, self.timeout)?;
            let (prefix, payload) = ret.split_at(ret.len().min(4));
            let text = String::from_utf8_lossy(payload);
            match prefix {
                b"INFO" | b"TEXT" => self.sink.info(&format!("(bootloader) {}", text)),
                b"FAIL" => return Err(FastbootError::Fail(text.into_owned())),
                b"OKAY" => {
                    info!("fastboot OKAY");
                    return Ok(Response::Okay(payload.to_vec()));
                }
                b"DATA" if accept_data => {
                    let digits = text.get(..8).unwrap_or(text.as_ref());
                    let length = usize::from_str_radix(digits, 16)
                        .map_err(|_| FastbootError::MalformedData(text.to_string()))?;
                    info!(length, "fastboot DATA");
                    return Ok(Response::Data(length));
                }
                _ => debug!(reply = ?ret, "Ignoring fastboot reply"),
            }
        }
        Err(FastbootError::Timeout)
    }

    /// Send one command packet and wait for its final reply.
    #[instrument(skip(self, packet), fields(packet = %String::from_utf8_lossy(packet)), level = "debug")]
    pub fn cmd(&self, packet: &[u8]) -> Result<Response, FastbootError> {
        if packet.len() > self.max_size {
            return Err(FastbootError::PacketTooLong {
                len: packet.len(),
                max: self.max_size,
            });
        }
        self.transport.write(self.pair.ep_out, packet)?;
        self.response(true)
    }

    fn simple(&self, packet: String) -> Result<Vec<u8>, FastbootError> {
        match self.cmd(packet.as_bytes())? {
            Response::Okay(payload) => Ok(payload),
            Response::Data(_) => Err(FastbootError::MalformedData(packet)),
        }
    }

    pub fn getvar(&self, var: &str) -> Result<String, FastbootError> {
        let value = self.simple(format!("getvar:{}", var))?;
        let value = String::from_utf8_lossy(&value).into_owned();
        self.sink.info(&format!("(bootloader) {} value {}", var, value));
        Ok(value)
    }

    /// Upload an in-memory blob to the device download buffer.
    pub fn send(&self, blob: &[u8]) -> Result<(), FastbootError> {
        let declared = blob.len();
        match self.cmd(format!("download:{:08x}", declared).as_bytes())? {
            Response::Data(accepted) if accepted == declared => {}
            Response::Data(accepted) => {
                return Err(FastbootError::DataLengthMismatch { declared, accepted });
            }
            Response::Okay(_) => return Err(FastbootError::NoDataPhase),
        }
        let mut sent = 0u64;
        for chunk in dnload_iter(blob, self.max_size) {
            self.transport.write(self.pair.ep_out, chunk)?;
            sent += chunk.len() as u64;
            self.sink.progress("fastboot download", sent, declared as u64);
        }
        self.response(false)?;
        Ok(())
    }

    pub fn download(&self, path: &Path) -> Result<(), FastbootError> {
        let blob = std::fs::read(path).map_err(|source| FastbootError::File {
            path: path.to_path_buf(),
            source,
        })?;
        self.send(&blob)
    }

    /// Upload `length` bytes of `path` starting at `offset`.
    pub fn download_section(
        &self,
        path: &Path,
        offset: u64,
        length: usize,
    ) -> Result<(), FastbootError> {
        let file_err = |source| FastbootError::File {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(file_err)?;
        file.seek(SeekFrom::Start(offset)).map_err(file_err)?;
        let mut blob = vec![0u8; length];
        file.read_exact(&mut blob).map_err(file_err)?;
        self.send(&blob)
    }

    pub fn erase(&self, part: &str) -> Result<(), FastbootError> {
        self.simple(format!("erase:{}", part)).map(drop)
    }

    pub fn flash(&self, part: &str) -> Result<(), FastbootError> {
        self.simple(format!("flash:{}", part)).map(drop)
    }

    pub fn boot(&self) -> Result<(), FastbootError> {
        self.simple("boot".into()).map(drop)
    }

    pub fn fb_continue(&self) -> Result<(), FastbootError> {
        self.simple("continue".into()).map(drop)
    }

    pub fn reboot(&self) -> Result<(), FastbootError> {
        self.simple("reboot".into()).map(drop)
    }

    pub fn reboot_bootloader(&self) -> Result<(), FastbootError> {
        self.simple("reboot-bootloader".into()).map(drop)
    }

    pub fn powerdown(&self) -> Result<(), FastbootError> {
        self.simple("powerdown".into()).map(drop)
    }

    /// Run a U-Boot command and wait for it to complete.
    pub fn ucmd(&self, cmd: &str) -> Result<(), FastbootError> {
        self.simple(format!("UCmd:{}", cmd)).map(drop)
    }

    /// Run a U-Boot command without waiting for it to complete.
    pub fn acmd(&self, cmd: &str) -> Result<(), FastbootError> {
        self.simple(format!("ACmd:{}", cmd)).map(drop)
    }

    pub fn oem_run(&self, cmd: &str) -> Result<(), FastbootError> {
        self.simple(format!("oem run:{}", cmd)).map(drop)
    }

    /// `gpt write mmc <dev> $partitions` on the preconfigured device.
    pub fn oem_format(&self) -> Result<(), FastbootError> {
        self.simple("oem format".into()).map(drop)
    }

    pub fn oem_partconf(&self, arg: &str) -> Result<(), FastbootError> {
        self.simple(format!("oem partconf:{}", arg)).map(drop)
    }

    pub fn oem_bootbus(&self, arg: &str) -> Result<(), FastbootError> {
        self.simple(format!("oem bootbus:{}", arg)).map(drop)
    }

    pub fn run(&self, command: &FastbootCommand) -> Result<(), FastbootError> {
        match command {
            FastbootCommand::Getvar(var) => self.getvar(var).map(drop),
            FastbootCommand::Download(path) => self.download(path),
            FastbootCommand::Erase(part) => self.erase(part),
            FastbootCommand::Flash(part) => self.flash(part),
            FastbootCommand::Boot => self.boot(),
            FastbootCommand::Continue => self.fb_continue(),
            FastbootCommand::Reboot => self.reboot(),
            FastbootCommand::RebootBootloader => self.reboot_bootloader(),
            FastbootCommand::Powerdown => self.powerdown(),
            FastbootCommand::UCmd(cmd) => self.ucmd(cmd),
            FastbootCommand::ACmd(cmd) => self.acmd(cmd),
            FastbootCommand::OemRun(cmd) => self.oem_run(cmd),
            FastbootCommand::OemFormat => self.oem_format(),
            FastbootCommand::OemPartconf(arg) => self.oem_partconf(arg),
            FastbootCommand::OemBootbus(arg) => self.oem_bootbus(arg),
        }
    }
}
