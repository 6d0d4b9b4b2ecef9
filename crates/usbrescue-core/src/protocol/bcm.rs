//! Broadcom (Raspberry Pi) USB boot.
//!
//! The ROM takes a single file, announced by its size. The bootcode it
//! starts then acts as a file client: it asks for file sizes and contents by
//! name until it signals it is done.

use thiserror::Error;
use tracing::{debug, warn};

use super::dnload_iter;
use crate::events::EventSink;
use crate::transport::{ControlSetup, EndpointKind, TransportError, UsbTransport};

const BULK_CHUNK: usize = 16384;
const SIZE_HEADER_LEN: usize = 24;
const COMMAND_LEN: u16 = 260;
const DEFAULT_ENDPOINT: u8 = 0x01;

#[derive(Error, Debug)]
pub enum BcmError {
    #[error("ROM code rejected the file with status {0}")]
    RomStatus(u32),

    #[error("Unsupported bootcode command {0}")]
    UnknownCommand(u32),

    #[error("Short bootcode command ({0} bytes)")]
    ShortCommand(usize),

    #[error("File name received from bootcode is not null terminated")]
    UnterminatedName,

    #[error("File of {0} bytes does not fit the 32-bit size field")]
    TooLarge(usize),

    #[error("BULK OUT sent only {sent}/{len} bytes")]
    ShortWrite { sent: usize, len: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Requests issued by bootcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootcodeCommand {
    GetFileSize,
    GetFile,
    Done,
}

impl TryFrom<u32> for BootcodeCommand {
    type Error = BcmError;

    fn try_from(value: u32) -> Result<Self, BcmError> {
        match value {
            0 => Ok(Self::GetFileSize),
            1 => Ok(Self::GetFile),
            2 => Ok(Self::Done),
            other => Err(BcmError::UnknownCommand(other)),
        }
    }
}

fn bulk_out(transport: &dyn UsbTransport) -> u8 {
    transport
        .layout()
        .alt_settings
        .iter()
        .flat_map(|alt| alt.endpoints.iter())
        .find(|ep| ep.kind == EndpointKind::Bulk && !ep.is_in())
        .map(|ep| ep.address)
        .unwrap_or(DEFAULT_ENDPOINT)
}

fn size_setup(size: usize) -> Result<ControlSetup, BcmError> {
    let size = u32::try_from(size).map_err(|_| BcmError::TooLarge(size))?;
    Ok(ControlSetup::vendor_device(
        0,
        (size & 0xffff) as u16,
        (size >> 16) as u16,
    ))
}

/// Announce `blob`'s size through endpoint 0, then stream it over bulk.
/// An empty blob is skipped without any USB exchange.
fn send_blob(transport: &dyn UsbTransport, ep: u8, blob: &[u8]) -> Result<(), BcmError> {
    if blob.is_empty() {
        warn!("Trying to send a blob of len 0");
        return Ok(());
    }
    debug!(len = blob.len(), "Sending blob");
    transport.control_out(size_setup(blob.len())?, &[])?;
    for chunk in dnload_iter(blob, BULK_CHUNK) {
        let sent = transport.write(ep, chunk)?;
        if sent != chunk.len() {
            return Err(BcmError::ShortWrite {
                sent,
                len: chunk.len(),
            });
        }
    }
    Ok(())
}

/// Boot ROM side: sends the bootcode binary.
pub struct BcmRom<'a> {
    transport: &'a dyn UsbTransport,
    ep_out: u8,
}

impl<'a> BcmRom<'a> {
    pub fn new(transport: &'a dyn UsbTransport) -> Self {
        Self {
            transport,
            ep_out: bulk_out(transport),
        }
    }

    /// Send `file` behind its 24-byte size header. The ROM needs time to
    /// process it before `status` answers.
    pub fn send_file(&self, file: &[u8]) -> Result<(), BcmError> {
        let mut header = (file.len() as u64).to_le_bytes().to_vec();
        header.resize(SIZE_HEADER_LEN, 0);
        send_blob(self.transport, self.ep_out, &header)?;
        send_blob(self.transport, self.ep_out, file)
    }

    /// Transfer status reported by the ROM; non-zero is a failure.
    pub fn status(&self) -> Result<(), BcmError> {
        let reply = self
            .transport
            .control_in(ControlSetup::vendor_device(0, 0x0004, 0), 4)?;
        let mut word = [0u8; 4];
        let n = reply.len().min(4);
        word[..n].copy_from_slice(&reply[..n]);
        let status = u32::from_le_bytes(word);
        debug!(status, "ROM code answered");
        if status != 0 {
            return Err(BcmError::RomStatus(status));
        }
        Ok(())
    }
}

/// Bootcode side: answers file requests.
pub struct BootcodeServer<'a> {
    transport: &'a dyn UsbTransport,
    sink: &'a dyn EventSink,
    ep_out: u8,
}

impl<'a> BootcodeServer<'a> {
    pub fn new(transport: &'a dyn UsbTransport, sink: &'a dyn EventSink) -> Self {
        Self {
            transport,
            sink,
            ep_out: bulk_out(transport),
        }
    }

    /// Next request as a command and the requested file name.
    pub fn next_command(&self) -> Result<(BootcodeCommand, String), BcmError> {
        let reply = self
            .transport
            .control_in(ControlSetup::vendor_device(0, 0x0104, 0), COMMAND_LEN)?;
        if reply.len() < 4 {
            return Err(BcmError::ShortCommand(reply.len()));
        }
        let command = BootcodeCommand::try_from(u32::from_le_bytes([
            reply[0], reply[1], reply[2], reply[3],
        ]))?;
        let name = &reply[4..];
        let end = name
            .iter()
            .position(|&b| b == 0)
            .ok_or(BcmError::UnterminatedName)?;
        Ok((command, String::from_utf8_lossy(&name[..end]).into_owned()))
    }

    pub fn send_file_size(&self, file: &[u8]) -> Result<(), BcmError> {
        self.transport.control_out(size_setup(file.len())?, &[])?;
        Ok(())
    }

    pub fn send_file(&self, name: &str, file: &[u8]) -> Result<(), BcmError> {
        send_blob(self.transport, self.ep_out, file)?;
        self.sink.info(&format!("Served requested file '{}'", name));
        Ok(())
    }
}
