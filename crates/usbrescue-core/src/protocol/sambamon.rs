//! Microchip SAM-BA monitor, the ROM command interpreter of SAMA5 parts.
//!
//! Commands are ASCII, terminated by `#`, with hexadecimal arguments. The
//! monitor is switched to binary mode on connection so that reads return
//! raw little-endian words.

use thiserror::Error;
use tracing::debug;

use super::cdc::{CdcAcm, CdcError};
use super::dnload_iter;
use super::memory::MemoryOps;
use crate::events::EventSink;

/// Largest chunk sent per `S` command.
const PAYLOAD_SIZE: usize = 0x4000;

#[derive(Error, Debug)]
pub enum SambaError {
    #[error("Short read of 0x{addr:08x}: got {got} bytes")]
    ShortRead { addr: u32, got: usize },

    #[error("Monitor accepted {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("Range 0x{offset:x}+0x{size:x} exceeds blob of 0x{len:x} bytes")]
    OutOfRange { offset: usize, size: usize, len: usize },

    #[error(transparent)]
    Cdc(#[from] CdcError),
}

pub struct SambaMonitor<'a> {
    port: CdcAcm<'a>,
    sink: &'a dyn EventSink,
}

impl<'a> SambaMonitor<'a> {
    /// Put the monitor in binary mode.
    pub fn new(port: CdcAcm<'a>, sink: &'a dyn EventSink) -> Result<Self, SambaError> {
        debug!("Sending sambamon command N#");
        port.write(b"N#")?;
        port.read_until(b'\r')?;
        Ok(Self { port, sink })
    }

    fn command(&self, cmd: &str) -> Result<(), SambaError> {
        debug!(cmd, "sambamon");
        let sent = self.port.write(cmd.as_bytes())?;
        if sent != cmd.len() {
            return Err(SambaError::ShortWrite {
                sent,
                expected: cmd.len(),
            });
        }
        Ok(())
    }

    pub fn version(&self) -> Result<String, SambaError> {
        self.command("V#")?;
        let reply = self.port.read_until(b'\r')?;
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    pub fn into_port(self) -> CdcAcm<'a> {
        self.port
    }
}

impl MemoryOps for SambaMonitor<'_> {
    type Error = SambaError;

    fn read32(&mut self, addr: u32) -> Result<u32, SambaError> {
        self.command(&format!("w{:x},#", addr))?;
        let data = self.port.read(4)?;
        match data.as_slice() {
            [a, b, c, d] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => Err(SambaError::ShortRead {
                addr,
                got: data.len(),
            }),
        }
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<(), SambaError> {
        self.command(&format!("W{:x},{:x}#", addr, value))
    }

    fn write_blob(&mut self, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), SambaError> {
        let data = offset
            .checked_add(size)
            .and_then(|end| blob.get(offset..end))
            .ok_or(SambaError::OutOfRange {
                offset,
                size,
                len: blob.len(),
            })?;
        let mut sent = 0usize;
        for chunk in dnload_iter(data, PAYLOAD_SIZE) {
            let dest = addr.wrapping_add(sent as u32);
            self.command(&format!("S{:x},{:x}#", dest, chunk.len()))?;
            let n = self.port.write(chunk)?;
            if n != chunk.len() {
                return Err(SambaError::ShortWrite {
                    sent: n,
                    expected: chunk.len(),
                });
            }
            sent += n;
            self.sink.progress("sam-ba write", sent as u64, size as u64);
        }
        Ok(())
    }

    fn jump(&mut self, addr: u32) -> Result<(), SambaError> {
        self.command(&format!("G{:x}#", addr))
    }
}
