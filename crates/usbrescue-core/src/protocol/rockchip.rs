//! Rockchip mask ROM code download.
//!
//! The ROM takes code through vendor request 0x0c on endpoint 0, with the
//! destination selected by wIndex: 0x471 loads the DRAM init blob into SRAM,
//! 0x472 loads the usbplug/SPL into DRAM. Data goes in 4096-byte chunks and
//! ends with a big-endian CRC16/CCITT-FALSE over the whole blob.

use thiserror::Error;
use tracing::debug;

use super::dnload_iter;
use crate::events::EventSink;
use crate::image::crc::Crc16;
use crate::transport::{ControlSetup, TransportError, UsbTransport};

pub const CODE_471: u16 = 0x471;
pub const CODE_472: u16 = 0x472;

const REQ_CODE_DOWNLOAD: u8 = 0x0c;
const CHUNK_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum RockchipError {
    #[error("No BULK IN/OUT endpoint pair found in device")]
    NoBulkPair,

    #[error("Invalid code 0x{0:x}, can only be 0x471 or 0x472")]
    InvalidCode(u16),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Split `blob` into the control transfers the ROM expects, CRC included.
///
/// The CRC lands in the last data chunk when it fits. A blob ending on a
/// full chunk gets the CRC as a separate 2-byte transfer, one ending a byte
/// short of a chunk is padded with a zero first, and a chunk that the CRC
/// fills up exactly is followed by a lone zero byte.
pub fn code_chunks(blob: &[u8]) -> Vec<Vec<u8>> {
    let mut crc = Crc16::new();
    let mut out = Vec::with_capacity(blob.len() / CHUNK_SIZE + 2);
    let mut crc_sent = false;

    for chunk in dnload_iter(blob, CHUNK_SIZE) {
        let mut data = chunk.to_vec();
        match chunk.len() {
            CHUNK_SIZE => crc.update(&data),
            n if n == CHUNK_SIZE - 1 => {
                data.push(0x00);
                crc.update(&data);
            }
            n => {
                crc.update(&data);
                data.extend_from_slice(&crc.finish().to_be_bytes());
                crc_sent = true;
                out.push(data);
                if n + 2 == CHUNK_SIZE {
                    out.push(vec![0x00]);
                }
                continue;
            }
        }
        out.push(data);
    }
    if !crc_sent {
        out.push(crc.finish().to_be_bytes().to_vec());
    }
    out
}

pub struct RockchipRom<'a> {
    transport: &'a dyn UsbTransport,
    sink: &'a dyn EventSink,
}

impl<'a> RockchipRom<'a> {
    /// The ROM must expose a bulk pair even though code download only uses
    /// endpoint 0; a device without one is not in mask ROM mode.
    pub fn new(transport: &'a dyn UsbTransport, sink: &'a dyn EventSink) -> Result<Self, RockchipError> {
        transport.layout().bulk_pair().ok_or(RockchipError::NoBulkPair)?;
        Ok(Self { transport, sink })
    }

    pub fn write_blob(&self, blob: &[u8], code: u16) -> Result<(), RockchipError> {
        if code != CODE_471 && code != CODE_472 {
            return Err(RockchipError::InvalidCode(code));
        }
        let total = blob.len() as u64;
        let mut sent = 0u64;
        for chunk in code_chunks(blob) {
            debug!(len = chunk.len(), code = %format!("0x{:x}", code), "Sending code chunk");
            self.transport.control_out(
                ControlSetup::vendor_device(REQ_CODE_DOWNLOAD, 0, code),
                &chunk,
            )?;
            sent = (sent + chunk.len() as u64).min(total);
            self.sink.progress("rockchip code", sent, total);
        }
        Ok(())
    }
}
