//! Amlogic USB boot protocol.
//!
//! The ROM and BL2 accept vendor control requests on endpoint 0 and bulk
//! data on the first bulk pair. Loading U-Boot through BL2 is pull based:
//! BL2 asks for FIP ranges with AMLC requests and the host answers each one
//! followed by an AMLS block carrying an additive checksum.

use std::io::Cursor;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::dnload_iter;
use crate::events::EventSink;
use crate::transport::{BulkPair, ControlSetup, TransportError, UsbTransport};

const REQ_WRITE_MEM: u8 = 0x01;
const REQ_RUN_IN_ADDR: u8 = 0x05;
const REQ_WR_LARGE_MEM: u8 = 0x11;
const REQ_IDENTIFY_HOST: u8 = 0x20;
const REQ_GET_AMLC: u8 = 0x50;
const REQ_WRITE_AMLC: u8 = 0x60;

const FLAG_KEEP_POWER_ON: u32 = 0x10;
const SIMPLE_WRITE_MAX: usize = 64;
/// Blocks per WR_LARGE_MEM request.
const MAX_LARGE_BLOCK_COUNT: usize = 65535;

const AMLC_AMLS_BLOCK_LENGTH: usize = 0x200;
const AMLC_MAX_BLOCK_LENGTH: usize = 0x4000;
const AMLC_MAX_TRANSFER_LENGTH: usize = 0x10000;

const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// `stage_minor` of the ROM code.
pub const STAGE_MINOR_IPL: u8 = 0;
/// `stage_minor` once BL2 runs.
pub const STAGE_MINOR_SPL: u8 = 8;
/// `stage_minor` once U-Boot proper runs.
pub const STAGE_MINOR_TPL: u8 = 16;

#[derive(Error, Debug)]
pub enum AmlogicError {
    #[error("Amlogic device has no bulk endpoint pair")]
    NoBulkPair,

    #[error("Short identify response ({0} bytes)")]
    ShortIdentify(usize),

    #[error("Simple write of {0} bytes exceeds 64 bytes")]
    SimpleWriteTooLong(usize),

    #[error("Data length {len} is not a multiple of block length {block_length}")]
    Unaligned { len: usize, block_length: usize },

    #[error("Invalid AMLC request {0:02x?}")]
    InvalidAmlc(Vec<u8>),

    #[error("BL2 requested AMLC block offset={offset} length={length} outside firmware of {size} bytes")]
    AmlcOutOfRange { offset: u32, length: u32, size: usize },

    #[error("Invalid ACK {0:02x?} after AMLC transfer")]
    BadAck(Vec<u8>),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Protocol and stage identification returned by IDENTIFY_HOST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomId {
    pub version_major: u8,
    pub version_minor: u8,
    pub stage_major: u8,
    pub stage_minor: u8,
    pub need_password: bool,
    pub password_ok: bool,
}

impl RomId {
    pub fn parse(data: &[u8]) -> Result<Self, AmlogicError> {
        match data {
            [vmaj, vmin, smaj, smin, need, ok, ..] => Ok(Self {
                version_major: *vmaj,
                version_minor: *vmin,
                stage_major: *smaj,
                stage_minor: *smin,
                need_password: *need != 0,
                password_ok: *ok != 0,
            }),
            _ => Err(AmlogicError::ShortIdentify(data.len())),
        }
    }

    pub fn in_bl2(&self) -> bool {
        self.stage_minor == STAGE_MINOR_SPL
    }
}

/// Unsigned 32-bit additive checksum over little-endian words; a trailing
/// partial word is zero padded.
pub fn amls_checksum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |sum, word| {
        let mut w = [0u8; 4];
        w[..word.len()].copy_from_slice(word);
        sum.wrapping_add(u32::from_le_bytes(w))
    })
}

pub struct Amlogic<'a> {
    transport: &'a dyn UsbTransport,
    sink: &'a dyn EventSink,
    pair: BulkPair,
}

impl<'a> Amlogic<'a> {
    pub fn new(transport: &'a dyn UsbTransport, sink: &'a dyn EventSink) -> Result<Self, AmlogicError> {
        let pair = transport.layout().bulk_pair().ok_or(AmlogicError::NoBulkPair)?;
        Ok(Self {
            transport,
            sink,
            pair,
        })
    }

    fn vendor_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<(), AmlogicError> {
        self.transport
            .control_out(ControlSetup::vendor_device(request, value, index), data)?;
        Ok(())
    }

    fn bulk_write(&self, data: &[u8]) -> Result<(), AmlogicError> {
        self.transport.write(self.pair.ep_out, data)?;
        Ok(())
    }

    fn bulk_read(&self, len: usize) -> Result<Vec<u8>, AmlogicError> {
        Ok(self
            .transport
            .read_timeout(self.pair.ep_in, len, TRANSFER_TIMEOUT)?)
    }

    pub fn identify(&self) -> Result<RomId, AmlogicError> {
        let data = self
            .transport
            .control_in(ControlSetup::vendor_device(REQ_IDENTIFY_HOST, 0, 0), 8)?;
        let id = RomId::parse(&data)?;
        debug!(
            rom = %format!("{}.{}", id.version_major, id.version_minor),
            stage = %format!("{}.{}", id.stage_major, id.stage_minor),
            need_password = id.need_password,
            password_ok = id.password_ok,
            "Amlogic ROM identified"
        );
        Ok(id)
    }

    /// Write at most 64 bytes through a single control transfer.
    pub fn write_simple(&self, addr: u32, data: &[u8]) -> Result<(), AmlogicError> {
        if data.len() > SIMPLE_WRITE_MAX {
            return Err(AmlogicError::SimpleWriteTooLong(data.len()));
        }
        self.vendor_out(REQ_WRITE_MEM, (addr >> 16) as u16, (addr & 0xffff) as u16, data)
    }

    pub fn write_blob_simple(&self, addr: u32, blob: &[u8]) -> Result<(), AmlogicError> {
        let mut offset = 0u32;
        for chunk in dnload_iter(blob, SIMPLE_WRITE_MAX) {
            self.write_simple(addr.wrapping_add(offset), chunk)?;
            offset += chunk.len() as u32;
        }
        Ok(())
    }

    /// Write `data` at `addr` in `block_length` bulk packets. With
    /// `append_zeros` the data is padded to a whole number of blocks.
    #[instrument(skip(self, data, addr), fields(addr = %format!("0x{:08x}", addr)), level = "debug")]
    pub fn write_large(
        &self,
        addr: u32,
        data: &[u8],
        block_length: usize,
        append_zeros: bool,
    ) -> Result<(), AmlogicError> {
        let block_length = block_length.max(1);
        let mut padded;
        let mut data = data;
        if data.len() % block_length != 0 {
            if !append_zeros {
                return Err(AmlogicError::Unaligned {
                    len: data.len(),
                    block_length,
                });
            }
            padded = data.to_vec();
            padded.resize(data.len().div_ceil(block_length) * block_length, 0);
            data = &padded;
        }

        let total = data.len() as u64;
        let mut offset = 0usize;
        for request in dnload_iter(data, MAX_LARGE_BLOCK_COUNT * block_length) {
            let block_count = request.len().div_ceil(block_length);
            let mut control = Vec::with_capacity(16);
            control.extend_from_slice(&addr.wrapping_add(offset as u32).to_le_bytes());
            control.extend_from_slice(&(request.len() as u32).to_le_bytes());
            control.extend_from_slice(&[0u8; 8]);
            self.vendor_out(REQ_WR_LARGE_MEM, block_length as u16, block_count as u16, &control)?;

            for chunk in dnload_iter(request, block_length) {
                self.bulk_write(chunk)?;
                offset += chunk.len();
                self.sink.progress("amlogic write", offset as u64, total);
            }
        }
        Ok(())
    }

    /// Start executing at `addr`.
    pub fn run(&self, addr: u32, keep_power: bool) -> Result<(), AmlogicError> {
        let word = addr | if keep_power { FLAG_KEEP_POWER_ON } else { 0 };
        debug!(addr = %format!("0x{:08x}", addr), "run");
        self.vendor_out(
            REQ_RUN_IN_ADDR,
            (addr >> 16) as u16,
            (addr & 0xffff) as u16,
            &word.to_le_bytes(),
        )
    }

    /// Fetch and acknowledge the next AMLC request as `(length, offset)`.
    pub fn next_amlc_block(&self) -> Result<(u32, u32), AmlogicError> {
        self.vendor_out(REQ_GET_AMLC, AMLC_AMLS_BLOCK_LENGTH as u16, 0, &[])?;
        let request = self.bulk_read(AMLC_AMLS_BLOCK_LENGTH)?;
        if request.len() < 16 || !request.starts_with(b"AMLC") {
            return Err(AmlogicError::InvalidAmlc(request));
        }
        let mut cursor = Cursor::new(&request[8..16]);
        let length = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| AmlogicError::InvalidAmlc(request.clone()))?;
        let offset = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| AmlogicError::InvalidAmlc(request.clone()))?;

        let mut ack = b"OKAY".to_vec();
        ack.extend_from_slice(&[0u8; 12]);
        self.bulk_write(&ack)?;
        Ok((length, offset))
    }

    fn write_amlc_sub_blocks(&self, offset: usize, data: &[u8]) -> Result<(), AmlogicError> {
        let value = (offset / AMLC_AMLS_BLOCK_LENGTH) as u16;
        let index = data.len().saturating_sub(1) as u16;
        self.vendor_out(REQ_WRITE_AMLC, value, index, &[])?;
        for chunk in dnload_iter(data, AMLC_MAX_BLOCK_LENGTH) {
            self.bulk_write(chunk)?;
        }
        let ack = self.bulk_read(16)?;
        if !ack.starts_with(b"OKAY") {
            return Err(AmlogicError::BadAck(ack));
        }
        Ok(())
    }

    /// Answer AMLC request `seq` with `data`, then send its AMLS block.
    pub fn write_amlc_block(&self, seq: u8, amlc_offset: u32, data: &[u8]) -> Result<(), AmlogicError> {
        let mut offset = 0usize;
        for chunk in dnload_iter(data, AMLC_MAX_TRANSFER_LENGTH) {
            self.write_amlc_sub_blocks(offset, chunk)?;
            offset += chunk.len();
        }

        let checksum = amls_checksum(data);
        debug!(seq, checksum = %format!("0x{:08x}", checksum), "AMLS");
        let mut amls = Vec::with_capacity(AMLC_AMLS_BLOCK_LENGTH);
        amls.extend_from_slice(b"AMLS");
        amls.extend_from_slice(&[seq, 0, 0, 0]);
        amls.extend_from_slice(&checksum.to_le_bytes());
        amls.extend_from_slice(&[0u8; 4]);
        let tail_end = data.len().min(AMLC_AMLS_BLOCK_LENGTH);
        if let Some(tail) = data.get(16..tail_end) {
            amls.extend_from_slice(tail);
        }
        self.write_amlc_sub_blocks(amlc_offset as usize, &amls)
    }

    /// Serve BL2's AMLC requests from `fip` until it repeats a request.
    pub fn serve_fip(&self, fip: &[u8]) -> Result<(), AmlogicError> {
        let mut prev = None;
        let mut seq = 0u8;
        let mut request = self.next_amlc_block()?;
        while prev != Some(request) {
            let (length, offset) = request;
            debug!(seq, offset, length, "AMLC request");
            let range = (offset as usize)
                .checked_add(length as usize)
                .filter(|&end| offset > 0 && length > 0 && end <= fip.len())
                .map(|end| &fip[offset as usize..end])
                .ok_or(AmlogicError::AmlcOutOfRange {
                    offset,
                    length,
                    size: fip.len(),
                })?;
            self.write_amlc_block(seq, offset, range)?;
            self.sink.progress("amlogic fip", (offset + length) as u64, fip.len() as u64);

            prev = Some(request);
            seq = seq.wrapping_add(1);
            request = self.next_amlc_block()?;
        }
        info!(blocks = seq, "U-Boot FIP transferred");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::transport::{AltSetting, DeviceLayout, EndpointInfo, EndpointKind, MockTransport};

    fn amlogic_device() -> MockTransport {
        let ep = |address| EndpointInfo {
            address,
            kind: EndpointKind::Bulk,
            max_packet_size: 512,
        };
        MockTransport::new().with_layout(DeviceLayout {
            configuration: 1,
            alt_settings: vec![AltSetting {
                interface: 0,
                class: 0xff,
                endpoints: vec![ep(0x81), ep(0x02)],
                ..Default::default()
            }],
        })
    }

    fn amlc(length: u32, offset: u32) -> Vec<u8> {
        let mut r = b"AMLC".to_vec();
        r.extend_from_slice(&[0u8; 4]);
        r.extend_from_slice(&length.to_le_bytes());
        r.extend_from_slice(&offset.to_le_bytes());
        r.resize(AMLC_AMLS_BLOCK_LENGTH, 0);
        r
    }

    #[test]
    fn test_identify() {
        let mock = amlogic_device();
        mock.queue_reply(&[0, 9, 0, 8, 0, 0, 0, 0]);
        let sink = NullSink;
        let aml = Amlogic::new(&mock, &sink).unwrap();
        let id = aml.identify().unwrap();
        assert!(id.in_bl2());
        assert_eq!(id.version_minor, 9);
    }

    #[test]
    fn test_run_sets_keep_power() {
        let mock = amlogic_device();
        let sink = NullSink;
        let aml = Amlogic::new(&mock, &sink).unwrap();
        aml.run(0xfffa_0000, true).unwrap();
        assert_eq!(
            mock.control_outs()[0],
            (REQ_RUN_IN_ADDR, 0xfffa, 0x0000, 0xfffa_0010u32.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn test_write_large_pads_and_declares_blocks() {
        let mock = amlogic_device();
        let sink = NullSink;
        let aml = Amlogic::new(&mock, &sink).unwrap();
        aml.write_large(0x0200_c000, &[0xab; 100], 64, true).unwrap();

        let (req, value, index, control) = mock.control_outs().remove(0);
        assert_eq!((req, value, index), (REQ_WR_LARGE_MEM, 64, 2));
        assert_eq!(&control[4..8], &128u32.to_le_bytes());
        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(&writes[1][36..], &[0u8; 28]);

        assert!(matches!(
            aml.write_large(0, &[0; 100], 64, false),
            Err(AmlogicError::Unaligned { .. })
        ));
    }

    #[test]
    fn test_amls_checksum() {
        assert_eq!(amls_checksum(&[1, 0, 0, 0, 2, 0, 0, 0]), 3);
        assert_eq!(amls_checksum(&[0xff, 0xff, 0xff, 0xff, 2]), 1);
    }

    #[test]
    fn test_serve_fip_until_repeat() {
        let mock = amlogic_device();
        mock.queue_reply(&amlc(0x20, 0x200));
        mock.queue_reply(b"OKAY");
        mock.queue_reply(b"OKAY");
        mock.queue_reply(&amlc(0x20, 0x200));

        let fip: Vec<u8> = (0..0x400u32).map(|i| i as u8).collect();
        let sink = NullSink;
        let aml = Amlogic::new(&mock, &sink).unwrap();
        aml.serve_fip(&fip).unwrap();

        let writes = mock.writes();
        // ack, data, AMLS, ack
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[1], fip[0x200..0x220]);
        assert_eq!(&writes[2][..5], b"AMLS\x00");
        assert_eq!(&writes[2][8..12], &amls_checksum(&fip[0x200..0x220]).to_le_bytes());
        assert_eq!(&writes[2][16..], &fip[0x210..0x220]);

        let outs = mock.control_outs();
        assert_eq!((outs[1].0, outs[1].1, outs[1].2), (REQ_WRITE_AMLC, 0, 0x1f));
        assert_eq!((outs[2].0, outs[2].1), (REQ_WRITE_AMLC, 1));
    }

    #[test]
    fn test_serve_fip_rejects_overflowing_request() {
        let mock = amlogic_device();
        mock.queue_reply(&amlc(0x300, 0x200));
        let sink = NullSink;
        let aml = Amlogic::new(&mock, &sink).unwrap();
        let err = aml.serve_fip(&[0u8; 0x400]).unwrap_err();
        assert!(matches!(err, AmlogicError::AmlcOutOfRange { offset: 0x200, .. }));
        assert_eq!(mock.writes().len(), 1);
    }
}
