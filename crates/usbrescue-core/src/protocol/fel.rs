//! Allwinner FEL boot ROM protocol.
//!
//! Every FEL request is wrapped in an AWUC/AWUS exchange on the bulk
//! endpoints: a 32-byte AWUC header announcing direction and length, the
//! payload itself, then a 13-byte AWUS status block from the device.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use super::dnload_iter;
use super::memory::MemoryOps;
use crate::events::EventSink;
use crate::transport::{BulkPair, TransportError, UsbTransport};

pub const MAX_MSG_LEN: usize = 65536;

const AW_USB_READ: u8 = 0x11;
const AW_USB_WRITE: u8 = 0x12;
const AWUC_MAGIC: &[u8; 4] = b"AWUC";
const AWUS_MAGIC: &[u8; 4] = b"AWUS";
const AWUS_LEN: usize = 13;
const STATE_LEN: usize = 8;

const FEL_VERIFY_DEVICE: u16 = 0x001;
const FEL_DOWNLOAD: u16 = 0x101;
const FEL_RUN: u16 = 0x102;
const FEL_UPLOAD: u16 = 0x103;

const VERIFY_MAGIC: &[u8; 8] = b"AWUSBFEX";
const VERIFY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum FelError {
    #[error("FEL device has no bulk endpoint pair")]
    NoBulkPair,

    #[error("Bad AWUS status block {0:02x?}")]
    BadMagic(Vec<u8>),

    #[error("FEL transfer failed with CSW status {0}")]
    CswStatus(u8),

    #[error("FEL device state {0:02x?} is not ready")]
    DeviceState(Vec<u8>),

    #[error("FEL message of {0} bytes exceeds the {MAX_MSG_LEN} byte limit")]
    TooLong(usize),

    #[error("FEL download of {declared} bytes carries {actual} bytes of data")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unexpected VERIFY_DEVICE response {0:02x?}")]
    BadVerifyResponse(Vec<u8>),

    #[error("Range 0x{offset:x}+0x{size:x} exceeds blob of 0x{len:x} bytes")]
    OutOfRange { offset: usize, size: usize, len: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Answer to VERIFY_DEVICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FelVersion {
    /// SoC ID in bits 8..24, e.g. 0x00162300 for the A10.
    pub board: u32,
    pub fw: u32,
    pub mode: u16,
    pub data_flag: u8,
    pub data_length: u8,
    pub data_start_address: u32,
}

impl FelVersion {
    pub fn soc_id(&self) -> u16 {
        ((self.board >> 8) & 0xffff) as u16
    }
}

/// FEL session over the ROM's bulk endpoints.
pub struct Fel<'a> {
    transport: &'a dyn UsbTransport,
    sink: &'a dyn EventSink,
    pair: BulkPair,
    timeout: Duration,
}

impl<'a> Fel<'a> {
    pub fn new(
        transport: &'a dyn UsbTransport,
        sink: &'a dyn EventSink,
        timeout: Duration,
    ) -> Result<Self, FelError> {
        let pair = transport.layout().bulk_pair().ok_or(FelError::NoBulkPair)?;
        debug!(
            ep_in = %format!("0x{:02x}", pair.ep_in),
            ep_out = %format!("0x{:02x}", pair.ep_out),
            "FEL endpoints"
        );
        Ok(Self {
            transport,
            sink,
            pair,
            timeout,
        })
    }

    /// Move `length` bytes in one AWUC/AWUS exchange. OUT exchanges send
    /// `packet`, IN exchanges return what the device sent.
    fn aw_exchange(&self, length: usize, packet: Option<&[u8]>) -> Result<Vec<u8>, FelError> {
        let cmd = if packet.is_some() { AW_USB_WRITE } else { AW_USB_READ };
        let len = (length as u32).to_le_bytes();

        let mut header = Vec::with_capacity(32);
        header.extend_from_slice(AWUC_MAGIC);
        header.extend_from_slice(&[0u8; 4]);
        header.extend_from_slice(&len);
        header.extend_from_slice(&[0, 0, 0, 0x0c, cmd, 0x00]);
        header.extend_from_slice(&len);
        header.extend_from_slice(&[0u8; 10]);
        self.transport.write(self.pair.ep_out, &header)?;

        let data = match packet {
            Some(packet) => {
                self.transport.write(self.pair.ep_out, packet)?;
                Vec::new()
            }
            None => self
                .transport
                .read_timeout(self.pair.ep_in, length, self.timeout)?,
        };

        let status = self
            .transport
            .read_timeout(self.pair.ep_in, AWUS_LEN, self.timeout)?;
        if !status.starts_with(AWUS_MAGIC) || status.len() < AWUS_LEN {
            return Err(FelError::BadMagic(status));
        }
        if status[12] != 0 {
            return Err(FelError::CswStatus(status[12]));
        }
        Ok(data)
    }

    fn check_state(&self) -> Result<(), FelError> {
        let state = self.aw_exchange(STATE_LEN, None)?;
        match state.as_slice() {
            [0xff, 0xff, _, _, 0, ..] => Ok(()),
            _ => Err(FelError::DeviceState(state)),
        }
    }

    /// Send a standard request and return its `response_len` byte answer.
    fn request(&self, code: u16, response_len: usize) -> Result<Vec<u8>, FelError> {
        let mut packet = [0u8; 16];
        packet[..2].copy_from_slice(&code.to_le_bytes());
        self.aw_exchange(packet.len(), Some(&packet))?;
        let response = self.aw_exchange(response_len, None)?;
        self.check_state()?;
        Ok(response)
    }

    /// Send a memory message. DOWNLOAD carries `data`, UPLOAD returns
    /// `length` bytes, RUN carries nothing.
    fn message(&self, code: u16, addr: u32, length: usize, data: &[u8]) -> Result<Vec<u8>, FelError> {
        if length > MAX_MSG_LEN {
            return Err(FelError::TooLong(length));
        }
        if code == FEL_DOWNLOAD && data.len() != length {
            return Err(FelError::LengthMismatch {
                declared: length,
                actual: data.len(),
            });
        }

        let mut packet = [0u8; 16];
        packet[..2].copy_from_slice(&code.to_le_bytes());
        packet[4..8].copy_from_slice(&addr.to_le_bytes());
        packet[8..12].copy_from_slice(&(length as u32).to_le_bytes());
        self.aw_exchange(packet.len(), Some(&packet))?;

        let response = match code {
            FEL_UPLOAD => self.aw_exchange(length, None)?,
            FEL_DOWNLOAD => {
                self.aw_exchange(length, Some(data))?;
                Vec::new()
            }
            _ => Vec::new(),
        };
        self.check_state()?;
        Ok(response)
    }

    pub fn verify_device(&self) -> Result<FelVersion, FelError> {
        let resp = self.request(FEL_VERIFY_DEVICE, VERIFY_LEN)?;
        if resp.len() < 24 || !resp.starts_with(VERIFY_MAGIC) {
            return Err(FelError::BadVerifyResponse(resp));
        }
        let u32_at = |i: usize| u32::from_le_bytes([resp[i], resp[i + 1], resp[i + 2], resp[i + 3]]);
        let version = FelVersion {
            board: u32_at(8),
            fw: u32_at(12),
            mode: u16::from_le_bytes([resp[16], resp[17]]),
            data_flag: resp[18],
            data_length: resp[19],
            data_start_address: u32_at(20),
        };
        debug!(soc_id = %format!("0x{:04x}", version.soc_id()), "FEL device verified");
        Ok(version)
    }

    /// Read `length` bytes of device memory, split into FEL-sized messages.
    pub fn read_memory(&self, addr: u32, length: usize) -> Result<Vec<u8>, FelError> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let n = (length - out.len()).min(MAX_MSG_LEN);
            let chunk = self.message(FEL_UPLOAD, addr.wrapping_add(out.len() as u32), n, &[])?;
            out.extend_from_slice(&chunk);
            if chunk.len() < n {
                break;
            }
        }
        Ok(out)
    }
}

impl MemoryOps for Fel<'_> {
    type Error = FelError;

    fn read32(&mut self, addr: u32) -> Result<u32, FelError> {
        let data = self.message(FEL_UPLOAD, addr, 4, &[])?;
        match data.as_slice() {
            [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => Err(FelError::BadMagic(data)),
        }
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<(), FelError> {
        self.message(FEL_DOWNLOAD, addr, 4, &value.to_le_bytes())?;
        Ok(())
    }

    #[instrument(skip(self, blob, addr), fields(addr = %format!("0x{:08x}", addr)), level = "debug")]
    fn write_blob(&mut self, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), FelError> {
        let data = offset
            .checked_add(size)
            .and_then(|end| blob.get(offset..end))
            .ok_or(FelError::OutOfRange {
                offset,
                size,
                len: blob.len(),
            })?;
        let mut sent = 0usize;
        for chunk in dnload_iter(data, MAX_MSG_LEN) {
            self.message(FEL_DOWNLOAD, addr.wrapping_add(sent as u32), chunk.len(), chunk)?;
            sent += chunk.len();
            self.sink.progress("fel write", sent as u64, size as u64);
        }
        Ok(())
    }

    fn jump(&mut self, addr: u32) -> Result<(), FelError> {
        debug!(addr = %format!("0x{:08x}", addr), "FEL run");
        self.message(FEL_RUN, addr, 0, &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::transport::{AltSetting, DeviceLayout, EndpointInfo, EndpointKind, MockTransport};

    fn fel_device() -> MockTransport {
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
                endpoints: vec![ep(0x82), ep(0x01)],
                ..Default::default()
            }],
        })
    }

    fn awus(status: u8) -> Vec<u8> {
        let mut s = b"AWUS".to_vec();
        s.extend_from_slice(&[0u8; 8]);
        s.push(status);
        s
    }

    /// Replies for one OUT exchange followed by nothing else.
    fn queue_out(mock: &MockTransport) {
        mock.queue_reply(&awus(0));
    }

    fn queue_in(mock: &MockTransport, data: &[u8]) {
        mock.queue_reply(data);
        mock.queue_reply(&awus(0));
    }

    fn queue_state_ok(mock: &MockTransport) {
        queue_in(mock, &[0xff, 0xff, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_verify_device() {
        let mock = fel_device();
        queue_out(&mock);
        let mut resp = b"AWUSBFEX".to_vec();
        resp.extend_from_slice(&0x0016_2300u32.to_le_bytes());
        resp.extend_from_slice(&1u32.to_le_bytes());
        resp.extend_from_slice(&[0x44, 0x00, 0x08, 0x01]);
        resp.extend_from_slice(&0x7e00u32.to_le_bytes());
        resp.extend_from_slice(&[0u8; 8]);
        queue_in(&mock, &resp);
        queue_state_ok(&mock);

        let sink = NullSink;
        let fel = Fel::new(&mock, &sink, Duration::from_secs(1)).unwrap();
        let version = fel.verify_device().unwrap();
        assert_eq!(version.soc_id(), 0x1623);
        assert_eq!(version.data_start_address, 0x7e00);
        assert_eq!(mock.pending_replies(), 0);

        let writes = mock.writes();
        assert_eq!(&writes[0][..4], b"AWUC");
        assert_eq!(writes[0].len(), 32);
        assert_eq!(writes[0][16], AW_USB_WRITE);
        assert_eq!(&writes[1][..2], &[0x01, 0x00]);
        assert_eq!(writes[2][16], AW_USB_READ);
    }

    #[test]
    fn test_read32_and_write32() {
        let mock = fel_device();
        queue_out(&mock);
        queue_in(&mock, &0xdead_beefu32.to_le_bytes());
        queue_state_ok(&mock);
        queue_out(&mock);
        queue_out(&mock);
        queue_state_ok(&mock);

        let sink = NullSink;
        let mut fel = Fel::new(&mock, &sink, Duration::from_secs(1)).unwrap();
        assert_eq!(fel.read32(0x0001_c000).unwrap(), 0xdead_beef);
        fel.write32(0x0001_c004, 0x1234_5678).unwrap();

        let writes = mock.writes();
        // message header, message, data header, data, state header
        let download = &writes[writes.len() - 4];
        assert_eq!(&download[..2], &FEL_DOWNLOAD.to_le_bytes());
        assert_eq!(&download[4..8], &0x0001_c004u32.to_le_bytes());
        assert_eq!(writes[writes.len() - 2], 0x1234_5678u32.to_le_bytes());
    }

    #[test]
    fn test_write_blob_splits_messages() {
        let mock = fel_device();
        for _ in 0..2 {
            queue_out(&mock);
            queue_out(&mock);
            queue_state_ok(&mock);
        }
        let sink = NullSink;
        let mut fel = Fel::new(&mock, &sink, Duration::from_secs(1)).unwrap();
        let blob = vec![0x5a; MAX_MSG_LEN + 16];
        fel.write_blob(&blob, 0x4000_0000, 0, blob.len()).unwrap();

        let messages: Vec<_> = mock
            .writes()
            .into_iter()
            .filter(|w| w.len() == 16 && w[..2] == FEL_DOWNLOAD.to_le_bytes())
            .collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[1][4..8], &(0x4000_0000u32 + MAX_MSG_LEN as u32).to_le_bytes());
        assert_eq!(&messages[1][8..12], &16u32.to_le_bytes());
    }

    #[test]
    fn test_csw_failure() {
        let mock = fel_device();
        mock.queue_reply(&awus(1));
        let sink = NullSink;
        let mut fel = Fel::new(&mock, &sink, Duration::from_secs(1)).unwrap();
        assert!(matches!(fel.jump(0x2000), Err(FelError::CswStatus(1))));
    }

    #[test]
    fn test_message_limits() {
        let mock = fel_device();
        let sink = NullSink;
        let mut fel = Fel::new(&mock, &sink, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            fel.message(FEL_UPLOAD, 0, MAX_MSG_LEN + 1, &[]),
            Err(FelError::TooLong(_))
        ));
        assert!(matches!(
            fel.write_blob(&[0u8; 4], 0, 2, 4),
            Err(FelError::OutOfRange { .. })
        ));
        assert!(mock.writes().is_empty());
    }
}
