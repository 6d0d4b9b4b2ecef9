//! i.MX Serial Download Protocol.
//!
//! SDP commands are 16-byte packets sent as HID report 1, followed for
//! downloads by data in report 2. The ROM answers with the HAB state in
//! report 3 and a completion status in report 4. Older parts (i.MX53) speak
//! the same reports over a plain bulk endpoint pair.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::dnload_iter;
use super::hab;
use super::hid::{self, HidError, HidReports};
use super::memory::MemoryOps;
use crate::events::EventSink;
use crate::image::dcd::{Dcd, DcdCommand, WriteOp};
use crate::transport::{BulkPair, TransportError, UsbTransport};

const CMD_READ_REGISTER: u16 = 0x0101;
const CMD_WRITE_REGISTER: u16 = 0x0202;
const CMD_WRITE_FILE: u16 = 0x0404;
const CMD_DCD_WRITE: u16 = 0x0a0a;
const CMD_JUMP_ADDRESS: u16 = 0x0b0b;
const CMD_SKIP_DCD_HEADER: u16 = 0x0c0c;

const HAB_OPEN: [u8; 4] = [0x56, 0x78, 0x78, 0x56];
const HAB_CLOSED: [u8; 4] = [0x12, 0x34, 0x34, 0x12];
const WRITE_COMPLETE: [u8; 4] = [0x12, 0x8a, 0x8a, 0x12];
const FILE_COMPLETE: [u8; 4] = [0x88, 0x88, 0x88, 0x88];
const SKIP_DCD_ACK: [u8; 4] = [0x09, 0xd0, 0x0d, 0x90];

const CBW_BLTC_SIGNATURE: u32 = 0x4354_4c42;
const BLTC_DOWNLOAD_FW: u8 = 0x02;

const REPORT_COMMAND: u8 = 0x01;
const REPORT_DATA: u8 = 0x02;
const HAB_REPORT_LEN: usize = 5;
const STATUS_REPORT_LEN: usize = 65;
const DATA_CHUNK: usize = 1024;

const REPLY_TIMEOUT: Duration = Duration::from_millis(5000);
const JUMP_TIMEOUT: Duration = Duration::from_millis(100);
/// Poll bound for DCD checks that do not carry their own count.
const DEFAULT_CHECK_POLLS: u32 = 1000;

#[derive(Error, Debug)]
pub enum SdpError {
    #[error("Device has neither a HID interface nor a bulk endpoint pair")]
    NoTransport,

    #[error("HAB is closed, device only accepts signed images")]
    HabClosed,

    #[error("Unknown HAB status {0:02x?}")]
    UnknownHab(Vec<u8>),

    #[error("{command} returned status {status:02x?}")]
    BadStatus { command: &'static str, status: Vec<u8> },

    #[error("Jump to 0x{addr:08x} failed: {reason}")]
    JumpFailed { addr: u32, reason: String },

    #[error("Range 0x{offset:x}+0x{size:x} exceeds blob of 0x{len:x} bytes")]
    OutOfRange { offset: usize, size: usize, len: usize },

    #[error("DCD check on 0x{addr:08x} (mask 0x{mask:08x}) never succeeded")]
    DcdCheckTimeout { addr: u32, mask: u32 },

    #[error("Unsupported register width {0}")]
    BadWidth(u8),

    #[error(transparent)]
    Hid(#[from] HidError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Link<'a> {
    Hid(HidReports<'a>),
    Bulk {
        transport: &'a dyn UsbTransport,
        pair: BulkPair,
    },
}

impl Link<'_> {
    fn write(&self, report: &[u8]) -> Result<(), SdpError> {
        match self {
            Link::Hid(hid) => hid.write(report)?,
            Link::Bulk { transport, pair } => {
                transport.write(pair.ep_out, report)?;
            }
        }
        Ok(())
    }

    fn read(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, SdpError> {
        match self {
            Link::Hid(hid) => Ok(hid.read(len, timeout)?),
            Link::Bulk { transport, pair } => Ok(transport.read_timeout(pair.ep_in, len, timeout)?),
        }
    }
}

fn format_code(width: u8) -> Result<u8, SdpError> {
    match width {
        1 => Ok(0x08),
        2 => Ok(0x10),
        4 => Ok(0x20),
        other => Err(SdpError::BadWidth(other)),
    }
}

/// Build a report 1 command packet.
fn command(cmd: u16, addr: u32, format: u8, data_count: u32, data: u32) -> [u8; 17] {
    let mut packet = [0u8; 17];
    packet[0] = REPORT_COMMAND;
    packet[1..3].copy_from_slice(&cmd.to_be_bytes());
    packet[3..7].copy_from_slice(&addr.to_be_bytes());
    packet[7] = format;
    packet[8..12].copy_from_slice(&data_count.to_be_bytes());
    packet[12..16].copy_from_slice(&data.to_be_bytes());
    packet
}

/// SDP session on a boot ROM or an SDP-capable SPL.
pub struct Sdp<'a> {
    link: Link<'a>,
    sink: &'a dyn EventSink,
}

impl<'a> Sdp<'a> {
    /// Use HID reports when the device has a HID interface, otherwise fall
    /// back to its bulk endpoints.
    pub fn new(transport: &'a dyn UsbTransport, sink: &'a dyn EventSink) -> Result<Self, SdpError> {
        let link = if hid::is_hid(transport) {
            Link::Hid(HidReports::new(transport)?)
        } else {
            let layout = transport.layout();
            let pair = layout
                .bulk_pair_on(0)
                .or_else(|| layout.bulk_pair())
                .ok_or(SdpError::NoTransport)?;
            Link::Bulk { transport, pair }
        };
        Ok(Self { link, sink })
    }

    pub fn is_hid(&self) -> bool {
        matches!(self.link, Link::Hid(_))
    }

    fn check_hab(&self) -> Result<(), SdpError> {
        let report = self.link.read(HAB_REPORT_LEN, REPLY_TIMEOUT)?;
        match report.get(1..5) {
            Some(s) if s == HAB_OPEN => Ok(()),
            Some(s) if s == HAB_CLOSED => Err(SdpError::HabClosed),
            _ => Err(SdpError::UnknownHab(report)),
        }
    }

    fn status(&self) -> Result<Vec<u8>, SdpError> {
        let report = self.link.read(STATUS_REPORT_LEN, REPLY_TIMEOUT)?;
        Ok(report.get(1..5).unwrap_or_default().to_vec())
    }

    fn expect_status(&self, command: &'static str, expected: [u8; 4]) -> Result<(), SdpError> {
        let status = self.status()?;
        if status != expected {
            return Err(SdpError::BadStatus { command, status });
        }
        Ok(())
    }

    pub fn read_register(&self, addr: u32, width: u8) -> Result<u32, SdpError> {
        let packet = command(CMD_READ_REGISTER, addr, format_code(width)?, width as u32, 0);
        self.link.write(&packet)?;
        self.check_hab()?;
        let value = self.status()?;
        let mut word = [0u8; 4];
        let n = value.len().min(width as usize);
        word[..n].copy_from_slice(&value[..n]);
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_register(&self, addr: u32, value: u32, width: u8) -> Result<(), SdpError> {
        let packet = command(CMD_WRITE_REGISTER, addr, format_code(width)?, width as u32, value);
        self.link.write(&packet)?;
        self.check_hab()?;
        self.expect_status("WRITE_REGISTER", WRITE_COMPLETE)
    }

    fn download(&self, cmd: u16, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), SdpError> {
        let data = offset
            .checked_add(size)
            .and_then(|end| blob.get(offset..end))
            .ok_or(SdpError::OutOfRange {
                offset,
                size,
                len: blob.len(),
            })?;
        self.link.write(&command(cmd, addr, 0, size as u32, 0))?;

        let mut report = Vec::with_capacity(DATA_CHUNK + 1);
        let mut sent = 0u64;
        for chunk in dnload_iter(data, DATA_CHUNK) {
            report.clear();
            report.push(REPORT_DATA);
            report.extend_from_slice(chunk);
            self.link.write(&report)?;
            sent += chunk.len() as u64;
            self.sink.progress("sdp download", sent, size as u64);
        }
        self.check_hab()
    }

    /// Download a DCD table with DCD_WRITE.
    pub fn write_dcd(&self, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), SdpError> {
        self.download(CMD_DCD_WRITE, blob, addr, offset, size)?;
        self.expect_status("DCD_WRITE", WRITE_COMPLETE)
    }

    #[instrument(skip(self, blob, addr), fields(addr = %format!("0x{:08x}", addr)), level = "debug")]
    pub fn write_file(&self, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), SdpError> {
        self.download(CMD_WRITE_FILE, blob, addr, offset, size)?;
        self.expect_status("WRITE_FILE", FILE_COMPLETE)?;
        info!(size, "write_file complete");
        Ok(())
    }

    /// Jump to the image whose IVT sits at `addr`. A silent device means
    /// the jump was taken; a report carries a HAB error event.
    pub fn jump_address(&self, addr: u32) -> Result<(), SdpError> {
        self.link.write(&command(CMD_JUMP_ADDRESS, addr, 0, 0, 0))?;
        self.check_hab()?;
        match self.link.read(STATUS_REPORT_LEN, JUMP_TIMEOUT) {
            Ok(report) if report.len() > 1 => Err(SdpError::JumpFailed {
                addr,
                reason: hab::decode_event(&report[1..]),
            }),
            Ok(_) => Ok(()),
            Err(SdpError::Hid(HidError::Transport(e))) | Err(SdpError::Transport(e))
                if e.is_transient() || matches!(e, TransportError::Disconnected) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Tell the ROM to ignore the DCD of the image it was just given.
    pub fn skip_dcd_header(&self) -> Result<(), SdpError> {
        info!("Sending SKIP_DCD_HEADER command");
        self.link.write(&command(CMD_SKIP_DCD_HEADER, 0, 0, 0, 0))?;
        self.check_hab()?;
        self.expect_status("SKIP_DCD_HEADER", SKIP_DCD_ACK)
    }

    /// Stream a first stage image to an SDPS ROM.
    ///
    /// `with_cbw` prefixes the data with the BLTC download command some
    /// parts require.
    pub fn sdps_write(
        &self,
        blob: &[u8],
        size: usize,
        with_cbw: bool,
        chunk_size: usize,
    ) -> Result<(), SdpError> {
        let data = blob.get(..size).ok_or(SdpError::OutOfRange {
            offset: 0,
            size,
            len: blob.len(),
        })?;
        info!(size = %format!("0x{:x}", size), "SDPS write");
        if with_cbw {
            let mut cbw = Vec::with_capacity(32);
            cbw.push(REPORT_COMMAND);
            cbw.extend_from_slice(&CBW_BLTC_SIGNATURE.to_le_bytes());
            cbw.extend_from_slice(&1u32.to_le_bytes());
            cbw.extend_from_slice(&(size as u32).to_le_bytes());
            cbw.push(0x00);
            cbw.extend_from_slice(&[0, 0]);
            cbw.push(BLTC_DOWNLOAD_FW);
            cbw.extend_from_slice(&(size as u32).to_be_bytes());
            cbw.extend_from_slice(&[0u8; 11]);
            self.link.write(&cbw)?;
        }
        let mut sent = 0u64;
        for chunk in dnload_iter(data, chunk_size) {
            let mut report = Vec::with_capacity(chunk.len() + 1);
            report.push(REPORT_DATA);
            report.extend_from_slice(chunk);
            self.link.write(&report)?;
            sent += chunk.len() as u64;
            self.sink.progress("sdps download", sent, size as u64);
        }
        Ok(())
    }

    /// Execute a DCD table register by register, for ROMs that cannot take
    /// it through DCD_WRITE.
    pub fn run_dcd(&self, dcd: &Dcd) -> Result<(), SdpError> {
        for cmd in &dcd.commands {
            match cmd {
                DcdCommand::Write { width, op, entries } => {
                    for &(addr, value) in entries {
                        let value = match op {
                            WriteOp::Write => value,
                            WriteOp::ClearBits => self.read_register(addr, *width)? & !value,
                            WriteOp::SetBits => self.read_register(addr, *width)? | value,
                        };
                        debug!(addr = %format!("0x{:08x}", addr), value = %format!("0x{:08x}", value), "DCD write");
                        self.write_register(addr, value, *width)?;
                    }
                }
                DcdCommand::Check {
                    width,
                    op,
                    address,
                    mask,
                    count,
                } => {
                    let polls = count.unwrap_or(DEFAULT_CHECK_POLLS).max(1);
                    let mut ok = false;
                    for _ in 0..polls {
                        if op.satisfied(self.read_register(*address, *width)?, *mask) {
                            ok = true;
                            break;
                        }
                    }
                    if !ok {
                        return Err(SdpError::DcdCheckTimeout {
                            addr: *address,
                            mask: *mask,
                        });
                    }
                }
                DcdCommand::Nop => {}
                DcdCommand::Unlock => warn!("Skipping DCD unlock command"),
            }
        }
        Ok(())
    }
}

impl MemoryOps for Sdp<'_> {
    type Error = SdpError;

    fn read32(&mut self, addr: u32) -> Result<u32, SdpError> {
        self.read_register(addr, 4)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<(), SdpError> {
        self.write_register(addr, value, 4)
    }

    fn write_blob(&mut self, blob: &[u8], addr: u32, offset: usize, size: usize) -> Result<(), SdpError> {
        self.write_file(blob, addr, offset, size)
    }

    fn jump(&mut self, addr: u32) -> Result<(), SdpError> {
        self.jump_address(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::transport::{
        AltSetting, DeviceLayout, EndpointInfo, EndpointKind, MockFailure, MockIo, MockTransport,
    };

    fn hid_device() -> MockTransport {
        MockTransport::new().with_layout(DeviceLayout {
            configuration: 1,
            alt_settings: vec![AltSetting {
                interface: 0,
                class: 0x03,
                endpoints: vec![EndpointInfo {
                    address: 0x81,
                    kind: EndpointKind::Interrupt,
                    max_packet_size: 64,
                }],
                ..Default::default()
            }],
        })
    }

    fn bulk_device() -> MockTransport {
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

    fn report(id: u8, body: &[u8]) -> Vec<u8> {
        let mut r = vec![id];
        r.extend_from_slice(body);
        r
    }

    /// Report 1 payloads sent through SET_REPORT.
    fn reports(mock: &MockTransport) -> Vec<Vec<u8>> {
        mock.control_outs()
            .into_iter()
            .filter(|(req, ..)| *req == 0x09)
            .map(|(.., data)| data)
            .collect()
    }

    #[test]
    fn test_command_packet_layout() {
        let packet = command(CMD_WRITE_REGISTER, 0x020c_4068, 0x20, 4, 0xdead_beef);
        assert_eq!(
            packet.to_vec(),
            vec![
                0x01, 0x02, 0x02, 0x02, 0x0c, 0x40, 0x68, 0x20, 0, 0, 0, 4, 0xde, 0xad, 0xbe,
                0xef, 0
            ]
        );
    }

    #[test]
    fn test_write_file_over_hid() {
        let mock = hid_device();
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_reply(&report(4, &FILE_COMPLETE));
        let mut sdp = Sdp::new(&mock, &NullSink).unwrap();
        assert!(sdp.is_hid());

        let blob = vec![0x5a; 1500];
        sdp.write_blob(&blob, 0x0090_7400, 100, 1400).unwrap();

        let sent = reports(&mock);
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][..3], &[0x01, 0x04, 0x04]);
        assert_eq!(&sent[0][8..12], &1400u32.to_be_bytes());
        assert_eq!(sent[1].len(), 1025);
        assert_eq!(sent[1][0], REPORT_DATA);
        assert_eq!(sent[2].len(), 1 + 1400 - 1024);
    }

    #[test]
    fn test_hab_closed_is_an_error() {
        let mock = hid_device();
        mock.queue_reply(&report(3, &HAB_CLOSED));
        let mut sdp = Sdp::new(&mock, &NullSink).unwrap();
        assert!(matches!(sdp.write32(0x10, 1), Err(SdpError::HabClosed)));
    }

    #[test]
    fn test_bad_completion_status() {
        let mock = hid_device();
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_reply(&report(4, &[0xff, 0xff, 0xff, 0xff]));
        let mut sdp = Sdp::new(&mock, &NullSink).unwrap();
        assert!(matches!(
            sdp.write32(0x10, 1),
            Err(SdpError::BadStatus {
                command: "WRITE_REGISTER",
                ..
            })
        ));
    }

    #[test]
    fn test_jump_silent_device_is_success() {
        let mock = hid_device();
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_failure(MockFailure::Timeout);
        let mut sdp = Sdp::new(&mock, &NullSink).unwrap();
        sdp.jump(0x877f_f400).unwrap();
    }

    #[test]
    fn test_jump_reports_hab_event() {
        let mock = hid_device();
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_reply(&report(4, &[0x33, 0x05, 0xe1, 0x36]));
        let mut sdp = Sdp::new(&mock, &NullSink).unwrap();
        let err = sdp.jump(0x877f_f400).unwrap_err();
        assert!(matches!(err, SdpError::JumpFailed { reason, .. } if reason.contains("HAB_INV_IVT")));
    }

    #[test]
    fn test_bulk_framing_and_dcd_interpreter() {
        let mock = bulk_device();
        // set bits: read then write
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_reply(&report(4, &[0x01, 0, 0, 0]));
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_reply(&report(4, &WRITE_COMPLETE));
        // check: first poll fails, second passes
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_reply(&report(4, &[0x00, 0, 0, 0]));
        mock.queue_reply(&report(3, &HAB_OPEN));
        mock.queue_reply(&report(4, &[0x02, 0, 0, 0]));

        let sdp = Sdp::new(&mock, &NullSink).unwrap();
        assert!(!sdp.is_hid());
        let dcd = Dcd {
            version: 0x41,
            raw: vec![],
            commands: vec![
                DcdCommand::Write {
                    width: 4,
                    op: WriteOp::SetBits,
                    entries: vec![(0x2000, 0x10)],
                },
                DcdCommand::Nop,
                DcdCommand::Check {
                    width: 4,
                    op: crate::image::dcd::CheckOp::AllSet,
                    address: 0x2004,
                    mask: 0x02,
                    count: Some(5),
                },
            ],
        };
        sdp.run_dcd(&dcd).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(&writes[1][1..3], &[0x02, 0x02]);
        assert_eq!(&writes[1][12..16], &0x11u32.to_be_bytes());
        assert!(mock
            .io_log()
            .iter()
            .all(|io| !matches!(io, MockIo::ControlOut { .. })));
    }

    #[test]
    fn test_sdps_write_with_cbw() {
        let mock = hid_device();
        let sdp = Sdp::new(&mock, &NullSink).unwrap();
        sdp.sdps_write(&[7u8; 3000], 2048, true, 1024).unwrap();

        let sent = reports(&mock);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].len(), 32);
        assert_eq!(&sent[0][1..5], &CBW_BLTC_SIGNATURE.to_le_bytes());
        assert_eq!(sent[0][16], BLTC_DOWNLOAD_FW);
        assert_eq!(&sent[0][17..21], &2048u32.to_be_bytes());
        assert!(sent[1..].iter().all(|r| r.len() == 1025));
    }
}
