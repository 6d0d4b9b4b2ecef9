//! CDC-ACM serial link driven directly over the data interface's bulk
//! endpoints, without going through the host tty driver.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::transport::{BulkPair, ControlSetup, TransportError, UsbTransport};

const CLASS_CDC_COMM: u8 = 0x02;
const CLASS_CDC_DATA: u8 = 0x0a;
const CDC_SET_LINE_CODING: u8 = 0x20;
const CDC_SET_CONTROL_LINE_STATE: u8 = 0x22;

pub const DEFAULT_BAUDRATE: u32 = 115_200;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("Device has no CDC data interface")]
    NoDataInterface,

    #[error("CDC data interface {0} lacks a bulk endpoint pair")]
    NoBulkPair(u8),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct CdcAcm<'a> {
    transport: &'a dyn UsbTransport,
    comm_interface: u8,
    pair: BulkPair,
    timeout: Duration,
}

impl<'a> CdcAcm<'a> {
    /// Open the link at 115200 8N1 with DTR and RTS asserted.
    pub fn new(transport: &'a dyn UsbTransport, timeout: Duration) -> Result<Self, CdcError> {
        let layout = transport.layout();
        let data = layout
            .interface_with_class(CLASS_CDC_DATA)
            .ok_or(CdcError::NoDataInterface)?
            .interface;
        let pair = layout.bulk_pair_on(data).ok_or(CdcError::NoBulkPair(data))?;
        let comm_interface = layout
            .interface_with_class(CLASS_CDC_COMM)
            .map(|alt| alt.interface)
            .unwrap_or(0);

        let cdc = Self {
            transport,
            comm_interface,
            pair,
            timeout,
        };
        cdc.set_line_coding(DEFAULT_BAUDRATE)?;
        cdc.set_control_line_state(true, true)?;
        Ok(cdc)
    }

    /// 8 data bits, no parity, one stop bit.
    pub fn set_line_coding(&self, baudrate: u32) -> Result<(), CdcError> {
        let mut coding = baudrate.to_le_bytes().to_vec();
        coding.extend_from_slice(&[0x00, 0x00, 0x08]);
        self.transport.control_out(
            ControlSetup::class_interface(CDC_SET_LINE_CODING, 0, self.comm_interface),
            &coding,
        )?;
        Ok(())
    }

    pub fn set_control_line_state(&self, carrier: bool, dte_present: bool) -> Result<(), CdcError> {
        let state = (u16::from(carrier) << 1) | u16::from(dte_present);
        self.transport.control_out(
            ControlSetup::class_interface(CDC_SET_CONTROL_LINE_STATE, state, self.comm_interface),
            &[],
        )?;
        Ok(())
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, CdcError> {
        Ok(self.transport.write(self.pair.ep_out, data)?)
    }

    /// Read up to `len` bytes, returning early when the device goes quiet.
    pub fn read(&self, len: usize) -> Result<Vec<u8>, CdcError> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            match self
                .transport
                .read_timeout(self.pair.ep_in, self.pair.max_packet_size, self.timeout)
            {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(TransportError::Timeout { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        data.truncate(len);
        Ok(data)
    }

    /// Read until `marker` shows up (kept in the output) or the device
    /// goes quiet.
    pub fn read_until(&self, marker: u8) -> Result<Vec<u8>, CdcError> {
        let mut data = Vec::new();
        loop {
            match self
                .transport
                .read_timeout(self.pair.ep_in, self.pair.max_packet_size, self.timeout)
            {
                Ok(chunk) => {
                    if let Some(pos) = chunk.iter().position(|&b| b == marker) {
                        data.extend_from_slice(&chunk[..=pos]);
                        break;
                    }
                    if chunk.is_empty() {
                        break;
                    }
                    data.extend_from_slice(&chunk);
                }
                Err(TransportError::Timeout { .. }) => {
                    debug!(len = data.len(), "read_until timed out");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(data)
    }

    pub fn close(&self) -> Result<(), CdcError> {
        self.set_control_line_state(false, false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{AltSetting, DeviceLayout, EndpointInfo, EndpointKind, MockTransport};

    pub(crate) fn cdc_device() -> MockTransport {
        let ep = |address, kind| EndpointInfo {
            address,
            kind,
            max_packet_size: 64,
        };
        MockTransport::new().with_layout(DeviceLayout {
            configuration: 1,
            alt_settings: vec![
                AltSetting {
                    interface: 0,
                    class: CLASS_CDC_COMM,
                    endpoints: vec![ep(0x83, EndpointKind::Interrupt)],
                    ..Default::default()
                },
                AltSetting {
                    interface: 1,
                    class: CLASS_CDC_DATA,
                    endpoints: vec![ep(0x82, EndpointKind::Bulk), ep(0x01, EndpointKind::Bulk)],
                    ..Default::default()
                },
            ],
        })
    }

    #[test]
    fn test_open_sets_line_coding() {
        let mock = cdc_device();
        let cdc = CdcAcm::new(&mock, Duration::from_millis(10)).unwrap();
        let outs = mock.control_outs();
        assert_eq!(
            outs[0],
            (CDC_SET_LINE_CODING, 0, 0, vec![0x00, 0xc2, 0x01, 0x00, 0, 0, 8])
        );
        assert_eq!(outs[1], (CDC_SET_CONTROL_LINE_STATE, 3, 0, vec![]));
        cdc.close().unwrap();
        assert_eq!(mock.control_outs()[2].1, 0);
    }

    #[test]
    fn test_read_until_marker() {
        let mock = cdc_device();
        mock.queue_reply(b"v1.0 ");
        mock.queue_reply(b"2014\r\nrest");
        let cdc = CdcAcm::new(&mock, Duration::from_millis(10)).unwrap();
        assert_eq!(cdc.read_until(b'\r').unwrap(), b"v1.0 2014\r");
    }

    #[test]
    fn test_read_stops_on_timeout() {
        let mock = cdc_device();
        mock.queue_reply(&[1, 2]);
        let cdc = CdcAcm::new(&mock, Duration::from_millis(10)).unwrap();
        assert_eq!(cdc.read(4).unwrap(), vec![1, 2]);
    }
}
