//! Minimal HID class support: output reports through SET_REPORT, input
//! reports from the interrupt IN endpoint.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::transport::{ControlSetup, TransportError, UsbTransport};

const HID_CLASS: u8 = 0x03;
const HID_SET_REPORT: u8 = 0x09;
const HID_SET_IDLE: u8 = 0x0a;
const REPORT_TYPE_OUTPUT: u16 = 0x02;

#[derive(Error, Debug)]
pub enum HidError {
    #[error("Device has no HID interface")]
    NoInterface,

    #[error("HID interface {0} has no interrupt IN endpoint")]
    NoInterruptIn(u8),

    #[error("Empty output report")]
    EmptyReport,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Whether the active configuration exposes a HID interface.
pub fn is_hid(transport: &dyn UsbTransport) -> bool {
    transport.layout().interface_with_class(HID_CLASS).is_some()
}

/// Report I/O on the first HID interface of a device.
pub struct HidReports<'a> {
    transport: &'a dyn UsbTransport,
    interface: u8,
    intr_in: u8,
}

impl<'a> HidReports<'a> {
    pub fn new(transport: &'a dyn UsbTransport) -> Result<Self, HidError> {
        let layout = transport.layout();
        let interface = layout
            .interface_with_class(HID_CLASS)
            .ok_or(HidError::NoInterface)?
            .interface;
        let intr_in = layout
            .interrupt_in(interface)
            .ok_or(HidError::NoInterruptIn(interface))?;

        let hid = Self {
            transport,
            interface,
            intr_in,
        };
        // Not every ROM implements SET_IDLE
        if let Err(e) = hid.set_idle(0, 0) {
            debug!(error = %e, "SET_IDLE rejected");
        }
        Ok(hid)
    }

    pub fn set_idle(&self, report_id: u8, duration: u8) -> Result<(), HidError> {
        let value = ((duration as u16) << 8) | report_id as u16;
        self.transport.control_out(
            ControlSetup::class_interface(HID_SET_IDLE, value, self.interface),
            &[],
        )?;
        Ok(())
    }

    /// Send an output report. The first byte of `report` is the report ID.
    pub fn write(&self, report: &[u8]) -> Result<(), HidError> {
        let id = *report.first().ok_or(HidError::EmptyReport)?;
        let value = (REPORT_TYPE_OUTPUT << 8) | id as u16;
        debug!(id, len = report.len(), "SET_REPORT");
        self.transport.control_out(
            ControlSetup::class_interface(HID_SET_REPORT, value, self.interface),
            report,
        )?;
        Ok(())
    }

    /// Read one input report of at most `len` bytes, report ID included.
    pub fn read(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, HidError> {
        Ok(self.transport.read_timeout(self.intr_in, len, timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AltSetting, DeviceLayout, EndpointInfo, EndpointKind, MockTransport};

    fn hid_layout() -> DeviceLayout {
        DeviceLayout {
            configuration: 1,
            alt_settings: vec![AltSetting {
                interface: 0,
                class: HID_CLASS,
                endpoints: vec![EndpointInfo {
                    address: 0x81,
                    kind: EndpointKind::Interrupt,
                    max_packet_size: 64,
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_output_report_uses_set_report() {
        let mock = MockTransport::new().with_layout(hid_layout());
        let hid = HidReports::new(&mock).unwrap();
        hid.write(&[0x01, 0xaa, 0xbb]).unwrap();

        let outs = mock.control_outs();
        assert_eq!(outs[0], (HID_SET_IDLE, 0, 0, vec![]));
        assert_eq!(outs[1], (HID_SET_REPORT, 0x0201, 0, vec![0x01, 0xaa, 0xbb]));
    }

    #[test]
    fn test_requires_hid_interface() {
        let mock = MockTransport::new();
        assert!(!is_hid(&mock));
        assert!(matches!(HidReports::new(&mock), Err(HidError::NoInterface)));
    }
}
