//! Transport wrapper that emits packet events.

use std::time::Duration;

use super::traits::{ControlSetup, DeviceLayout, TransportError, UsbSpeed, UsbTransport};
use crate::events::{EventSink, PacketDirection, RecoveryEvent};
use crate::usb::UsbPath;

/// Forwards every call to `inner` and reports successful transfers to the
/// sink as `Packet` events.
pub struct ObservableTransport<'a> {
    inner: &'a dyn UsbTransport,
    sink: &'a dyn EventSink,
}

impl<'a> ObservableTransport<'a> {
    pub fn new(inner: &'a dyn UsbTransport, sink: &'a dyn EventSink) -> Self {
        Self { inner, sink }
    }

    fn packet(&self, direction: PacketDirection, length: usize) {
        self.sink
            .on_event(&RecoveryEvent::Packet { direction, length });
    }

    fn observe_in(&self, res: Result<Vec<u8>, TransportError>) -> Result<Vec<u8>, TransportError> {
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.packet(PacketDirection::Rx, data.len());
        }
        res
    }
}

impl UsbTransport for ObservableTransport<'_> {
    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        self.observe_in(self.inner.control_in(setup, length))
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.control_out(setup, data);
        if res.is_ok() {
            self.packet(PacketDirection::Tx, data.len());
        }
        res
    }

    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.write(endpoint, data);
        if let Ok(n) = &res {
            self.packet(PacketDirection::Tx, *n);
        }
        res
    }

    fn read(&self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.observe_in(self.inner.read(endpoint, max_len))
    }

    fn read_timeout(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.observe_in(self.inner.read_timeout(endpoint, max_len, timeout))
    }

    fn layout(&self) -> &DeviceLayout {
        self.inner.layout()
    }

    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), TransportError> {
        self.inner.set_alt_setting(interface, alt)
    }

    fn set_configuration(&self, value: u8) -> Result<(), TransportError> {
        self.inner.set_configuration(value)
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.inner.reset()
    }

    fn speed(&self) -> UsbSpeed {
        self.inner.speed()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }

    fn path(&self) -> &UsbPath {
        self.inner.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::transport::MockTransport;

    #[test]
    fn test_packets_reported() {
        let mock = MockTransport::new();
        mock.queue_reply(b"OKAY");
        let sink = RecordingSink::new();
        let obs = ObservableTransport::new(&mock, &sink);

        obs.write(0x01, b"getvar:version").unwrap();
        obs.read(0x81, 64).unwrap();
        // Timeout produces no event
        assert!(obs.read(0x81, 64).is_err());

        assert_eq!(
            sink.events(),
            vec![
                RecoveryEvent::Packet {
                    direction: PacketDirection::Tx,
                    length: 14
                },
                RecoveryEvent::Packet {
                    direction: PacketDirection::Rx,
                    length: 4
                },
            ]
        );
    }
}
