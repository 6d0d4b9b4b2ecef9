//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use std::time::Duration;

use super::traits::{
    AltSetting, ControlSetup, DeviceLayout, EndpointInfo, EndpointKind, TransportError, UsbSpeed,
    UsbTransport,
};
use crate::usb::{DeviceProvider, ReadyCheck, UsbAddress, UsbCandidate, UsbError, UsbPath};

/// Host-side operation captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockIo {
    ControlIn {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    },
    ControlOut {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    Write {
        endpoint: u8,
        data: Vec<u8>,
    },
    Read {
        endpoint: u8,
        max_len: usize,
    },
    SetAlt {
        interface: u8,
        alt: u8,
    },
    SetConfiguration(u8),
    Reset,
}

/// Failure injected in place of a device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Timeout,
    Stall,
    Disconnected,
}

impl From<MockFailure> for TransportError {
    fn from(failure: MockFailure) -> Self {
        match failure {
            MockFailure::Timeout => TransportError::Timeout { timeout_ms: 5000 },
            MockFailure::Stall => TransportError::Stall,
            MockFailure::Disconnected => TransportError::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Data(Vec<u8>),
    Fail(MockFailure),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock transport for unit testing protocol and sequencing logic.
///
/// Device-to-host transfers (`control_in`, `read`) pop replies from a
/// single queue in order; an empty queue behaves like a timeout.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies to return on device-to-host transfers.
    replies: Arc<Mutex<VecDeque<Reply>>>,
    /// Captured host operations.
    io_log: Arc<Mutex<Vec<MockIo>>>,
    layout: DeviceLayout,
    speed: UsbSpeed,
    vid: u16,
    pid: u16,
    path: UsbPath,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            io_log: Arc::new(Mutex::new(Vec::new())),
            layout: DeviceLayout::default(),
            speed: UsbSpeed::High,
            vid: 0x1234,
            pid: 0x5678,
            path: UsbPath::new("1", vec![1]),
        }
    }

    pub fn with_layout(mut self, layout: DeviceLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_speed(mut self, speed: UsbSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Set VID/PID for re-enumeration testing.
    pub fn with_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }

    pub fn with_path(mut self, path: UsbPath) -> Self {
        self.path = path;
        self
    }

    /// Queue a reply to be returned on the next device-to-host transfer.
    pub fn queue_reply(&self, data: &[u8]) {
        lock(&self.replies).push_back(Reply::Data(data.to_vec()));
    }

    /// Queue a failure for the next device-to-host transfer.
    pub fn queue_failure(&self, failure: MockFailure) {
        lock(&self.replies).push_back(Reply::Fail(failure));
    }

    pub fn pending_replies(&self) -> usize {
        lock(&self.replies).len()
    }

    /// Get all captured operations.
    pub fn io_log(&self) -> Vec<MockIo> {
        lock(&self.io_log).clone()
    }

    /// Payloads written to OUT endpoints, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.io_log)
            .iter()
            .filter_map(|io| match io {
                MockIo::Write { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Captured host-to-device control transfers as (request, value, index, data).
    pub fn control_outs(&self) -> Vec<(u8, u16, u16, Vec<u8>)> {
        lock(&self.io_log)
            .iter()
            .filter_map(|io| match io {
                MockIo::ControlOut {
                    request,
                    value,
                    index,
                    data,
                    ..
                } => Some((*request, *value, *index, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of endpoint reads attempted.
    pub fn read_count(&self) -> usize {
        lock(&self.io_log)
            .iter()
            .filter(|io| matches!(io, MockIo::Read { .. }))
            .count()
    }

    /// Clear captured operations.
    pub fn clear_log(&self) {
        lock(&self.io_log).clear();
    }

    fn record(&self, io: MockIo) {
        lock(&self.io_log).push(io);
    }

    fn next_reply(&self) -> Result<Vec<u8>, TransportError> {
        match lock(&self.replies).pop_front() {
            Some(Reply::Data(data)) => Ok(data),
            Some(Reply::Fail(failure)) => Err(failure.into()),
            None => Err(TransportError::Timeout { timeout_ms: 5000 }),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        self.record(MockIo::ControlIn {
            request_type: setup.request_type(true),
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
        });
        let mut data = self.next_reply()?;
        data.truncate(length as usize);
        Ok(data)
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        self.record(MockIo::ControlOut {
            request_type: setup.request_type(false),
            request: setup.request,
            value: setup.value,
            index: setup.index,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        self.record(MockIo::Write {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn read(&self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.record(MockIo::Read { endpoint, max_len });
        let mut data = self.next_reply()?;
        data.truncate(max_len);
        Ok(data)
    }

    fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), TransportError> {
        self.record(MockIo::SetAlt { interface, alt });
        Ok(())
    }

    fn set_configuration(&self, value: u8) -> Result<(), TransportError> {
        self.record(MockIo::SetConfiguration(value));
        Ok(())
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.record(MockIo::Reset);
        Ok(())
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn path(&self) -> &UsbPath {
        &self.path
    }
}

/// DFU interface 0 with one alternate setting per name, advertising a
/// transfer size of 1024.
pub fn dfu_layout(names: &[&str]) -> DeviceLayout {
    DeviceLayout {
        configuration: 1,
        alt_settings: names
            .iter()
            .enumerate()
            .map(|(i, name)| AltSetting {
                interface: 0,
                alt: i as u8,
                class: 0xfe,
                subclass: 0x01,
                protocol: 0x02,
                name: Some(name.to_string()),
                endpoints: vec![],
                extra: vec![0x09, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x04, 0x1a, 0x01],
            })
            .collect(),
    }
}

/// Interface 0 of `class` with bulk endpoints 0x81 and 0x01.
pub fn bulk_layout(class: u8) -> DeviceLayout {
    let ep = |address| EndpointInfo {
        address,
        kind: EndpointKind::Bulk,
        max_packet_size: 512,
    };
    DeviceLayout {
        configuration: 1,
        alt_settings: vec![AltSetting {
            interface: 0,
            class,
            endpoints: vec![ep(0x81), ep(0x01)],
            ..Default::default()
        }],
    }
}

/// Fastboot gadget layout: [`bulk_layout`] with the fastboot interface
/// triple.
pub fn fastboot_layout() -> DeviceLayout {
    let mut layout = bulk_layout(0xff);
    for alt in &mut layout.alt_settings {
        alt.subclass = 0x42;
        alt.protocol = 0x03;
    }
    layout
}

/// Device provider double handing out queued mock devices in order.
///
/// Each acquire/reacquire/find_any pops the next device, so a test queues
/// one mock per phase of the flow it drives.
#[derive(Clone, Default)]
pub struct MockProvider {
    devices: Arc<Mutex<VecDeque<MockTransport>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a device for the next lookup.
    pub fn push(&self, device: MockTransport) {
        lock(&self.devices).push_back(device);
    }

    /// Lookups performed so far, e.g. `acquire 0483:df11`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn pop(&self, what: &str) -> Result<MockTransport, UsbError> {
        lock(&self.devices)
            .pop_front()
            .ok_or_else(|| UsbError::NotFound(what.to_string()))
    }
}

impl DeviceProvider for MockProvider {
    fn acquire(&mut self, address: &UsbAddress) -> Result<Box<dyn UsbTransport>, UsbError> {
        self.record(format!("acquire {}", address));
        Ok(Box::new(self.pop(&address.to_string())?))
    }

    fn reacquire_until(
        &mut self,
        path: &UsbPath,
        ready: ReadyCheck<'_>,
    ) -> Result<Box<dyn UsbTransport>, UsbError> {
        self.record(format!("reacquire {}", path));
        loop {
            let device = self.pop(&path.to_string())?;
            if ready(&device) {
                return Ok(Box::new(device));
            }
        }
    }

    fn find_any(
        &mut self,
        candidates: &[UsbCandidate],
        _timeout: Duration,
    ) -> Result<(usize, Box<dyn UsbTransport>), UsbError> {
        self.record("find_any".to_string());
        let device = self.pop("candidates")?;
        let index = candidates
            .iter()
            .position(|c| c.vid == device.vendor_id() && c.pid == device.product_id())
            .ok_or_else(|| {
                UsbError::NotFound(format!(
                    "{:04x}:{:04x}",
                    device.vendor_id(),
                    device.product_id()
                ))
            })?;
        Ok((index, Box::new(device)))
    }

    fn sleep(&self, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reply_queue() {
        let mock = MockTransport::new();
        mock.queue_reply(b"OKAY");
        mock.queue_failure(MockFailure::Stall);

        assert_eq!(mock.read(0x81, 64).unwrap(), b"OKAY");
        assert!(matches!(mock.read(0x81, 64), Err(TransportError::Stall)));

        // Queue is empty now
        assert!(matches!(
            mock.read(0x81, 64),
            Err(TransportError::Timeout { .. })
        ));
        assert_eq!(mock.read_count(), 3);
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(0x01, b"Hello").unwrap();
        mock.write(0x01, b"World").unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_control_in_truncates_to_length() {
        let mock = MockTransport::new();
        mock.queue_reply(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let data = mock
            .control_in(ControlSetup::class_interface(3, 0, 0), 6)
            .unwrap();
        assert_eq!(data.len(), 6);
        assert!(matches!(
            mock.io_log()[0],
            MockIo::ControlIn {
                request_type: 0xa1,
                request: 3,
                length: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_provider_hands_out_devices_in_order() {
        let mut provider = MockProvider::new();
        provider.push(MockTransport::new().with_ids(0x0483, 0xdf11));
        provider.push(MockTransport::new().with_ids(0x0483, 0x5720));

        let first = provider.acquire(&"0483:df11".parse().unwrap()).unwrap();
        assert_eq!(first.product_id(), 0xdf11);
        let second = provider.reacquire(first.path()).unwrap();
        assert_eq!(second.product_id(), 0x5720);
        assert!(provider.reacquire(second.path()).is_err());
        assert_eq!(provider.calls(), vec!["acquire 0483:df11", "reacquire 1-1", "reacquire 1-1"]);
    }
}
