//! nusb-based USB transport implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use nusb::descriptors::{TransferType, language_id};
use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Interrupt, Out, Recipient as NusbRecipient,
    TransferError,
};
use nusb::{Device, DeviceInfo, ErrorKind, Interface, MaybeFuture, Speed};
use tracing::{debug, info, instrument, warn};

use super::traits::{
    AltSetting, ControlSetup, DeviceLayout, EndpointInfo, EndpointKind, Recipient, RequestKind,
    TransportError, UsbSpeed, UsbTransport,
};
use crate::usb::UsbPath;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(500);

/// nusb-based USB transport.
///
/// Interfaces are claimed on first use, detaching any kernel driver bound
/// to them.
pub struct NusbTransport {
    device: Device,
    interfaces: Mutex<HashMap<u8, Interface>>,
    layout: DeviceLayout,
    speed: UsbSpeed,
    vid: u16,
    pid: u16,
    path: UsbPath,
    timeout: Duration,
}

impl NusbTransport {
    /// Open the device described by `info` and read its active configuration.
    #[instrument(level = "info", skip(info), fields(
        vid = format!("{:04X}", info.vendor_id()),
        pid = format!("{:04X}", info.product_id()),
    ))]
    pub fn open(info: &DeviceInfo) -> Result<Self, TransportError> {
        let path = UsbPath::new(info.bus_id(), info.port_chain().to_vec());
        let device = info.open().wait().map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => TransportError::AccessDenied(e.to_string()),
            _ => TransportError::OpenFailed(e.to_string()),
        })?;

        let layout = read_layout(&device)?;
        let speed = info.speed().map(map_speed).unwrap_or(UsbSpeed::Full);

        info!(
            path = %path,
            speed = %speed,
            interfaces = layout.alt_settings.len(),
            "Device opened successfully"
        );

        Ok(Self {
            device,
            interfaces: Mutex::new(HashMap::new()),
            layout,
            speed,
            vid: info.vendor_id(),
            pid: info.product_id(),
            path,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the default transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn interface(&self, number: u8) -> Result<Interface, TransportError> {
        let mut claimed = self
            .interfaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(iface) = claimed.get(&number) {
            return Ok(iface.clone());
        }
        let iface = self
            .device
            .detach_and_claim_interface(number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: number,
                message: e.to_string(),
            })?;
        debug!(interface = number, "Claimed interface");
        claimed.insert(number, iface.clone());
        Ok(iface)
    }

    fn endpoint_owner(&self, address: u8) -> Result<(u8, EndpointKind), TransportError> {
        self.layout
            .endpoint(address)
            .map(|(iface, ep)| (iface, ep.kind))
            .ok_or(TransportError::EndpointNotFound { address })
    }

    fn read_inner(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (number, kind) = self.endpoint_owner(endpoint)?;
        let iface = self.interface(number)?;
        let timeout_ms = timeout.as_millis() as u64;

        let completion = match kind {
            EndpointKind::Interrupt => {
                let mut ep = iface
                    .endpoint::<Interrupt, In>(endpoint)
                    .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
                let len = round_up(max_len, ep.max_packet_size());
                let mut buf = Buffer::new(len);
                buf.set_requested_len(len);
                ep.transfer_blocking(buf, timeout)
            }
            _ => {
                let mut ep = iface
                    .endpoint::<Bulk, In>(endpoint)
                    .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
                let len = round_up(max_len, ep.max_packet_size());
                let mut buf = Buffer::new(len);
                buf.set_requested_len(len);
                ep.transfer_blocking(buf, timeout)
            }
        };

        let buf = completion
            .into_result()
            .map_err(|e| map_transfer_error(e, timeout_ms, TransportError::ReadFailed))?;
        let mut data = buf.to_vec();
        data.truncate(max_len);
        debug!(bytes_read = data.len(), "Read complete");
        Ok(data)
    }

    fn control_iface(&self, setup: &ControlSetup) -> Result<Interface, TransportError> {
        match setup.recipient {
            Recipient::Interface => self.interface((setup.index & 0xff) as u8),
            _ => {
                let first = self
                    .layout
                    .alt_settings
                    .first()
                    .map(|alt| alt.interface)
                    .unwrap_or(0);
                self.interface(first)
            }
        }
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self), fields(request = setup.request))]
    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        let iface = self.control_iface(&setup)?;
        let request = setup.request;
        iface
            .control_in(
                ControlIn {
                    control_type: map_kind(setup.kind),
                    recipient: map_recipient(setup.recipient),
                    request,
                    value: setup.value,
                    index: setup.index,
                    length,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| control_error(request, e, self.timeout))
    }

    #[instrument(skip(self, data), fields(request = setup.request, len = data.len()))]
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        let iface = self.control_iface(&setup)?;
        let request = setup.request;
        iface
            .control_out(
                ControlOut {
                    control_type: map_kind(setup.kind),
                    recipient: map_recipient(setup.recipient),
                    request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| control_error(request, e, self.timeout))
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let (number, kind) = self.endpoint_owner(endpoint)?;
        let iface = self.interface(number)?;
        let timeout_ms = self.timeout.as_millis() as u64;

        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);
        let completion = match kind {
            EndpointKind::Interrupt => iface
                .endpoint::<Interrupt, Out>(endpoint)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?
                .transfer_blocking(buf, self.timeout),
            _ => iface
                .endpoint::<Bulk, Out>(endpoint)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?
                .transfer_blocking(buf, self.timeout),
        };
        completion
            .into_result()
            .map_err(|e| map_transfer_error(e, timeout_ms, TransportError::WriteFailed))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self))]
    fn read(&self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.read_inner(endpoint, max_len, self.timeout)
    }

    fn read_timeout(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.read_inner(endpoint, max_len, timeout)
    }

    fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), TransportError> {
        let iface = self.interface(interface)?;
        iface
            .set_alt_setting(alt)
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: 0x0b,
                message: e.to_string(),
            })
    }

    fn set_configuration(&self, value: u8) -> Result<(), TransportError> {
        self.device
            .set_configuration(value)
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: 0x09,
                message: e.to_string(),
            })
    }

    fn reset(&self) -> Result<(), TransportError> {
        info!(path = %self.path, "Resetting device");
        self.device
            .reset()
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request: 0x00,
                message: e.to_string(),
            })
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

fn read_layout(device: &Device) -> Result<DeviceLayout, TransportError> {
    let config = device.active_configuration().map_err(|e| {
        warn!(error = %e, "Active configuration unreadable");
        TransportError::DescriptorUnreadable(e.to_string())
    })?;

    let alt_settings = config
        .interface_alt_settings()
        .map(|alt| {
            let name = alt.string_index().and_then(|index| {
                device
                    .get_string_descriptor(index, language_id::US_ENGLISH, DESCRIPTOR_TIMEOUT)
                    .wait()
                    .ok()
            });
            let endpoints = alt
                .endpoints()
                .map(|ep| EndpointInfo {
                    address: ep.address(),
                    kind: match ep.transfer_type() {
                        TransferType::Control => EndpointKind::Control,
                        TransferType::Isochronous => EndpointKind::Isochronous,
                        TransferType::Bulk => EndpointKind::Bulk,
                        TransferType::Interrupt => EndpointKind::Interrupt,
                    },
                    max_packet_size: ep.max_packet_size(),
                })
                .collect();
            let extra = alt
                .descriptors()
                .filter(|desc| !matches!(desc.descriptor_type(), 0x04 | 0x05))
                .flat_map(|desc| desc.to_vec())
                .collect();
            AltSetting {
                interface: alt.interface_number(),
                alt: alt.alternate_setting(),
                class: alt.class(),
                subclass: alt.subclass(),
                protocol: alt.protocol(),
                name,
                endpoints,
                extra,
            }
        })
        .collect();

    Ok(DeviceLayout {
        configuration: config.configuration_value(),
        alt_settings,
    })
}

fn round_up(len: usize, packet: usize) -> usize {
    let packet = packet.max(1);
    len.max(1).div_ceil(packet) * packet
}

fn map_speed(speed: Speed) -> UsbSpeed {
    match speed {
        Speed::Low => UsbSpeed::Low,
        Speed::High => UsbSpeed::High,
        Speed::Super => UsbSpeed::Super,
        Speed::SuperPlus => UsbSpeed::SuperPlus,
        _ => UsbSpeed::Full,
    }
}

fn map_kind(kind: RequestKind) -> ControlType {
    match kind {
        RequestKind::Standard => ControlType::Standard,
        RequestKind::Class => ControlType::Class,
        RequestKind::Vendor => ControlType::Vendor,
    }
}

fn map_recipient(recipient: Recipient) -> NusbRecipient {
    match recipient {
        Recipient::Device => NusbRecipient::Device,
        Recipient::Interface => NusbRecipient::Interface,
        Recipient::Endpoint => NusbRecipient::Endpoint,
        Recipient::Other => NusbRecipient::Other,
    }
}

fn map_transfer_error(
    err: TransferError,
    timeout_ms: u64,
    other: fn(String) -> TransportError,
) -> TransportError {
    match err {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Timeout { timeout_ms },
        e => other(e.to_string()),
    }
}

fn control_error(request: u8, err: TransferError, timeout: Duration) -> TransportError {
    match err {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        e => TransportError::ControlFailed {
            request,
            message: e.to_string(),
        },
    }
}
