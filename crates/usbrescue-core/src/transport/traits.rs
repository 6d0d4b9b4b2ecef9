//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait every protocol driver talks through,
//! plus the descriptor model drivers inspect to find their interface,
//! alternate setting and endpoints.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::usb::UsbPath;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Access to device denied: {0}")]
    AccessDenied(String),

    #[error("Configuration descriptor unreadable: {0}")]
    DescriptorUnreadable(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint 0x{address:02X} not present in active configuration")]
    EndpointNotFound { address: u8 },

    #[error("Control transfer (request 0x{request:02X}) failed: {message}")]
    ControlFailed { request: u8, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Endpoint stalled")]
    Stall,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts and stalls while polling may clear on a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout { .. } | TransportError::Stall)
    }
}

/// bmRequestType "type" field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

/// bmRequestType "recipient" field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup packet of a control transfer, minus direction and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub kind: RequestKind,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    pub fn class_interface(request: u8, value: u16, interface: u8) -> Self {
        Self {
            kind: RequestKind::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: interface as u16,
        }
    }

    pub fn vendor_device(request: u8, value: u16, index: u16) -> Self {
        Self {
            kind: RequestKind::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    /// Raw bmRequestType byte for the given direction.
    pub fn request_type(&self, device_to_host: bool) -> u8 {
        let dir = if device_to_host { 0x80 } else { 0x00 };
        let kind = match self.kind {
            RequestKind::Standard => 0x00,
            RequestKind::Class => 0x20,
            RequestKind::Vendor => 0x40,
        };
        let recipient = match self.recipient {
            Recipient::Device => 0x00,
            Recipient::Interface => 0x01,
            Recipient::Endpoint => 0x02,
            Recipient::Other => 0x03,
        };
        dir | kind | recipient
    }
}

/// Negotiated bus speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl fmt::Display for UsbSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbSpeed::Low => write!(f, "low-speed"),
            UsbSpeed::Full => write!(f, "full-speed"),
            UsbSpeed::High => write!(f, "high-speed"),
            UsbSpeed::Super => write!(f, "super-speed"),
            UsbSpeed::SuperPlus => write!(f, "super-speed+"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: usize,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// One interface alternate setting of the active configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltSetting {
    pub interface: u8,
    pub alt: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// iInterface string, if the device provides one.
    pub name: Option<String>,
    pub endpoints: Vec<EndpointInfo>,
    /// Class-specific descriptors following the interface descriptor.
    pub extra: Vec<u8>,
}

impl AltSetting {
    fn endpoint(&self, kind: EndpointKind, input: bool) -> Option<&EndpointInfo> {
        self.endpoints
            .iter()
            .find(|ep| ep.kind == kind && ep.is_in() == input)
    }

    /// Walk the class-specific descriptors looking for `descriptor_type`.
    pub fn class_descriptor(&self, descriptor_type: u8) -> Option<&[u8]> {
        let mut rest = self.extra.as_slice();
        while rest.len() >= 2 {
            let len = rest[0] as usize;
            if len < 2 || len > rest.len() {
                return None;
            }
            if rest[1] == descriptor_type {
                return Some(&rest[..len]);
            }
            rest = &rest[len..];
        }
        None
    }
}

/// A bulk IN/OUT endpoint pair on one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkPair {
    pub interface: u8,
    pub ep_in: u8,
    pub ep_out: u8,
    pub max_packet_size: usize,
}

/// Descriptor layout of the active configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLayout {
    pub configuration: u8,
    pub alt_settings: Vec<AltSetting>,
}

impl DeviceLayout {
    /// First interface (alt setting 0) that carries both bulk directions.
    pub fn bulk_pair(&self) -> Option<BulkPair> {
        self.alt_settings
            .iter()
            .filter(|alt| alt.alt == 0)
            .find_map(Self::pair_of)
    }

    /// Bulk pair of a specific interface.
    pub fn bulk_pair_on(&self, interface: u8) -> Option<BulkPair> {
        self.alt_settings
            .iter()
            .filter(|alt| alt.interface == interface && alt.alt == 0)
            .find_map(Self::pair_of)
    }

    fn pair_of(alt: &AltSetting) -> Option<BulkPair> {
        let ep_in = alt.endpoint(EndpointKind::Bulk, true)?;
        let ep_out = alt.endpoint(EndpointKind::Bulk, false)?;
        Some(BulkPair {
            interface: alt.interface,
            ep_in: ep_in.address,
            ep_out: ep_out.address,
            max_packet_size: ep_out.max_packet_size,
        })
    }

    /// First alt setting whose interface class matches.
    pub fn interface_with_class(&self, class: u8) -> Option<&AltSetting> {
        self.alt_settings.iter().find(|alt| alt.class == class)
    }

    pub fn interrupt_in(&self, interface: u8) -> Option<u8> {
        self.alt_settings
            .iter()
            .filter(|alt| alt.interface == interface)
            .find_map(|alt| alt.endpoint(EndpointKind::Interrupt, true))
            .map(|ep| ep.address)
    }

    /// Alternate settings of one interface.
    pub fn alts_of(&self, interface: u8) -> impl Iterator<Item = &AltSetting> {
        self.alt_settings
            .iter()
            .filter(move |alt| alt.interface == interface)
    }

    pub fn endpoint(&self, address: u8) -> Option<(u8, &EndpointInfo)> {
        self.alt_settings.iter().find_map(|alt| {
            alt.endpoints
                .iter()
                .find(|ep| ep.address == address)
                .map(|ep| (alt.interface, ep))
        })
    }
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Device-to-host control transfer.
    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError>;

    /// Host-to-device control transfer.
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError>;

    /// Write raw bytes to a bulk or interrupt OUT endpoint.
    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError>;

    /// Read at most `max_len` bytes from a bulk or interrupt IN endpoint.
    fn read(&self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Like `read`, with a one-off timeout instead of the transport default.
    fn read_timeout(
        &self,
        endpoint: u8,
        max_len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.read(endpoint, max_len)
    }

    /// Descriptor layout of the active configuration.
    fn layout(&self) -> &DeviceLayout;

    fn set_alt_setting(&self, interface: u8, alt: u8) -> Result<(), TransportError>;

    fn set_configuration(&self, value: u8) -> Result<(), TransportError>;

    /// Port reset. The handle is stale afterwards.
    fn reset(&self) -> Result<(), TransportError>;

    fn speed(&self) -> UsbSpeed;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;

    /// Physical location the handle was opened from.
    fn path(&self) -> &UsbPath;
}
