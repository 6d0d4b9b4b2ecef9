//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod observable;
pub mod traits;

pub use mock::{MockFailure, MockIo, MockProvider, MockTransport, bulk_layout, dfu_layout, fastboot_layout};
pub use nusb::NusbTransport;
pub use observable::ObservableTransport;
pub use traits::{
    AltSetting, BulkPair, ControlSetup, DeviceLayout, EndpointInfo, EndpointKind, Recipient,
    RequestKind, TransportError, UsbSpeed, UsbTransport,
};
