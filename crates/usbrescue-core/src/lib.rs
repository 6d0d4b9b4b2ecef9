//! usbrescue-core: USB recovery and flashing of embedded boards.
//!
//! Boards whose boot ROM exposes a USB download mode (DFU, SDP, FEL,
//! fastboot, SAM-BA and the AmLogic, Rockchip and BCM vendor protocols) are
//! brought up to a running U-Boot, which can then write their storage.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **USB**: device resolution by ids or port path, tracked across resets
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Protocol**: one driver per boot ROM or loader protocol
//! - **Image**: firmware image parsers and encoders
//! - **Firmware**: which protocol calls install a named artifact
//! - **Recovery**: per SoC family sequencers, from ROM to U-Boot
//! - **Flash**: DFU, fastboot and mass storage writes through U-Boot
//! - **Factory**: batches of boards, each through recovery and a task list
//! - **Events**: observer pattern for UI decoupling
//! - **Session**: tuning and the top-level run of one board
//!
//! # Example
//!
//! ```no_run
//! use usbrescue_core::config::{FirmwareSet, RecoveryConfig};
//! use usbrescue_core::session::{RecoverySession, SessionConfig};
//! use usbrescue_core::soc::SocModel;
//! use usbrescue_core::usb::NusbProvider;
//!
//! let soc = SocModel::lookup("stm32mp15").expect("known SoC");
//! let firmware = FirmwareSet::from_yaml_str(
//!     "{tf-a: {path: tf-a.stm32}, fip: {path: fip.bin}}",
//!     "example",
//! )?;
//! let config = RecoveryConfig::new(soc, None, firmware)?;
//! let tuning = SessionConfig::default();
//! let mut provider = NusbProvider::new(tuning.resolve_policy());
//! RecoverySession::new(config, tuning).run(&mut provider)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod events;
pub mod factory;
pub mod firmware;
pub mod flash;
pub mod image;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod soc;
pub mod transport;
pub mod usb;

// Re-exports for convenience
pub use config::{ConfigError, FirmwareArtifact, FirmwareSet, RecoveryConfig, parse_size};
pub use events::{EventSink, LogLevel, RecoveryEvent, RecoveryPhase, TracingSink};
pub use factory::{BatchConfig, BoardPhase, FactorySession, Task};
pub use session::{RecoverySession, SessionConfig};
pub use soc::{SocFamily, SocModel};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
pub use usb::{DeviceProvider, NusbProvider, UsbAddress, UsbError, UsbPath};
