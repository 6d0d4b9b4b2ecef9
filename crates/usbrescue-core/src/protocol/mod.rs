//! Boot ROM and loader protocol drivers.
//!
//! Each driver borrows an open `UsbTransport`, locates the interface and
//! endpoints it needs in the active configuration, and exposes the verbs of
//! its protocol. Drivers never outlive the phase that created them: a reset
//! or jump leaves the transport stale.

pub mod amlogic;
pub mod bcm;
pub mod cdc;
pub mod dfu;
pub mod fastboot;
pub mod fel;
pub mod hab;
pub mod hid;
pub mod memory;
pub mod rockchip;
pub mod sambamon;
pub mod sdp;

pub use amlogic::{Amlogic, AmlogicError};
pub use bcm::{BcmError, BcmRom, BootcodeServer};
pub use cdc::{CdcAcm, CdcError};
pub use dfu::{Dfu, DfuError, DfuState};
pub use fastboot::{Fastboot, FastbootCommand, FastbootError, is_fastboot};
pub use fel::{Fel, FelError};
pub use hid::HidReports;
pub use memory::MemoryOps;
pub use rockchip::{RockchipError, RockchipRom};
pub use sambamon::{SambaError, SambaMonitor};
pub use sdp::{Sdp, SdpError};

/// Split `blob` into consecutive chunks of `chunk_size` bytes, the last one
/// possibly shorter.
///
/// A `chunk_size` of zero is treated as one.
pub fn dnload_iter(blob: &[u8], chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    blob.chunks(chunk_size.max(1))
}
