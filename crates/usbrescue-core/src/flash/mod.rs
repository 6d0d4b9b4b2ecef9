//! Flashing through the gadgets a recovered U-Boot exposes: DFU, fastboot
//! and USB mass storage.

pub mod dfu;
pub mod fastboot;
pub mod uboot;
pub mod ums;

pub use dfu::DfuArtifact;
pub use uboot::{FastbootUboot, UbootCmdError};
