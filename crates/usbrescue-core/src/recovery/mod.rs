//! Board recovery sequencers.
//!
//! One submodule per SoC family drives the ROM device through every stage
//! up to a running U-Boot. They all work on a [`RecoveryContext`], which
//! owns device lookups and phase reporting, and install each stage through
//! [`crate::firmware::run_firmware`].

mod am6x;
mod amlogic;
mod bcm;
mod imx;
mod keembay;
pub mod machine;
mod rockchip;
mod sama5;
mod stm32mp;
mod sunxi;
mod zynqmp;

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::events::{EventSink, RecoveryEvent, RecoveryPhase};
use crate::firmware::{self, FirmwareContext};
use crate::session::SessionConfig;
use crate::soc::SocFamily;
use crate::transport::{ObservableTransport, UsbTransport};
use crate::usb::{DeviceProvider, ReadyCheck, UsbCandidate, UsbPath};

pub use machine::{PhaseMachine, TransitionError};

/// Shared state of one board recovery.
pub struct RecoveryContext<'a> {
    pub config: &'a RecoveryConfig,
    pub session: &'a SessionConfig,
    pub sink: &'a dyn EventSink,
    provider: &'a mut dyn DeviceProvider,
    machine: PhaseMachine,
    /// Port path of the last device handed out.
    path: Option<UsbPath>,
}

impl<'a> RecoveryContext<'a> {
    pub fn new(
        config: &'a RecoveryConfig,
        session: &'a SessionConfig,
        provider: &'a mut dyn DeviceProvider,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            config,
            session,
            sink,
            provider,
            machine: PhaseMachine::new(),
            path: None,
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.machine.phase()
    }

    /// Move to `phase`. Transitions the machine refuses are logged and
    /// ignored.
    pub fn enter(&mut self, phase: RecoveryPhase) {
        if let Err(e) = self.machine.transition(phase, self.sink) {
            warn!(error = %e, "Ignoring phase change");
        }
    }

    fn connected(&mut self, device: Box<dyn UsbTransport>) -> Box<dyn UsbTransport> {
        self.sink.on_event(&RecoveryEvent::DeviceConnected {
            vid: device.vendor_id(),
            pid: device.product_id(),
            path: device.path().clone(),
        });
        self.path = Some(device.path().clone());
        device
    }

    fn last_path(&self) -> Result<UsbPath> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => anyhow::bail!("No device has been acquired yet"),
        }
    }

    /// Open the ROM device at the configured address.
    pub fn acquire(&mut self) -> Result<Box<dyn UsbTransport>> {
        let address = &self.config.usb;
        info!(usb = %address, "Looking for ROM device...");
        let device = self
            .provider
            .acquire(address)
            .with_context(|| format!("opening ROM device {}", address))?;
        Ok(self.connected(device))
    }

    fn lost(&mut self) {
        self.sink.on_event(&RecoveryEvent::DeviceLost);
        self.enter(RecoveryPhase::ReenumerationWait);
    }

    /// Reopen the device at the last known path after it reset.
    pub fn reacquire(&mut self) -> Result<Box<dyn UsbTransport>> {
        self.reacquire_until(&|_| true)
    }

    /// Reopen the device at the last known path once `ready` accepts it.
    pub fn reacquire_until(&mut self, ready: ReadyCheck<'_>) -> Result<Box<dyn UsbTransport>> {
        let path = self.last_path()?;
        self.lost();
        debug!(path = %path, "Waiting for device to re-enumerate");
        let device = self
            .provider
            .reacquire_until(&path, ready)
            .with_context(|| format!("reopening device at {}", path))?;
        Ok(self.connected(device))
    }

    /// Open the device the stage installed by `artifact` enumerates as.
    /// Its `usb` key names the address when the stage moves to another
    /// one, otherwise the device is expected back at the same path.
    pub fn reacquire_after(&mut self, artifact: &str) -> Result<Box<dyn UsbTransport>> {
        let Some(address) = self.config.usb_after(artifact) else {
            return self.reacquire();
        };
        self.lost();
        info!(usb = %address, artifact, "Looking for next stage device...");
        let device = self
            .provider
            .acquire(&address)
            .with_context(|| format!("opening device {} started by '{}'", address, artifact))?;
        Ok(self.connected(device))
    }

    /// Wait for any of `candidates`. Returns the matching index.
    pub fn find_any(
        &mut self,
        candidates: &[UsbCandidate],
        timeout: Duration,
    ) -> Result<(usize, Box<dyn UsbTransport>)> {
        self.lost();
        let (index, device) = self
            .provider
            .find_any(candidates, timeout)
            .context("waiting for next stage device")?;
        info!(candidate = candidates[index].name, "Found device");
        Ok((index, self.connected(device)))
    }

    pub fn sleep(&self, duration: Duration) {
        self.provider.sleep(duration);
    }

    /// Run `f` with the view of this recovery that firmware handlers get.
    pub fn with_firmware<T>(&self, f: impl FnOnce(&FirmwareContext<'_>) -> T) -> T {
        let sleep = |d: Duration| self.provider.sleep(d);
        let ctx = FirmwareContext {
            config: self.config,
            session: self.session,
            sink: self.sink,
            sleep: &sleep,
        };
        f(&ctx)
    }

    /// Install artifact `name` (part `subfw`, or empty) on `device`.
    ///
    /// The first install on a ROM device is phase 1, installs after a
    /// re-enumeration are phase 2.
    pub fn run_firmware(&mut self, device: &dyn UsbTransport, name: &str, subfw: &str) -> Result<()> {
        match self.phase() {
            RecoveryPhase::DeviceSearch => self.enter(RecoveryPhase::Phase1Transfer),
            RecoveryPhase::ReenumerationWait => self.enter(RecoveryPhase::Phase2Transfer),
            _ => {}
        }
        let observed = ObservableTransport::new(device, self.sink);
        self.with_firmware(|ctx| firmware::run_firmware(ctx, &observed, name, subfw))
    }

    /// Sleep for the `delay` set on artifact `name`, if any.
    pub fn artifact_delay(&self, name: &str) {
        if let Some(ms) = self.config.firmware.get(name).and_then(|a| a.delay) {
            info!("Sleeping {}ms", ms);
            self.sleep(Duration::from_millis(ms));
        }
    }
}

/// Bring the board from its ROM to a running U-Boot.
pub fn recover(ctx: &mut RecoveryContext<'_>) -> Result<()> {
    match ctx.config.soc.family() {
        SocFamily::Stm32mp => stm32mp::recover(ctx),
        SocFamily::Imx => imx::recover(ctx),
        SocFamily::Sunxi => sunxi::recover(ctx),
        SocFamily::Am6x => am6x::recover(ctx),
        SocFamily::Amlogic => amlogic::recover(ctx),
        SocFamily::Bcm => bcm::recover(ctx),
        SocFamily::Rockchip => rockchip::recover(ctx),
        SocFamily::Sama5 => sama5::recover(ctx),
        SocFamily::Zynqmp => zynqmp::recover(ctx),
        SocFamily::Keembay => keembay::recover(ctx),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::FirmwareSet;
    use crate::events::RecordingSink;
    use crate::firmware::tests::{firmware_set, recovery_config};
    use crate::transport::{MockProvider, MockTransport};

    /// Run the recovery of `soc` with `files` as artifacts against the
    /// devices queued on `provider`.
    pub(crate) fn run_recovery(
        soc: &str,
        files: &[(&str, &[u8])],
        edit: impl FnOnce(&mut FirmwareSet),
        provider: &MockProvider,
    ) -> (Result<()>, RecordingSink) {
        let dir = tempfile::tempdir().unwrap();
        let mut set = firmware_set(dir.path(), files);
        edit(&mut set);
        let config = recovery_config(soc, set);
        let session = SessionConfig::default();
        let sink = RecordingSink::new();
        let mut provider = provider.clone();
        let result = {
            let mut ctx = RecoveryContext::new(&config, &session, &mut provider, &sink);
            recover(&mut ctx)
        };
        (result, sink)
    }

    #[test]
    fn test_reacquire_needs_a_previous_device() {
        let config = recovery_config("stm32mp15", FirmwareSet::default());
        let session = SessionConfig::default();
        let mut provider = MockProvider::new();
        let sink = RecordingSink::new();
        let mut ctx = RecoveryContext::new(&config, &session, &mut provider, &sink);
        assert!(ctx.reacquire().is_err());
    }

    #[test]
    fn test_usb_override_selects_next_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = firmware_set(dir.path(), &[("tf-a", b"x")]);
        let mut artifact = set.get("tf-a").unwrap().clone();
        artifact.usb = Some("0483:5720".to_string());
        set.insert("tf-a", artifact);
        let config = recovery_config("stm32mp15", set);
        let session = SessionConfig::default();
        let provider = MockProvider::new();
        provider.push(MockTransport::new());
        provider.push(MockTransport::new());
        provider.push(MockTransport::new());
        let mut handle = provider.clone();
        let sink = RecordingSink::new();
        let mut ctx = RecoveryContext::new(&config, &session, &mut handle, &sink);

        ctx.acquire().unwrap();
        ctx.reacquire_after("tf-a").unwrap();
        ctx.reacquire_after("fip").unwrap();
        assert_eq!(
            provider.calls(),
            vec!["acquire 1-1", "acquire 0483:5720", "reacquire 1-1"]
        );
    }
}
