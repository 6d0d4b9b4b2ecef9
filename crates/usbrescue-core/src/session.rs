//! Recovery session: tuning knobs and the top-level run of one board.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::config::RecoveryConfig;
use crate::events::{EventSink, RecoveryEvent, RecoveryPhase, TracingSink};
use crate::recovery::{self, RecoveryContext};
use crate::usb::{DeviceProvider, ResolvePolicy};

/// Retry and timeout tuning, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between two device lookups while waiting for a device.
    pub reacquire_interval_ms: u64,
    /// Lookups attempted after the first one before giving up.
    pub reacquire_retries: u32,
    /// Timeout of a single USB transfer.
    pub transfer_timeout_ms: u64,
    /// Timeout of a single fastboot response read.
    pub fastboot_timeout_ms: u64,
    /// How long to wait for an i.MX SPL to show up after the ROM stage.
    pub spl_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reacquire_interval_ms: 1000,
            reacquire_retries: 9,
            transfer_timeout_ms: 5000,
            fastboot_timeout_ms: 5000,
            spl_wait_ms: 5000,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: SessionConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn fastboot_timeout(&self) -> Duration {
        Duration::from_millis(self.fastboot_timeout_ms)
    }

    pub fn spl_wait(&self) -> Duration {
        Duration::from_millis(self.spl_wait_ms)
    }

    /// Lookup policy handed to the USB provider.
    pub fn resolve_policy(&self) -> ResolvePolicy {
        ResolvePolicy {
            interval: Duration::from_millis(self.reacquire_interval_ms),
            retries: self.reacquire_retries,
            transfer_timeout: self.transfer_timeout(),
        }
    }
}

/// One board recovery, from ROM device lookup to the last stage.
pub struct RecoverySession {
    config: RecoveryConfig,
    tuning: SessionConfig,
    sink: Arc<dyn EventSink>,
}

impl RecoverySession {
    /// Create a session reporting through `tracing`.
    pub fn new(config: RecoveryConfig, tuning: SessionConfig) -> Self {
        Self::with_sink(config, tuning, Arc::new(TracingSink))
    }

    pub fn with_sink(config: RecoveryConfig, tuning: SessionConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            tuning,
            sink,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run the recovery flow of the configured SoC family.
    ///
    /// The final phase is `Done` or `Failure`; a failure is returned with
    /// the device and phase it happened in.
    #[instrument(skip(self, provider), fields(soc = %self.config.soc))]
    pub fn run(&self, provider: &mut dyn DeviceProvider) -> Result<()> {
        info!(usb = %self.config.usb, family = %self.config.soc.family(), "Starting recovery");
        let mut ctx = RecoveryContext::new(&self.config, &self.tuning, provider, self.sink.as_ref());
        match recovery::recover(&mut ctx) {
            Ok(()) => {
                ctx.enter(RecoveryPhase::Done);
                self.sink.on_event(&RecoveryEvent::Complete);
                info!("Recovery complete");
                Ok(())
            }
            Err(e) => {
                let phase = ctx.phase();
                ctx.enter(RecoveryPhase::Failure);
                error!(phase = %phase, error = %format!("{:#}", e), "Recovery failed");
                Err(e.context(format!("{} recovery failed during {}", self.config.soc, phase)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        let policy = config.resolve_policy();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.retries, 9);
        assert_eq!(config.fastboot_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "reacquire_retries = 3\nspl_wait_ms = 100\n").unwrap();
        let config = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(config.reacquire_retries, 3);
        assert_eq!(config.spl_wait(), Duration::from_millis(100));
        assert_eq!(config.transfer_timeout_ms, 5000);

        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }
}
