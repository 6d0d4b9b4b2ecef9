//! USB device resolution.
//!
//! Boards are tracked by their physical bus/port path rather than by
//! VID:PID, since the IDs change between boot stages and repeat when
//! several boards are attached. Every lookup starts from a fresh bus scan;
//! device references from a previous scan are dropped before rescanning.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use nusb::MaybeFuture;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::transport::{NusbTransport, TransportError, UsbTransport};

/// Physical location of a device: bus identifier plus hub port chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbPath {
    pub bus: String,
    pub ports: Vec<u8>,
}

impl UsbPath {
    pub fn new(bus: impl Into<String>, ports: Vec<u8>) -> Self {
        Self {
            bus: bus.into(),
            ports,
        }
    }

    /// Bus identifiers compare numerically when both sides are numbers,
    /// so "001" and "1" name the same bus.
    pub fn same_location(&self, other: &UsbPath) -> bool {
        let same_bus = match (self.bus.parse::<u32>(), other.bus.parse::<u32>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.bus == other.bus,
        };
        same_bus && self.ports == other.ports
    }
}

impl fmt::Display for UsbPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports: Vec<String> = self.ports.iter().map(|p| p.to_string()).collect();
        write!(f, "{}-{}", self.bus, ports.join("."))
    }
}

impl FromStr for UsbPath {
    type Err = UsbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UsbError::InvalidAddress(s.to_string());
        let (bus, ports) = s.split_once('-').ok_or_else(invalid)?;
        if bus.is_empty() || ports.is_empty() {
            return Err(invalid());
        }
        let ports = ports
            .split('.')
            .map(|p| p.parse::<u8>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UsbPath::new(bus, ports))
    }
}

/// How the operator designates the device to recover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbAddress {
    /// `VVVV:PPPP`, must match exactly one attached device.
    Ids { vid: u16, pid: u16 },
    /// `bus-port1.port2...`
    Path(UsbPath),
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbAddress::Ids { vid, pid } => write!(f, "{:04x}:{:04x}", vid, pid),
            UsbAddress::Path(path) => write!(f, "{}", path),
        }
    }
}

impl FromStr for UsbAddress {
    type Err = UsbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((vid, pid)) = s.split_once(':') {
            let parse = |v: &str| {
                u16::from_str_radix(v, 16).map_err(|_| UsbError::InvalidAddress(s.to_string()))
            };
            return Ok(UsbAddress::Ids {
                vid: parse(vid)?,
                pid: parse(pid)?,
            });
        }
        s.parse::<UsbPath>().map(UsbAddress::Path)
    }
}

#[derive(Error, Debug)]
pub enum UsbError {
    #[error("Invalid USB address '{0}', expected vid:pid or bus-port1.port2...")]
    InvalidAddress(String),

    #[error("No USB device found at {0}")]
    NotFound(String),

    #[error("Ambiguous USB address {address}: matches devices at {paths:?}")]
    Ambiguous { address: String, paths: Vec<String> },

    #[error("Permission denied while opening USB device {path}")]
    PermissionDenied { path: String },

    #[error("USB device {path} present but its configuration is unreadable: {message}")]
    DescriptorUnreadable { path: String, message: String },

    #[error(
        "Two root hubs were assigned the same bus number; update the USB driver stack and retry"
    )]
    DuplicateBusNumber,

    #[error("Failed to enumerate USB devices: {0}")]
    Enumeration(String),

    #[error("Failed to open USB device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: TransportError,
    },
}

impl UsbError {
    /// Device may still be enumerating; polling again can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UsbError::NotFound(_) | UsbError::DescriptorUnreadable { .. }
        )
    }

    fn from_open(path: &UsbPath, err: TransportError) -> Self {
        match err {
            TransportError::AccessDenied(_) => UsbError::PermissionDenied {
                path: path.to_string(),
            },
            TransportError::DescriptorUnreadable(message) => UsbError::DescriptorUnreadable {
                path: path.to_string(),
                message,
            },
            source => UsbError::Open {
                path: path.to_string(),
                source,
            },
        }
    }
}

/// Identity snapshot of an enumerated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub vid: u16,
    pub pid: u16,
    /// bcdDevice.
    pub release: u16,
    pub path: UsbPath,
}

impl DeviceEntry {
    pub fn matches(&self, address: &UsbAddress) -> bool {
        match address {
            UsbAddress::Ids { vid, pid } => self.vid == *vid && self.pid == *pid,
            UsbAddress::Path(path) => self.path.same_location(path),
        }
    }
}

/// Pick the single entry an address designates.
pub fn select<'a>(
    entries: &'a [DeviceEntry],
    address: &UsbAddress,
) -> Result<&'a DeviceEntry, UsbError> {
    let found: Vec<&DeviceEntry> = entries.iter().filter(|e| e.matches(address)).collect();
    match found.as_slice() {
        [] => Err(UsbError::NotFound(address.to_string())),
        [entry] => Ok(entry),
        many => Err(UsbError::Ambiguous {
            address: address.to_string(),
            paths: many.iter().map(|e| e.path.to_string()).collect(),
        }),
    }
}

/// Device IDs a re-enumerated stage may show up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbCandidate {
    pub name: &'static str,
    pub vid: u16,
    pub pid: u16,
    pub release: RangeInclusive<u16>,
}

impl UsbCandidate {
    pub fn matches(&self, entry: &DeviceEntry) -> bool {
        entry.vid == self.vid && entry.pid == self.pid && self.release.contains(&entry.release)
    }
}

/// Retry policy for device lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvePolicy {
    pub interval: Duration,
    pub retries: u32,
    pub transfer_timeout: Duration,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            retries: 9,
            transfer_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one bus scan. Rebuilt from scratch on every lookup.
#[derive(Default)]
pub struct UsbContext {
    devices: Vec<(DeviceEntry, nusb::DeviceInfo)>,
}

impl UsbContext {
    /// Drop every reference from the previous scan and enumerate again.
    #[instrument(level = "debug", skip(self))]
    pub fn rescan(&mut self) -> Result<(), UsbError> {
        self.devices.clear();
        self.scan()?;
        if cfg!(target_os = "windows") && Self::has_duplicate_buses()? {
            warn!("Duplicate root hub bus numbers, rescanning");
            self.devices.clear();
            self.scan()?;
            if Self::has_duplicate_buses()? {
                return Err(UsbError::DuplicateBusNumber);
            }
        }
        Ok(())
    }

    fn scan(&mut self) -> Result<(), UsbError> {
        let list = nusb::list_devices()
            .wait()
            .map_err(|e| UsbError::Enumeration(e.to_string()))?;
        self.devices = list
            .map(|info| {
                let entry = DeviceEntry {
                    vid: info.vendor_id(),
                    pid: info.product_id(),
                    release: info.device_version(),
                    path: UsbPath::new(info.bus_id(), info.port_chain().to_vec()),
                };
                (entry, info)
            })
            .collect();
        debug!(count = self.devices.len(), "USB scan complete");
        Ok(())
    }

    fn has_duplicate_buses() -> Result<bool, UsbError> {
        let buses: Vec<String> = nusb::list_buses()
            .wait()
            .map_err(|e| UsbError::Enumeration(e.to_string()))?
            .map(|bus| bus.bus_id().to_string())
            .collect();
        let mut unique = buses.clone();
        unique.sort();
        unique.dedup();
        Ok(unique.len() < buses.len())
    }

    pub fn entries(&self) -> Vec<DeviceEntry> {
        self.devices.iter().map(|(entry, _)| entry.clone()).collect()
    }

    fn info_for(&self, entry: &DeviceEntry) -> Option<&nusb::DeviceInfo> {
        self.devices
            .iter()
            .find(|(e, _)| e.path.same_location(&entry.path))
            .map(|(_, info)| info)
    }
}

/// Readiness check applied to a freshly reacquired device.
pub type ReadyCheck<'a> = &'a dyn Fn(&dyn UsbTransport) -> bool;

/// Source of open device handles. Sequencers only talk to USB through
/// this seam, so recovery flows can run against mock devices.
pub trait DeviceProvider: Send {
    /// Resolve an address to exactly one device and open it.
    fn acquire(&mut self, address: &UsbAddress) -> Result<Box<dyn UsbTransport>, UsbError>;

    /// Reopen the device at `path` after a reset, polling until its
    /// configuration is readable and `ready` accepts it.
    fn reacquire_until(
        &mut self,
        path: &UsbPath,
        ready: ReadyCheck<'_>,
    ) -> Result<Box<dyn UsbTransport>, UsbError>;

    /// Wait up to `timeout` for any of `candidates` to appear. Returns the
    /// index of the candidate that matched.
    fn find_any(
        &mut self,
        candidates: &[UsbCandidate],
        timeout: Duration,
    ) -> Result<(usize, Box<dyn UsbTransport>), UsbError>;

    fn reacquire(&mut self, path: &UsbPath) -> Result<Box<dyn UsbTransport>, UsbError> {
        self.reacquire_until(path, &|_| true)
    }

    /// Pause between polls.
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Provider backed by the host USB stack.
pub struct NusbProvider {
    context: UsbContext,
    policy: ResolvePolicy,
}

impl NusbProvider {
    pub fn new(policy: ResolvePolicy) -> Self {
        Self {
            context: UsbContext::default(),
            policy,
        }
    }

    /// Fresh scan of everything attached.
    pub fn list(&mut self) -> Result<Vec<DeviceEntry>, UsbError> {
        self.context.rescan()?;
        Ok(self.context.entries())
    }

    fn open(&self, entry: &DeviceEntry) -> Result<Box<dyn UsbTransport>, UsbError> {
        let info = self
            .context
            .info_for(entry)
            .ok_or_else(|| UsbError::NotFound(entry.path.to_string()))?;
        let transport = NusbTransport::open(info)
            .map_err(|e| UsbError::from_open(&entry.path, e))?
            .with_timeout(self.policy.transfer_timeout);
        Ok(Box::new(transport))
    }

    fn try_acquire(&mut self, address: &UsbAddress) -> Result<Box<dyn UsbTransport>, UsbError> {
        self.context.rescan()?;
        let entries = self.context.entries();
        let entry = select(&entries, address)?;
        self.open(entry)
    }
}

impl DeviceProvider for NusbProvider {
    #[instrument(level = "info", skip(self, address), fields(address = %address))]
    fn acquire(&mut self, address: &UsbAddress) -> Result<Box<dyn UsbTransport>, UsbError> {
        let mut attempt = 0;
        loop {
            match self.try_acquire(address) {
                Ok(transport) => {
                    info!(path = %transport.path(), "Device resolved");
                    return Ok(transport);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.retries => {
                    debug!(attempt, error = %e, "Device not ready, retrying");
                    attempt += 1;
                    self.sleep(self.policy.interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(level = "info", skip(self, path, ready), fields(path = %path))]
    fn reacquire_until(
        &mut self,
        path: &UsbPath,
        ready: ReadyCheck<'_>,
    ) -> Result<Box<dyn UsbTransport>, UsbError> {
        let address = UsbAddress::Path(path.clone());
        let mut last = UsbError::NotFound(path.to_string());
        for attempt in 0..=self.policy.retries {
            if attempt > 0 {
                self.sleep(self.policy.interval);
            }
            match self.try_acquire(&address) {
                Ok(transport) if ready(transport.as_ref()) => return Ok(transport),
                Ok(_) => {
                    debug!(attempt, "Device present but not ready yet");
                    last = UsbError::NotFound(path.to_string());
                }
                Err(e) if e.is_retryable() => {
                    debug!(attempt, error = %e, "Waiting for device");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    #[instrument(level = "info", skip(self, candidates))]
    fn find_any(
        &mut self,
        candidates: &[UsbCandidate],
        timeout: Duration,
    ) -> Result<(usize, Box<dyn UsbTransport>), UsbError> {
        let start = Instant::now();
        loop {
            self.context.rescan()?;
            let entries = self.context.entries();
            for (index, candidate) in candidates.iter().enumerate() {
                debug!(config = candidate.name, "Trying USB config");
                if let Some(entry) = entries.iter().find(|e| candidate.matches(e)) {
                    info!(config = candidate.name, path = %entry.path, "Found device");
                    return Ok((index, self.open(entry)?));
                }
            }
            if start.elapsed() >= timeout {
                let names: Vec<&str> = candidates.iter().map(|c| c.name).collect();
                return Err(UsbError::NotFound(names.join(", ")));
            }
            self.sleep(self.policy.interval);
        }
    }
}
