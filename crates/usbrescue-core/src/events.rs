//! Recovery events and the sinks that receive them.
//!
//! Every sequencer, dispatch call and flashing job reports through an
//! explicit `EventSink` handed to it at construction, so the CLI, the
//! factory supervisor and tests can each route diagnostics their own way.

use std::fmt;
use std::sync::Mutex;

use crate::usb::UsbPath;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of a board recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Resolving the ROM device.
    DeviceSearch,
    /// First stage download into the boot ROM.
    Phase1Transfer,
    /// Device is resetting, waiting for it to come back.
    ReenumerationWait,
    /// Later stage download into the loader started by the first stage.
    Phase2Transfer,
    /// Waiting for an operator before resuming.
    Paused,
    /// All operations complete.
    Done,
    /// Unrecoverable error.
    Failure,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryPhase::DeviceSearch => write!(f, "Device Search"),
            RecoveryPhase::Phase1Transfer => write!(f, "Phase 1 Transfer"),
            RecoveryPhase::ReenumerationWait => write!(f, "Re-enumeration Wait"),
            RecoveryPhase::Phase2Transfer => write!(f, "Phase 2 Transfer"),
            RecoveryPhase::Paused => write!(f, "Paused"),
            RecoveryPhase::Done => write!(f, "Done"),
            RecoveryPhase::Failure => write!(f, "Failure"),
        }
    }
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx,
    Rx,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted while recovering or flashing a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    DeviceConnected { vid: u16, pid: u16, path: UsbPath },
    /// Handle went stale (reset, jump, manifestation).
    DeviceLost,
    PhaseChanged {
        from: RecoveryPhase,
        to: RecoveryPhase,
    },
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    Log { level: LogLevel, message: String },
    Packet {
        direction: PacketDirection,
        length: usize,
    },
    Complete,
}

/// Observer trait for receiving recovery events.
pub trait EventSink: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &RecoveryEvent);

    fn log(&self, level: LogLevel, message: &str) {
        self.on_event(&RecoveryEvent::Log {
            level,
            message: message.to_string(),
        });
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    fn progress(&self, operation: &str, current: u64, total: u64) {
        self.on_event(&RecoveryEvent::Progress {
            operation: operation.to_string(),
            current,
            total,
        });
    }
}

/// Sink that discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: &RecoveryEvent) {}
}

/// Sink that logs events using tracing.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &RecoveryEvent) {
        match event {
            RecoveryEvent::DeviceConnected { vid, pid, path } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    path = %path,
                    "Device connected"
                );
            }
            RecoveryEvent::DeviceLost => {
                tracing::info!("Device handle released");
            }
            RecoveryEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            RecoveryEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            RecoveryEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            RecoveryEvent::Packet { direction, length } => {
                tracing::trace!(dir = %direction, len = length, "USB Packet");
            }
            RecoveryEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

/// Sink that keeps every event, for tests and per-board log capture.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecoveryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecoveryEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Target phases of every recorded transition, in order.
    pub fn phases(&self) -> Vec<RecoveryPhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecoveryEvent::PhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    /// Recorded log lines at `level` or above.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        let rank = |l: LogLevel| l as u8;
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecoveryEvent::Log { level: l, message } if rank(l) >= rank(level) => {
                    Some(message)
                }
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: &RecoveryEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(RecoveryPhase::ReenumerationWait.to_string(), "Re-enumeration Wait");
        assert_eq!(RecoveryPhase::Paused.to_string(), "Paused");
    }

    #[test]
    fn test_recording_sink_filters_levels() {
        let sink = RecordingSink::new();
        sink.info("hello");
        sink.log(LogLevel::Debug, "noise");
        sink.error("boom");
        sink.on_event(&RecoveryEvent::PhaseChanged {
            from: RecoveryPhase::DeviceSearch,
            to: RecoveryPhase::Phase1Transfer,
        });

        assert_eq!(sink.messages(LogLevel::Info), vec!["hello", "boom"]);
        assert_eq!(sink.phases(), vec![RecoveryPhase::Phase1Transfer]);
    }
}
