//! USB Device Firmware Upgrade (DFU 1.1 and ST DfuSe) host driver.

use std::fmt;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::dnload_iter;
use crate::events::EventSink;
use crate::transport::{ControlSetup, TransportError, UsbTransport};

const DFU_DETACH: u8 = 0;
const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_GETSTATE: u8 = 5;
const DFU_ABORT: u8 = 6;

const DFU_CLASS: u8 = 0xfe;
const DFU_SUBCLASS: u8 = 0x01;
const DFU_FUNCTIONAL_DESCRIPTOR: u8 = 0x21;
const DEFAULT_TRANSFER_SIZE: usize = 1024;
const DETACH_TIMEOUT_MS: u16 = 0x7530;
const STM32_PHASE_UPLOAD_LEN: u16 = 512;

/// Retries of a status read that timed out.
const STATUS_RETRIES: u32 = 3;
const STATUS_RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("No DFU interface in active configuration")]
    InterfaceNotFound,

    #[error("No DFU alternate setting named '{0}'")]
    PartitionNotFound(String),

    #[error("Unexpected DFU state {actual} (expected {expected})")]
    UnexpectedState { expected: DfuState, actual: DfuState },

    #[error("DFU device reported {status} in state {state}")]
    DeviceStatus { status: &'static str, state: DfuState },

    #[error("Short DFU status reply ({0} bytes)")]
    ShortStatus(usize),

    #[error("Range 0x{offset:x}+0x{size:x} exceeds blob of 0x{len:x} bytes")]
    OutOfRange { offset: usize, size: usize, len: usize },

    #[error("Empty UPLOAD reply")]
    EmptyUpload,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// DFU device states (bState).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl From<u8> for DfuState {
    fn from(value: u8) -> Self {
        match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DnloadSync,
            4 => DfuState::DnBusy,
            5 => DfuState::DnloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DnBusy => "dfuDNBUSY",
            DfuState::DnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::Error => "dfuERROR",
            DfuState::Unknown(v) => return write!(f, "unknown({})", v),
        };
        f.write_str(name)
    }
}

/// Name of a bStatus code.
pub fn status_name(status: u8) -> &'static str {
    const NAMES: [&str; 16] = [
        "OK",
        "errTARGET",
        "errFILE",
        "errWRITE",
        "errERASE",
        "errCHECK_ERASED",
        "errPROG",
        "errVERIFY",
        "errADDRESS",
        "errNOTDONE",
        "errFIRMWARE",
        "errVENDOR",
        "errUSBR",
        "errPOR",
        "errUNKNOWN",
        "errSTALLEDPKT",
    ];
    NAMES.get(status as usize).copied().unwrap_or("errUNKNOWN")
}

/// Decoded DFU_GETSTATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: Duration,
    pub state: DfuState,
}

impl DfuStatus {
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < 6 {
            return Err(DfuError::ShortStatus(data.len()));
        }
        let poll_ms = u32::from_le_bytes([data[1], data[2], data[3], 0]);
        Ok(Self {
            status: data[0],
            poll_timeout: Duration::from_millis(poll_ms as u64),
            state: DfuState::from(data[4]),
        })
    }
}

/// Alternate setting of the DFU interface whose name matches `name`.
///
/// With `match_prefix` the name only has to start with `name`. When several
/// settings match, the last one wins.
pub fn search_partid(transport: &dyn UsbTransport, name: &str, match_prefix: bool) -> Option<u8> {
    let layout = transport.layout();
    let iface = layout
        .alt_settings
        .iter()
        .find(|alt| alt.class == DFU_CLASS && alt.subclass == DFU_SUBCLASS)?
        .interface;
    layout
        .alts_of(iface)
        .filter(|alt| {
            alt.name.as_deref().is_some_and(|n| {
                if match_prefix {
                    n.starts_with(name)
                } else {
                    n == name
                }
            })
        })
        .map(|alt| alt.alt)
        .last()
}

/// Alternate settings of the DFU interface, empty when there is none.
pub fn list_partids(transport: &dyn UsbTransport) -> Vec<u8> {
    let layout = transport.layout();
    let Some(iface) = layout
        .alt_settings
        .iter()
        .find(|alt| alt.class == DFU_CLASS && alt.subclass == DFU_SUBCLASS)
        .map(|alt| alt.interface)
    else {
        return Vec::new();
    };
    layout.alts_of(iface).map(|alt| alt.alt).collect()
}

/// DFU session on one device handle.
pub struct Dfu<'a> {
    transport: &'a dyn UsbTransport,
    sink: &'a dyn EventSink,
    interface: u8,
    transfer_size: usize,
    first_block: u16,
    partid: u8,
}

impl<'a> Dfu<'a> {
    /// Locate the DFU interface. `stm32` selects DfuSe block numbering.
    pub fn new(
        transport: &'a dyn UsbTransport,
        sink: &'a dyn EventSink,
        stm32: bool,
    ) -> Result<Self, DfuError> {
        let layout = transport.layout();
        let interface = layout
            .alt_settings
            .iter()
            .find(|alt| alt.class == DFU_CLASS && alt.subclass == DFU_SUBCLASS)
            .ok_or(DfuError::InterfaceNotFound)?
            .interface;

        let transfer_size = layout
            .alts_of(interface)
            .find_map(|alt| alt.class_descriptor(DFU_FUNCTIONAL_DESCRIPTOR))
            .filter(|desc| desc.len() >= 7)
            .map(|desc| u16::from_le_bytes([desc[5], desc[6]]) as usize)
            .filter(|&size| size > 0)
            .unwrap_or(DEFAULT_TRANSFER_SIZE);
        debug!(interface, transfer_size, "DFU interface found");

        Ok(Self {
            transport,
            sink,
            interface,
            transfer_size,
            first_block: if stm32 { 2 } else { 0 },
            partid: 0,
        })
    }

    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    fn setup(&self, request: u8, value: u16) -> ControlSetup {
        ControlSetup::class_interface(request, value, self.interface)
    }

    pub fn get_status(&self) -> Result<DfuStatus, DfuError> {
        let data = self
            .transport
            .control_in(self.setup(DFU_GETSTATUS, 0), 6)?;
        let status = DfuStatus::parse(&data)?;
        debug!(state = %status.state, status = status_name(status.status), "DFU status");
        Ok(status)
    }

    /// GET_STATUS with bounded retries on transient errors.
    fn poll_status(&self) -> Result<DfuStatus, DfuError> {
        let mut attempt = 0;
        loop {
            match self.get_status() {
                Err(DfuError::Transport(e)) if e.is_transient() && attempt < STATUS_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %e, "DFU status read failed, retrying");
                    thread::sleep(STATUS_RETRY_SLEEP);
                }
                other => return other,
            }
        }
    }

    /// Poll until the device leaves its busy states, honouring bwPollTimeout.
    fn wait_ready(&self, mut status: DfuStatus) -> Result<DfuStatus, DfuError> {
        while matches!(status.state, DfuState::DnBusy | DfuState::DnloadSync) {
            thread::sleep(status.poll_timeout);
            status = self.poll_status()?;
        }
        Ok(status)
    }

    fn check(status: DfuStatus, expected: DfuState) -> Result<(), DfuError> {
        if status.status != 0 || status.state == DfuState::Error {
            return Err(DfuError::DeviceStatus {
                status: status_name(status.status),
                state: status.state,
            });
        }
        if status.state != expected {
            return Err(DfuError::UnexpectedState {
                expected,
                actual: status.state,
            });
        }
        Ok(())
    }

    pub fn get_state(&self) -> Result<DfuState, DfuError> {
        let data = self.transport.control_in(self.setup(DFU_GETSTATE, 0), 1)?;
        data.first()
            .map(|&b| DfuState::from(b))
            .ok_or(DfuError::ShortStatus(0))
    }

    pub fn clear_status(&self) -> Result<(), DfuError> {
        self.transport
            .control_out(self.setup(DFU_CLRSTATUS, 0), &[])?;
        Ok(())
    }

    pub fn abort(&self) -> Result<(), DfuError> {
        self.transport.control_out(self.setup(DFU_ABORT, 0), &[])?;
        Ok(())
    }

    pub fn upload(&self, block: u16, length: u16) -> Result<Vec<u8>, DfuError> {
        Ok(self
            .transport
            .control_in(self.setup(DFU_UPLOAD, block), length)?)
    }

    /// Select the alternate setting that the following requests address.
    pub fn set_partition(&mut self, partid: u8) -> Result<(), DfuError> {
        self.transport.set_alt_setting(self.interface, partid)?;
        self.partid = partid;
        Ok(())
    }

    fn dnload(&self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        self.transport
            .control_out(self.setup(DFU_DNLOAD, block), data)?;
        Ok(())
    }

    /// Download `blob[offset..offset + size]` into alternate setting `partid`
    /// and let the device manifest it.
    ///
    /// A status read failing right after dfuMANIFEST-SYNC is taken as
    /// success: the device has usually reset itself at that point.
    #[instrument(skip(self, blob), fields(len = blob.len()), level = "debug")]
    pub fn download_and_run(
        &mut self,
        blob: &[u8],
        partid: u8,
        offset: usize,
        size: usize,
    ) -> Result<(), DfuError> {
        let data = offset
            .checked_add(size)
            .and_then(|end| blob.get(offset..end))
            .ok_or(DfuError::OutOfRange {
                offset,
                size,
                len: blob.len(),
            })?;

        self.set_partition(partid)?;
        let status = self.poll_status()?;
        Self::check(status, DfuState::DfuIdle)?;

        let total = data.len() as u64;
        let mut sent = 0u64;
        let mut block = self.first_block;
        for chunk in dnload_iter(data, self.transfer_size) {
            self.dnload(block, chunk)?;
            let status = self.wait_ready(self.poll_status()?)?;
            Self::check(status, DfuState::DnloadIdle)?;
            block = block.wrapping_add(1);
            sent += chunk.len() as u64;
            self.sink.progress("dfu download", sent, total);
        }

        // Zero-length block starts manifestation
        self.dnload(block, &[])?;
        let mut status = self.poll_status()?;
        loop {
            match status.state {
                DfuState::DfuIdle => return Ok(()),
                DfuState::Manifest | DfuState::DnBusy | DfuState::DnloadSync => {
                    thread::sleep(status.poll_timeout);
                    status = self.poll_status()?;
                }
                DfuState::ManifestSync => match self.get_status() {
                    Ok(next) => status = next,
                    Err(e) => {
                        debug!(error = %e, "Status lost during manifestation, device reset");
                        return Ok(());
                    }
                },
                DfuState::ManifestWaitReset => {
                    self.detach(partid)?;
                    return Ok(());
                }
                _ => {
                    return Err(DfuError::DeviceStatus {
                        status: status_name(status.status),
                        state: status.state,
                    });
                }
            }
        }
    }

    /// Ask the device to leave DFU mode and run what it was given.
    pub fn detach(&mut self, partid: u8) -> Result<(), DfuError> {
        self.set_partition(partid)?;
        self.poll_status()?;
        self.transport
            .control_out(self.setup(DFU_DETACH, DETACH_TIMEOUT_MS), &[])?;
        Ok(())
    }

    /// Boot phase reported by the STM32 ROM code or its loader through the
    /// `@virtual` alternate setting.
    pub fn stm32_get_phase(&mut self) -> Result<u8, DfuError> {
        let partid = search_partid(self.transport, "@virtual", true)
            .ok_or_else(|| DfuError::PartitionNotFound("@virtual".to_string()))?;
        self.set_partition(partid)?;
        self.poll_status()?;
        let data = self.upload(0, STM32_PHASE_UPLOAD_LEN)?;
        let phase = *data.first().ok_or(DfuError::EmptyUpload)?;
        self.poll_status()?;
        debug!(phase = %format!("0x{:02x}", phase), "STM32 boot phase");
        Ok(phase)
    }

    pub fn partid(&self) -> u8 {
        self.partid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::transport::{AltSetting, DeviceLayout, MockFailure, MockIo, MockTransport};

    fn status(state: u8) -> [u8; 6] {
        [0, 0, 0, 0, state, 0]
    }

    fn dfu_layout(names: &[&str], transfer_size: u16) -> DeviceLayout {
        let [lo, hi] = transfer_size.to_le_bytes();
        DeviceLayout {
            configuration: 1,
            alt_settings: names
                .iter()
                .enumerate()
                .map(|(i, name)| AltSetting {
                    interface: 0,
                    alt: i as u8,
                    class: 0xfe,
                    subclass: 0x01,
                    protocol: 0x02,
                    name: Some(name.to_string()),
                    endpoints: vec![],
                    extra: vec![0x09, 0x21, 0x0b, 0xff, 0x00, lo, hi, 0x1a, 0x01],
                })
                .collect(),
        }
    }

    #[test]
    fn test_transfer_size_from_functional_descriptor() {
        let mock = MockTransport::new().with_layout(dfu_layout(&["@Flash"], 2048));
        let dfu = Dfu::new(&mock, &NullSink, false).unwrap();
        assert_eq!(dfu.transfer_size(), 2048);
    }

    #[test]
    fn test_missing_interface() {
        let mock = MockTransport::new();
        assert!(matches!(
            Dfu::new(&mock, &NullSink, false),
            Err(DfuError::InterfaceNotFound)
        ));
    }

    #[test]
    fn test_manifest_sync_read_failure_is_success() {
        let mock = MockTransport::new().with_layout(dfu_layout(&["@FSBL"], 4));
        mock.queue_reply(&status(2));
        mock.queue_reply(&status(5));
        mock.queue_reply(&status(5));
        mock.queue_reply(&status(6));
        mock.queue_failure(MockFailure::Disconnected);

        let mut dfu = Dfu::new(&mock, &NullSink, true).unwrap();
        dfu.download_and_run(b"12345678", 0, 0, 6).unwrap();

        let dnloads: Vec<_> = mock
            .control_outs()
            .into_iter()
            .filter(|(req, ..)| *req == DFU_DNLOAD)
            .map(|(_, block, _, data)| (block, data))
            .collect();
        assert_eq!(
            dnloads,
            vec![(2, b"1234".to_vec()), (3, b"56".to_vec()), (4, vec![])]
        );
        assert_eq!(mock.pending_replies(), 0);
    }

    #[test]
    fn test_error_state_is_fatal() {
        let mock = MockTransport::new().with_layout(dfu_layout(&["@FSBL"], 1024));
        mock.queue_reply(&status(2));
        mock.queue_reply(&[0x03, 0, 0, 0, 10, 0]);

        let mut dfu = Dfu::new(&mock, &NullSink, false).unwrap();
        let err = dfu.download_and_run(b"abc", 0, 0, 3).unwrap_err();
        assert!(matches!(
            err,
            DfuError::DeviceStatus {
                status: "errWRITE",
                ..
            }
        ));
    }

    #[test]
    fn test_out_of_range_rejected_before_io() {
        let mock = MockTransport::new().with_layout(dfu_layout(&["@FSBL"], 1024));
        let mut dfu = Dfu::new(&mock, &NullSink, false).unwrap();
        assert!(matches!(
            dfu.download_and_run(b"abc", 0, 2, 5),
            Err(DfuError::OutOfRange { .. })
        ));
        assert!(mock.io_log().is_empty());
    }

    #[test]
    fn test_search_partid_last_match_wins() {
        let mock = MockTransport::new().with_layout(dfu_layout(
            &["@Partition0", "@FSBL /0x01/1*1Me", "@virtual /0xF1/1*512Ba", "@FSBL2"],
            1024,
        ));
        assert_eq!(search_partid(&mock, "@FSBL", true), Some(3));
        assert_eq!(search_partid(&mock, "@Partition0", false), Some(0));
        assert_eq!(search_partid(&mock, "@SSBL", true), None);
    }

    #[test]
    fn test_stm32_phase() {
        let mock = MockTransport::new().with_layout(dfu_layout(&["@FSBL", "@virtual /0xF1"], 1024));
        mock.queue_reply(&status(2));
        mock.queue_reply(&[0x01, 0, 0, 0, 0]);
        mock.queue_reply(&status(2));

        let mut dfu = Dfu::new(&mock, &NullSink, true).unwrap();
        assert_eq!(dfu.stm32_get_phase().unwrap(), 0x01);
        assert_eq!(mock.io_log()[0], MockIo::SetAlt { interface: 0, alt: 1 });
    }
}
