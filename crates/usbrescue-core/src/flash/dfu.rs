//! Downloading files into DFU alternate settings.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::events::EventSink;
use crate::protocol::Dfu;
use crate::transport::UsbTransport;

/// `altsetting:path` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuArtifact {
    pub altsetting: u8,
    pub path: PathBuf,
}

impl FromStr for DfuArtifact {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("Invalid DFU config '{}', expected altsetting:path", s));
        let (alt, path) = s.split_once(':').ok_or_else(invalid)?;
        if path.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            altsetting: alt.trim().parse().map_err(|_| invalid())?,
            path: PathBuf::from(path),
        })
    }
}

/// Download every artifact in order, then detach from the last one.
///
/// `size` limits how much of each file is sent.
pub fn download(
    device: &dyn UsbTransport,
    sink: &dyn EventSink,
    artifacts: &[DfuArtifact],
    size: Option<usize>,
) -> Result<()> {
    let Some(last) = artifacts.last() else {
        bail!("No DFU artifact given");
    };
    let mut dfu = Dfu::new(device, sink, false)?;
    for artifact in artifacts {
        let blob = fs::read(&artifact.path)
            .with_context(|| format!("reading {}", artifact.path.display()))?;
        let size = size.unwrap_or(blob.len());
        info!(
            path = %artifact.path.display(),
            altsetting = artifact.altsetting,
            "Downloading file..."
        );
        debug!(size = %format!("0x{:x}", size), "DFU download");
        dfu.get_status()?;
        dfu.download_and_run(&blob, artifact.altsetting, 0, size)
            .with_context(|| format!("downloading {} to altsetting {}", artifact.path.display(), artifact.altsetting))?;
        dfu.get_status()?;
        info!("Done");
    }
    info!("Sending DFU detach command...");
    dfu.detach(last.altsetting)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::events::NullSink;
    use crate::transport::{MockTransport, dfu_layout};

    #[test]
    fn test_parse_artifact() {
        let artifact: DfuArtifact = "1:images/rootfs.ext4".parse().unwrap();
        assert_eq!(artifact.altsetting, 1);
        assert_eq!(artifact.path, PathBuf::from("images/rootfs.ext4"));
        assert!("rootfs.ext4".parse::<DfuArtifact>().is_err());
        assert!("x:rootfs.ext4".parse::<DfuArtifact>().is_err());
        assert!("0:".parse::<DfuArtifact>().is_err());
    }

    #[test]
    fn test_download_then_detach_last() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        first.write_all(&[0x11; 16]).unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        second.write_all(&[0x22; 16]).unwrap();
        let artifacts = vec![
            DfuArtifact { altsetting: 0, path: first.path().to_path_buf() },
            DfuArtifact { altsetting: 1, path: second.path().to_path_buf() },
        ];

        let device = MockTransport::new().with_layout(dfu_layout(&["u-boot", "rootfs"]));
        // status, select, chunk, manifest, status; twice; then detach
        for state in [2u8, 2, 5, 2, 2, 2, 2, 5, 2, 2, 2] {
            device.queue_reply(&[0, 0, 0, 0, state, 0]);
        }
        download(&device, &NullSink, &artifacts, None).unwrap();

        let outs = device.control_outs();
        let data: Vec<&Vec<u8>> = outs.iter().filter(|o| o.0 == 1 && !o.3.is_empty()).map(|o| &o.3).collect();
        assert_eq!(data, vec![&vec![0x11; 16], &vec![0x22; 16]]);
        assert_eq!(outs.last().unwrap().0, 0);
        assert_eq!(device.pending_replies(), 0);
    }

    #[test]
    fn test_size_limit_beyond_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x11; 16]).unwrap();
        let artifacts = vec![DfuArtifact { altsetting: 0, path: file.path().to_path_buf() }];
        let device = MockTransport::new().with_layout(dfu_layout(&["u-boot"]));
        device.queue_reply(&[0, 0, 0, 0, 2, 0]);
        assert!(download(&device, &NullSink, &artifacts, Some(32)).is_err());
        assert!(download(&device, &NullSink, &[], None).is_err());
    }
}
