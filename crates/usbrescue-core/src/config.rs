//! Recovery configuration.
//!
//! Built once from CLI input before any device I/O and then only read.
//! Firmware descriptions come from YAML or TOML files and inline YAML
//! fragments; later sources override earlier ones artifact by artifact.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::soc::SocModel;
use crate::usb::{UsbAddress, UsbError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in {origin}: {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid TOML in {origin}: {source}")]
    Toml {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Firmware '{0}' not found in recovery config")]
    MissingFirmware(String),

    #[error("Firmware '{0}' has no path in recovery config")]
    MissingPath(String),

    #[error("Firmware '{artifact}' is missing required key '{key}'")]
    MissingKey { artifact: String, key: &'static str },

    #[error("SoC {0} has no default ROM USB id, pass an explicit USB address")]
    NoDefaultUsb(String),

    #[error("Invalid USB address for firmware '{artifact}': {source}")]
    InvalidUsb {
        artifact: String,
        #[source]
        source: UsbError,
    },

    #[error("Invalid size '{0}', expected an integer with optional K, M or G suffix")]
    InvalidSize(String),

    #[error("{0}")]
    Invalid(String),
}

/// One named firmware binary and its per-artifact metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FirmwareArtifact {
    pub path: Option<PathBuf>,
    /// Load address in device memory.
    pub address: Option<u64>,
    pub load_addr: Option<u64>,
    pub bl2_load_addr: Option<u64>,
    /// Milliseconds to wait after this stage has been sent.
    pub delay: Option<u64>,
    #[serde(rename = "console_instance")]
    pub console_instance: Option<u32>,
    #[serde(rename = "console_ioset")]
    pub console_ioset: Option<u32>,
    /// Named RAM preset for SAM-BA external RAM setup.
    pub preset: Option<String>,
    /// USB address the device enumerates with once this stage runs.
    pub usb: Option<String>,
    /// Allwinner SoC memory map (YAML).
    pub soc_info: Option<PathBuf>,
    /// Allwinner FEL-to-SPL thunk binary.
    pub thunk: Option<PathBuf>,
}

impl FirmwareArtifact {
    pub fn usb_override(&self) -> Result<Option<UsbAddress>, UsbError> {
        self.usb.as_deref().map(str::parse).transpose()
    }

    fn rebase(&mut self, base: &Path) {
        for path in [&mut self.path, &mut self.soc_info, &mut self.thunk]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct FirmwareFile {
    #[serde(rename = "paths-relative-to")]
    paths_relative_to: Option<String>,
    #[serde(flatten)]
    artifacts: BTreeMap<String, FirmwareArtifact>,
}

/// Firmware artifacts by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct FirmwareSet {
    artifacts: BTreeMap<String, FirmwareArtifact>,
}

impl FirmwareSet {
    /// Parse a YAML fragment such as `{tf-a: {path: tf-a.stm32}}`.
    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: FirmwareFile =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Yaml {
                origin: origin.to_string(),
                source,
            })?;
        Self::from_file(file, None)
    }

    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: FirmwareFile = toml::from_str(content).map_err(|source| ConfigError::Toml {
            origin: origin.to_string(),
            source,
        })?;
        Self::from_file(file, None)
    }

    /// Load a firmware description file, picking the format by extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let origin = path.display().to_string();
        let file: FirmwareFile = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|source| ConfigError::Toml {
                origin: origin.clone(),
                source,
            })?,
            _ => serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
                origin: origin.clone(),
                source,
            })?,
        };
        Self::from_file(file, Some(path))
    }

    fn from_file(file: FirmwareFile, this_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut set = FirmwareSet {
            artifacts: file.artifacts,
        };
        let base = match file.paths_relative_to.as_deref() {
            None | Some("CWD") => None,
            Some("THIS_FILE") => Some(
                this_file
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .ok_or_else(|| {
                        ConfigError::Invalid(
                            "paths-relative-to: THIS_FILE needs a firmware file".to_string(),
                        )
                    })?,
            ),
            Some(dir) => Some(PathBuf::from(dir)),
        };
        if let Some(base) = base {
            set.rebase(&base);
        }
        Ok(set)
    }

    /// Make every relative artifact path relative to `base`.
    pub fn rebase(&mut self, base: &Path) {
        debug!(base = %base.display(), "Rebasing firmware paths");
        for artifact in self.artifacts.values_mut() {
            artifact.rebase(base);
        }
    }

    /// Later sources win, artifact by artifact.
    pub fn merge(&mut self, other: FirmwareSet) {
        self.artifacts.extend(other.artifacts);
    }

    pub fn insert(&mut self, name: &str, artifact: FirmwareArtifact) {
        self.artifacts.insert(name.to_string(), artifact);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&FirmwareArtifact> {
        self.artifacts.get(name)
    }

    pub fn artifact(&self, name: &str) -> Result<&FirmwareArtifact, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::MissingFirmware(name.to_string()))
    }

    pub fn path(&self, name: &str) -> Result<&Path, ConfigError> {
        self.artifact(name)?
            .path
            .as_deref()
            .ok_or_else(|| ConfigError::MissingPath(name.to_string()))
    }

    /// Read an artifact from disk. Warns when the file looks like text,
    /// which usually means the wrong file was configured.
    pub fn load_blob(&self, name: &str) -> Result<Vec<u8>, ConfigError> {
        let blob = self.load_raw(name)?;
        if looks_like_text(&blob) {
            warn!(firmware = name, "Firmware file looks like a text file!");
        }
        Ok(blob)
    }

    /// Read an artifact from disk without the text sanity check.
    pub fn load_raw(&self, name: &str) -> Result<Vec<u8>, ConfigError> {
        let path = self.path(name)?;
        fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// True when the first 512 bytes are plain ASCII.
pub fn looks_like_text(blob: &[u8]) -> bool {
    blob.iter().take(512).all(u8::is_ascii)
}

/// Convert `512`, `0x200`, `4K`, `4M` or `1G` to a byte count.
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize(input.to_string());
    let s = input.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| invalid());
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match suffix {
        "" => 1,
        "K" | "k" => 1 << 10,
        "M" | "m" => 1 << 20,
        "G" | "g" => 1 << 30,
        _ => return Err(invalid()),
    };
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Everything a recovery needs to know, fixed before the first transfer.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub soc: SocModel,
    pub usb: UsbAddress,
    pub firmware: FirmwareSet,
}

impl RecoveryConfig {
    /// Fill in the default ROM USB id and validate per-artifact overrides.
    pub fn new(
        soc: SocModel,
        usb: Option<UsbAddress>,
        firmware: FirmwareSet,
    ) -> Result<Self, ConfigError> {
        let usb = match usb.or_else(|| soc.default_usb()) {
            Some(usb) => usb,
            None => return Err(ConfigError::NoDefaultUsb(soc.name().to_string())),
        };
        for name in firmware.names() {
            firmware
                .artifact(name)?
                .usb_override()
                .map_err(|source| ConfigError::InvalidUsb {
                    artifact: name.to_string(),
                    source,
                })?;
        }
        Ok(Self { soc, usb, firmware })
    }

    /// USB address `artifact` says the next stage enumerates with, if any.
    pub fn usb_after(&self, artifact: &str) -> Option<UsbAddress> {
        self.firmware
            .get(artifact)
            .and_then(|a| a.usb_override().ok().flatten())
    }
}
