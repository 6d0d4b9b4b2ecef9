//! Factory batch files and the tasks they describe.
//!
//! A batch file maps board USB ids to SoC models, and each model to the
//! firmware that recovers it and the tasks run once U-Boot's fastboot
//! gadget is up:
//!
//! ```yaml
//! boards:
//!   "0483:df11": stm32mp15
//! soc-models:
//!   stm32mp15:
//!     firmware:
//!       tf-a: {path: tf-a.stm32}
//!       fip: {path: fip.bin}
//!     tasks:
//!       - task: gpt
//!         args:
//!           device: 1
//!           partitions:
//!             - {name: fsbl, start: 1M, size: 256K}
//!             - {name: rootfs, size: "-"}
//!       - task: flash
//!         args: {image: rootfs.ext4, part: rootfs, device: 1}
//!       - task: reset
//! ```
//!
//! Everything is checked when the batch is loaded, before any board is
//! touched.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::config::{ConfigError, FirmwareSet, parse_size};
use crate::protocol::FastbootCommand;
use crate::soc::SocModel;
use crate::usb::UsbAddress;

/// Block size the U-Boot storage commands count in.
pub const LBA_SIZE: u64 = 512;

/// General purpose partitions an eMMC can have.
pub const MAX_GP_PARTS: usize = 4;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Failed to read batch file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid batch file {origin}: {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Invalid arguments for task '{task}': {source}")]
    Args {
        task: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("{what} 0x{value:x} is not a multiple of {align} bytes")]
    Misaligned {
        what: &'static str,
        value: u64,
        align: u64,
    },

    #[error("Task '{0}' comes after the board has been reset")]
    AfterReset(&'static str),

    #[error("Invalid USB id '{0}' in boards, expected vid:pid")]
    BadBoardId(String),

    #[error("SoC model '{0}' is not supported")]
    UnknownSoc(String),

    #[error("Board {ids} uses SoC model '{model}', which has no soc-models entry")]
    MissingModel { ids: String, model: String },

    #[error("{what} {path} does not exist")]
    MissingFile { what: String, path: PathBuf },

    #[error("Invalid partition table: {0}")]
    Partitions(String),
}

/// Byte count written as an integer, `0x` hex or with a K/M/G suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SizeRepr")]
pub struct Size(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Int(u64),
    Text(String),
}

impl TryFrom<SizeRepr> for Size {
    type Error = ConfigError;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        match repr {
            SizeRepr::Int(n) => Ok(Size(n)),
            SizeRepr::Text(s) => parse_size(&s).map(Size),
        }
    }
}

/// GPT partition size; `-` takes the rest of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SizeRepr")]
pub enum PartSize {
    Bytes(u64),
    Rest,
}

impl TryFrom<SizeRepr> for PartSize {
    type Error = ConfigError;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        match repr {
            SizeRepr::Text(s) if s.trim() == "-" => Ok(PartSize::Rest),
            other => Size::try_from(other).map(|s| PartSize::Bytes(s.0)),
        }
    }
}

impl fmt::Display for PartSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartSize::Bytes(n) => write!(f, "{}", n),
            PartSize::Rest => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GptPartition {
    pub name: String,
    pub size: PartSize,
    pub start: Option<Size>,
    #[serde(rename = "type")]
    pub part_type: Option<String>,
    pub uuid: Option<String>,
    #[serde(default)]
    pub bootable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GptArgs {
    /// MMC device number.
    pub device: u32,
    pub partitions: Vec<GptPartition>,
}

impl GptArgs {
    /// Partition list in the syntax of U-Boot's `gpt write`.
    pub fn to_uboot(&self) -> String {
        let mut out = String::new();
        for part in &self.partitions {
            out.push_str(&format!("name={}", part.name));
            if let Some(start) = part.start {
                out.push_str(&format!(",start={}", start.0));
            }
            out.push_str(&format!(",size={}", part.size));
            if let Some(uuid) = &part.uuid {
                out.push_str(&format!(",uuid={}", uuid));
            }
            if let Some(part_type) = &part.part_type {
                out.push_str(&format!(",type={}", part_type));
            }
            if part.bootable {
                out.push_str(",bootable");
            }
            out.push(';');
        }
        out
    }

    fn validate(&self) -> Result<(), TaskError> {
        let Some((last, head)) = self.partitions.split_last() else {
            return Err(TaskError::Partitions("no partitions given".to_string()));
        };
        let mut names = Vec::new();
        for part in &self.partitions {
            if !is_part_name(&part.name) {
                return Err(TaskError::InvalidValue {
                    key: "name",
                    value: part.name.clone(),
                });
            }
            if names.contains(&part.name.as_str()) {
                return Err(TaskError::Partitions(format!("duplicate partition '{}'", part.name)));
            }
            names.push(part.name.as_str());
            for (key, value) in [("uuid", &part.uuid), ("type", &part.part_type)] {
                if let Some(value) = value
                    && !is_uuid(value)
                {
                    return Err(TaskError::InvalidValue {
                        key,
                        value: value.clone(),
                    });
                }
            }
        }
        if head.iter().any(|p| p.size == PartSize::Rest) {
            return Err(TaskError::Partitions(format!(
                "only the last partition ('{}') may have size '-'",
                last.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct MtdPartsArgs {
    mtdparts: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunArgs {
    commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FlashTask {
    pub image: PathBuf,
    /// GPT or MTD partition name, or `boot0`/`boot1` for the eMMC boot
    /// partitions. The whole device when absent.
    pub part: Option<String>,
    /// Byte offset into the partition or device.
    pub image_offset: Option<Size>,
    /// MMC device number.
    #[serde(default)]
    pub device: u32,
}

impl FlashTask {
    /// eMMC hardware partition number for `boot0`/`boot1`.
    pub fn boot_partition(&self) -> Option<u32> {
        match self.part.as_deref() {
            Some("boot0") => Some(1),
            Some("boot1") => Some(2),
            _ => None,
        }
    }
}

/// Fastboot alias for a raw range of the MMC device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualPart {
    pub name: String,
    pub start: Size,
    pub size: Size,
}

impl VirtualPart {
    /// U-Boot command defining the alias, in blocks.
    pub fn to_uboot(&self) -> String {
        format!(
            "setenv fastboot_raw_partition_{} 0x{:x} 0x{:x}",
            self.name,
            self.start.0 / LBA_SIZE,
            self.size.0 / LBA_SIZE
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
struct PromptArgs {
    prompt: String,
    #[serde(default)]
    reset: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnhancedArea {
    pub start: Size,
    pub size: Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpPart {
    pub size: Size,
    #[serde(default)]
    pub enhanced: bool,
    #[serde(default)]
    pub wrrel: bool,
}

/// eMMC hardware partitioning. Irreversible once completed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct EmmcHwpart {
    pub device: u32,
    pub enhanced_user: Option<EnhancedArea>,
    /// Write reliability on the user area.
    #[serde(default)]
    pub wrrel: bool,
    #[serde(default)]
    pub gp: Vec<GpPart>,
    /// Finalize the partitioning. Without it the settings are written but
    /// only take effect once completed.
    #[serde(default)]
    pub complete: bool,
}

impl EmmcHwpart {
    /// Arguments of `mmc hwpartition`, before the `check`/`set`/`complete`
    /// mode. U-Boot reads these counts as decimal blocks.
    pub fn partition_args(&self) -> String {
        let mut args = Vec::new();
        if let Some(area) = self.enhanced_user {
            args.push(format!(
                "enh {} {}",
                area.start.0 / LBA_SIZE,
                area.size.0 / LBA_SIZE
            ));
        }
        if self.wrrel {
            args.push("wrrel on".to_string());
        }
        if !args.is_empty() {
            args.insert(0, "user".to_string());
        }
        for (i, gp) in self.gp.iter().enumerate() {
            args.push(format!("gp{} {}", i + 1, gp.size.0 / LBA_SIZE));
            if gp.enhanced {
                args.push("enh".to_string());
            }
            if gp.wrrel {
                args.push("wrrel on".to_string());
            }
        }
        args.join(" ")
    }

    pub fn mode(&self) -> &'static str {
        if self.complete { "complete" } else { "set" }
    }

    fn validate(&self) -> Result<(), TaskError> {
        if self.enhanced_user.is_none() && !self.wrrel && self.gp.is_empty() {
            return Err(TaskError::InvalidValue {
                key: "emmc-hwpart",
                value: "no user area or general purpose partition settings".to_string(),
            });
        }
        if self.gp.len() > MAX_GP_PARTS {
            return Err(TaskError::InvalidValue {
                key: "gp",
                value: format!("{} partitions, at most {}", self.gp.len(), MAX_GP_PARTS),
            });
        }
        if let Some(area) = self.enhanced_user {
            check_aligned("enhanced user area start", area.start.0)?;
            check_aligned("enhanced user area size", area.size.0)?;
        }
        for gp in &self.gp {
            check_aligned("general purpose partition size", gp.size.0)?;
            if gp.size.0 == 0 {
                return Err(TaskError::InvalidValue {
                    key: "gp.size",
                    value: "0".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// One step of a board's factory pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTask")]
pub enum Task {
    Gpt(GptArgs),
    MtdParts(String),
    Run(Vec<FastbootCommand>),
    Flash(FlashTask),
    VirtualPart(VirtualPart),
    Reset,
    PromptOperator { prompt: String, reset: bool },
    EmmcHwpart(EmmcHwpart),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    task: String,
    args: Option<Value>,
}

fn args<T: DeserializeOwned>(task: &str, value: Value) -> Result<T, TaskError> {
    serde_yaml::from_value(value).map_err(|source| TaskError::Args {
        task: task.to_string(),
        source,
    })
}

impl TryFrom<RawTask> for Task {
    type Error = TaskError;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        let name = raw.task.as_str();
        let value = raw.args.unwrap_or_else(|| Value::Mapping(Mapping::new()));
        let task = match name {
            "gpt" => Task::Gpt(args(name, value)?),
            "mtd-parts" => Task::MtdParts(args::<MtdPartsArgs>(name, value)?.mtdparts),
            "run" => {
                let run: RunArgs = args(name, value)?;
                let commands = run
                    .commands
                    .iter()
                    .map(|c| {
                        c.parse().map_err(|_| TaskError::InvalidValue {
                            key: "commands",
                            value: c.clone(),
                        })
                    })
                    .collect::<Result<Vec<FastbootCommand>, _>>()?;
                Task::Run(commands)
            }
            "flash" => Task::Flash(args(name, value)?),
            "virtual-part" => Task::VirtualPart(args(name, value)?),
            "reset" => {
                let extra: Mapping = args(name, value)?;
                if !extra.is_empty() {
                    return Err(TaskError::InvalidValue {
                        key: "args",
                        value: "reset takes no arguments".to_string(),
                    });
                }
                Task::Reset
            }
            "prompt-operator" => {
                let prompt: PromptArgs = args(name, value)?;
                Task::PromptOperator {
                    prompt: prompt.prompt,
                    reset: prompt.reset,
                }
            }
            "emmc-hwpart" => Task::EmmcHwpart(args(name, value)?),
            _ => return Err(TaskError::UnknownTask(raw.task)),
        };
        task.validate()?;
        Ok(task)
    }
}

fn check_aligned(what: &'static str, value: u64) -> Result<(), TaskError> {
    if value % LBA_SIZE != 0 {
        return Err(TaskError::Misaligned {
            what,
            value,
            align: LBA_SIZE,
        });
    }
    Ok(())
}

fn is_part_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

fn is_uuid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')))
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::Gpt(_) => "gpt",
            Task::MtdParts(_) => "mtd-parts",
            Task::Run(_) => "run",
            Task::Flash(_) => "flash",
            Task::VirtualPart(_) => "virtual-part",
            Task::Reset => "reset",
            Task::PromptOperator { .. } => "prompt-operator",
            Task::EmmcHwpart(_) => "emmc-hwpart",
        }
    }

    /// True when the board is reset at the end of this task.
    pub fn resets(&self) -> bool {
        matches!(self, Task::Reset | Task::PromptOperator { reset: true, .. })
    }

    fn validate(&self) -> Result<(), TaskError> {
        match self {
            Task::Gpt(gpt) => gpt.validate(),
            Task::MtdParts(parts) if parts.trim().is_empty() => Err(TaskError::InvalidValue {
                key: "mtdparts",
                value: parts.clone(),
            }),
            Task::Flash(flash) => match flash.image_offset {
                Some(offset) => check_aligned("image offset", offset.0),
                None => Ok(()),
            },
            Task::VirtualPart(part) => {
                if !is_part_name(&part.name) {
                    return Err(TaskError::InvalidValue {
                        key: "name",
                        value: part.name.clone(),
                    });
                }
                check_aligned("virtual partition start", part.start.0)?;
                check_aligned("virtual partition size", part.size.0)
            }
            Task::EmmcHwpart(hwpart) => hwpart.validate(),
            _ => Ok(()),
        }
    }
}

/// Check a task list as a whole: nothing may follow a reset.
pub fn check_tasks(tasks: &[Task]) -> Result<(), TaskError> {
    if let Some(pos) = tasks.iter().position(Task::resets)
        && let Some(next) = tasks.get(pos + 1)
    {
        return Err(TaskError::AfterReset(next.name()));
    }
    Ok(())
}

/// Recovery firmware and factory tasks of one SoC model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SocPipeline {
    #[serde(default)]
    pub firmware: FirmwareSet,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Upper bound on the fastboot buffer, below what U-Boot reports.
    pub fb_buffer_size: Option<Size>,
}

impl SocPipeline {
    fn rebase(&mut self, base: &Path) {
        self.firmware.rebase(base);
        for task in &mut self.tasks {
            if let Task::Flash(flash) = task
                && flash.image.is_relative()
            {
                flash.image = base.join(&flash.image);
            }
        }
    }

    /// Every file the pipeline reads: firmware first, then images.
    pub fn files(&self) -> Vec<(String, PathBuf)> {
        let mut files: Vec<(String, PathBuf)> = self
            .firmware
            .names()
            .filter_map(|name| {
                self.firmware
                    .path(name)
                    .ok()
                    .map(|p| (format!("firmware '{}'", name), p.to_path_buf()))
            })
            .collect();
        for task in &self.tasks {
            if let Task::Flash(flash) = task {
                files.push(("image".to_string(), flash.image.clone()));
            }
        }
        files
    }
}

/// A parsed and validated batch file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BatchConfig {
    /// `vid:pid` of a board's ROM device to SoC model.
    pub boards: BTreeMap<String, String>,
    pub soc_models: BTreeMap<String, SocPipeline>,
}

impl BatchConfig {
    /// Parse and validate a batch. Paths are taken as they are written.
    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, TaskError> {
        let batch: BatchConfig = serde_yaml::from_str(content).map_err(|source| TaskError::Yaml {
            origin: origin.to_string(),
            source,
        })?;
        batch.validate()?;
        Ok(batch)
    }

    /// Load a batch file. Relative paths in it are relative to the file,
    /// and every file it names must exist.
    pub fn load(path: &Path) -> Result<Self, TaskError> {
        let content = fs::read_to_string(path).map_err(|source| TaskError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut batch = Self::from_yaml_str(&content, &path.display().to_string())?;
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            for pipeline in batch.soc_models.values_mut() {
                pipeline.rebase(base);
            }
        }
        batch.check_files()?;
        Ok(batch)
    }

    fn validate(&self) -> Result<(), TaskError> {
        for (ids, model) in &self.boards {
            match ids.parse::<UsbAddress>() {
                Ok(UsbAddress::Ids { .. }) => {}
                _ => return Err(TaskError::BadBoardId(ids.clone())),
            }
            if !self.soc_models.contains_key(model) {
                return Err(TaskError::MissingModel {
                    ids: ids.clone(),
                    model: model.clone(),
                });
            }
        }
        for (model, pipeline) in &self.soc_models {
            if SocModel::lookup(model).is_none() {
                return Err(TaskError::UnknownSoc(model.clone()));
            }
            check_tasks(&pipeline.tasks)?;
            if let Some(cap) = pipeline.fb_buffer_size {
                if cap.0 == 0 {
                    return Err(TaskError::InvalidValue {
                        key: "fb-buffer-size",
                        value: "0".to_string(),
                    });
                }
                check_aligned("fb-buffer-size", cap.0)?;
            }
        }
        Ok(())
    }

    pub fn check_files(&self) -> Result<(), TaskError> {
        for pipeline in self.soc_models.values() {
            if let Some((what, path)) = pipeline.files().into_iter().find(|(_, p)| !p.exists()) {
                return Err(TaskError::MissingFile { what, path });
            }
        }
        Ok(())
    }

    /// Board ids with their SoC model and pipeline.
    pub fn boards(&self) -> impl Iterator<Item = (UsbAddress, SocModel, &SocPipeline)> {
        self.boards.iter().filter_map(|(ids, model)| {
            Some((
                ids.parse().ok()?,
                SocModel::lookup(model)?,
                self.soc_models.get(model)?,
            ))
        })
    }
}
