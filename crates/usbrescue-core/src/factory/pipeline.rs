//! One board, from its boot ROM to the end of its factory tasks.
//!
//! The board is recovered to U-Boot, U-Boot's fastboot gadget is opened
//! at the same port path, and the SoC model's tasks run on it in order.
//! `prompt-operator` and `emmc-hwpart` park the board in
//! [`BoardPhase::Paused`] until the supervisor sends a resume.

use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, info, warn};

use super::tasks::{EmmcHwpart, FlashTask, LBA_SIZE, SocPipeline, Task};
use crate::config::RecoveryConfig;
use crate::events::{EventSink, LogLevel, RecoveryEvent, TracingSink};
use crate::flash::fastboot::{flash_file, parse_download_size, run_commands};
use crate::image::SparseImage;
use crate::protocol::{Fastboot, is_fastboot};
use crate::session::{RecoverySession, SessionConfig};
use crate::soc::SocModel;
use crate::usb::{DeviceProvider, UsbAddress, UsbPath};

/// Fastboot alias used for the raw ranges large images are written to.
const SECTION_ALIAS: &str = "usbrescue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardPhase {
    /// Found in ROM mode, nothing done yet.
    Rom,
    Recovering,
    /// Recovered, waiting for the fastboot gadget.
    Flasher,
    Flashing,
    /// Waiting for the operator.
    Paused,
    Done,
    Failure,
}

impl BoardPhase {
    pub fn can_enter(self, next: BoardPhase) -> bool {
        use BoardPhase::*;
        match (self, next) {
            (Done | Failure, _) => false,
            (_, Failure) => true,
            (Rom, Recovering)
            | (Recovering, Flasher)
            | (Flasher, Flashing)
            | (Flashing, Paused | Done)
            | (Paused, Flashing) => true,
            _ => false,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, BoardPhase::Done | BoardPhase::Failure)
    }
}

impl fmt::Display for BoardPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BoardPhase::Rom => "ROM",
            BoardPhase::Recovering => "RECOVERING",
            BoardPhase::Flasher => "FLASHER",
            BoardPhase::Flashing => "FLASHING",
            BoardPhase::Paused => "PAUSED",
            BoardPhase::Done => "DONE",
            BoardPhase::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardUpdate {
    Phase(BoardPhase),
    Log(String),
    /// Text to show the operator before the board pauses.
    Prompt(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardMessage {
    pub board: usize,
    pub update: BoardUpdate,
}

/// Event sink of a board worker: events go to `tracing` and log lines to
/// the supervisor.
pub struct BoardSink {
    board: usize,
    updates: Sender<BoardMessage>,
}

impl BoardSink {
    pub fn new(board: usize, updates: Sender<BoardMessage>) -> Self {
        Self { board, updates }
    }

    fn line(&self, line: String) {
        // The supervisor may already be gone
        let _ = self.updates.send(BoardMessage {
            board: self.board,
            update: BoardUpdate::Log(line),
        });
    }
}

impl EventSink for BoardSink {
    fn on_event(&self, event: &RecoveryEvent) {
        TracingSink.on_event(event);
        match event {
            RecoveryEvent::Log { level, message } => match level {
                LogLevel::Trace | LogLevel::Debug => {}
                LogLevel::Info => self.line(format!("[INFO] {}", message)),
                LogLevel::Warn => self.line(format!("[WARN] {}", message)),
                LogLevel::Error => self.line(format!("[ERROR] {}", message)),
            },
            RecoveryEvent::DeviceConnected { vid, pid, path } => {
                self.line(format!("[INFO] device {:04x}:{:04x} connected at {}", vid, pid, path))
            }
            RecoveryEvent::PhaseChanged { from, to } => {
                self.line(format!("[INFO] recovery phase {} -> {}", from, to))
            }
            _ => {}
        }
    }
}

/// Task runner of one board. Owned by that board's worker thread.
pub struct BoardPipeline {
    board: usize,
    path: UsbPath,
    soc: SocModel,
    pipeline: SocPipeline,
    tuning: SessionConfig,
    updates: Sender<BoardMessage>,
    resume: Receiver<()>,
    sink: Arc<BoardSink>,
    phase: BoardPhase,
}

impl BoardPipeline {
    pub fn new(
        board: usize,
        path: UsbPath,
        soc: SocModel,
        pipeline: SocPipeline,
        tuning: SessionConfig,
        updates: Sender<BoardMessage>,
        resume: Receiver<()>,
    ) -> Self {
        let sink = Arc::new(BoardSink::new(board, updates.clone()));
        Self {
            board,
            path,
            soc,
            pipeline,
            tuning,
            updates,
            resume,
            sink,
            phase: BoardPhase::Rom,
        }
    }

    pub fn phase(&self) -> BoardPhase {
        self.phase
    }

    fn send(&self, update: BoardUpdate) {
        let _ = self.updates.send(BoardMessage {
            board: self.board,
            update,
        });
    }

    fn enter(&mut self, phase: BoardPhase) {
        if phase == self.phase {
            return;
        }
        if !self.phase.can_enter(phase) {
            warn!(from = %self.phase, to = %phase, "Ignoring board phase change");
            return;
        }
        info!(board = %self.path, from = %self.phase, to = %phase, "Board phase");
        self.phase = phase;
        self.send(BoardUpdate::Phase(phase));
    }

    /// Recover the board and run its tasks. Ends in `Done` or `Failure`.
    pub fn run(&mut self, provider: &mut dyn DeviceProvider) -> Result<()> {
        let result = self.recover(provider).and_then(|()| self.run_tasks(provider));
        match &result {
            Ok(()) => self.enter(BoardPhase::Done),
            Err(e) => {
                error!(board = %self.path, error = %format!("{:#}", e), "Board failed");
                self.sink.error(&format!("{:#}", e));
                self.enter(BoardPhase::Failure);
            }
        }
        result
    }

    fn recover(&mut self, provider: &mut dyn DeviceProvider) -> Result<()> {
        self.enter(BoardPhase::Recovering);
        let config = RecoveryConfig::new(
            self.soc,
            Some(UsbAddress::Path(self.path.clone())),
            self.pipeline.firmware.clone(),
        )?;
        let sink: Arc<dyn EventSink> = self.sink.clone();
        RecoverySession::with_sink(config, self.tuning.clone(), sink).run(provider)
    }

    /// Open the fastboot gadget and run every task on it.
    fn run_tasks(&mut self, provider: &mut dyn DeviceProvider) -> Result<()> {
        self.enter(BoardPhase::Flasher);
        info!(board = %self.path, "Waiting for fastboot gadget...");
        let device = provider
            .reacquire_until(&self.path, &|d| is_fastboot(d.layout()))
            .with_context(|| format!("waiting for U-Boot fastboot gadget at {}", self.path))?;
        self.enter(BoardPhase::Flashing);

        let sink = Arc::clone(&self.sink);
        let fast = Fastboot::new(device.as_ref(), sink.as_ref(), self.tuning.fastboot_timeout())?;
        let tasks = self.pipeline.tasks.clone();
        for (i, task) in tasks.iter().enumerate() {
            info!(task = task.name(), index = i + 1, count = tasks.len(), "Running task");
            self.sink.info(&format!("task {}/{}: {}", i + 1, tasks.len(), task.name()));
            self.run_task(&fast, task)
                .with_context(|| format!("task {} ({})", i + 1, task.name()))?;
        }
        Ok(())
    }

    fn run_task(&mut self, fast: &Fastboot<'_>, task: &Task) -> Result<()> {
        match task {
            Task::Gpt(gpt) => {
                fast.oem_run(&format!("gpt write mmc {} '{}'", gpt.device, gpt.to_uboot()))?;
                fast.oem_run(&format!("part list mmc {}", gpt.device))?;
            }
            Task::MtdParts(parts) => fast.oem_run(&format!("setenv mtdparts {}", parts))?,
            Task::Run(commands) => run_commands(fast, commands)?,
            Task::Flash(flash) => self.flash(fast, flash)?,
            Task::VirtualPart(part) => fast.oem_run(&part.to_uboot())?,
            Task::Reset => fast.reboot()?,
            Task::PromptOperator { prompt, reset } => {
                self.pause(prompt)?;
                if *reset {
                    fast.reboot()?;
                }
            }
            Task::EmmcHwpart(hwpart) => self.emmc_hwpart(fast, hwpart)?,
        }
        Ok(())
    }

    /// Park the board until the operator resumes it.
    fn pause(&mut self, prompt: &str) -> Result<()> {
        self.send(BoardUpdate::Prompt(prompt.to_string()));
        self.enter(BoardPhase::Paused);
        warn!(board = %self.path, prompt, "Waiting for operator");
        self.resume
            .recv()
            .map_err(|_| anyhow!("operator session closed while the board was paused"))?;
        info!(board = %self.path, "Resumed by operator");
        self.enter(BoardPhase::Flashing);
        Ok(())
    }

    /// Check the layout with U-Boot first, then let the operator confirm
    /// before it is written.
    fn emmc_hwpart(&mut self, fast: &Fastboot<'_>, hwpart: &EmmcHwpart) -> Result<()> {
        let args = hwpart.partition_args();
        fast.oem_run(&format!("mmc dev {}", hwpart.device))?;
        fast.oem_run(&format!("mmc hwpartition {} check", args))
            .context("eMMC rejected the hardware partition layout")?;
        self.pause(&format!(
            "About to {} eMMC {} hardware partitioning '{}'. This cannot be undone. Resume to proceed.",
            hwpart.mode(),
            hwpart.device,
            args
        ))?;
        fast.oem_run(&format!("mmc hwpartition {} {}", args, hwpart.mode()))?;
        Ok(())
    }

    /// Download buffer size, reduced to `fb-buffer-size` and whole blocks.
    fn buffer_size(&self, fast: &Fastboot<'_>) -> Result<u64> {
        let value = fast.getvar("downloadsize")?;
        let reported = parse_download_size(&value)
            .with_context(|| format!("invalid fastboot download size '{}'", value))?
            as u64;
        let size = match self.pipeline.fb_buffer_size {
            Some(cap) => reported.min(cap.0),
            None => reported,
        };
        let size = size / LBA_SIZE * LBA_SIZE;
        if size == 0 {
            bail!("fastboot buffer of {} bytes is smaller than a block", reported);
        }
        Ok(size)
    }

    fn flash(&self, fast: &Fastboot<'_>, task: &FlashTask) -> Result<()> {
        let len = fs::metadata(&task.image)
            .with_context(|| format!("reading {}", task.image.display()))?
            .len();
        let buffer = self.buffer_size(fast)?;
        if let (Some(part), None, None) = (task.part.as_deref(), task.image_offset, task.boot_partition())
            && (len <= buffer || is_sparse_file(&task.image)?)
        {
            info!(image = %task.image.display(), part, "Flashing image");
            let cap = usize::try_from(buffer).context("fastboot buffer does not fit in memory")?;
            return flash_file(fast, &task.image, part, Some(cap));
        }
        self.flash_sections(fast, task, len, buffer)
    }

    /// Write an image through a temporary raw partition alias moved along
    /// the device one buffer at a time.
    fn flash_sections(&self, fast: &Fastboot<'_>, task: &FlashTask, len: u64, buffer: u64) -> Result<()> {
        let hwpart = task.boot_partition();
        match (task.part.as_deref(), hwpart) {
            (Some(part), None) => fast.oem_run(&format!("gpt setenv mmc {} {}", task.device, part))?,
            _ => fast.oem_run("setenv gpt_partition_addr 0")?,
        }
        if let Some(offset) = task.image_offset {
            fast.oem_run(&format!(
                "setexpr gpt_partition_addr 0x${{gpt_partition_addr}} + 0x{:x}",
                offset.0 / LBA_SIZE
            ))?;
        }
        let mmcpart = hwpart.map(|n| format!(" mmcpart {}", n)).unwrap_or_default();

        let count = len.div_ceil(buffer);
        let mut offset = 0;
        while offset < len {
            let chunk = (len - offset).min(buffer);
            debug!(offset, chunk, "Flashing section");
            self.sink.progress("flash", offset / buffer + 1, count);
            fast.oem_run(&format!(
                "setexpr {}_offset 0x${{gpt_partition_addr}} + 0x{:x}",
                SECTION_ALIAS,
                offset / LBA_SIZE
            ))?;
            fast.oem_run(&format!(
                "setenv fastboot_raw_partition_{alias} 0x${{{alias}_offset}} 0x{:x}{}",
                chunk.div_ceil(LBA_SIZE),
                mmcpart,
                alias = SECTION_ALIAS
            ))?;
            fast.download_section(&task.image, offset, chunk as usize)?;
            fast.flash(SECTION_ALIAS)?;
            offset += chunk;
        }
        info!(image = %task.image.display(), sections = count, "Image written");
        Ok(())
    }
}

fn is_sparse_file(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(file.read_exact(&mut magic).is_ok() && SparseImage::is_sparse(&magic))
}
