//! Factory session: every board of a batch, each on its own worker thread.
//!
//! The supervisor never blocks on a board. [`FactorySession::poll`] drains
//! whatever the workers reported since the last call, and paused boards
//! wait until [`FactorySession::resume`] is called for them.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use tracing::{error, info, info_span, warn};

use super::pipeline::{BoardMessage, BoardPhase, BoardPipeline, BoardUpdate};
use super::tasks::BatchConfig;
use crate::session::SessionConfig;
use crate::soc::SocModel;
use crate::usb::{DeviceEntry, DeviceProvider, UsbAddress, UsbPath};

/// State of one board as seen by the supervisor.
#[derive(Debug)]
pub struct BoardSlot {
    pub ids: UsbAddress,
    pub path: UsbPath,
    pub soc: SocModel,
    pub phase: BoardPhase,
    /// Operator prompt while the board is paused.
    pub prompt: Option<String>,
    /// Last log line, for status displays.
    pub status: String,
    pub log: Vec<String>,
    resume: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

/// Board counts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub running: usize,
    pub paused: usize,
    pub done: usize,
    pub failed: usize,
}

pub struct FactorySession {
    batch: BatchConfig,
    tuning: SessionConfig,
    boards: Vec<BoardSlot>,
    updates: Receiver<BoardMessage>,
    sender: Sender<BoardMessage>,
    log: Vec<String>,
    started: SystemTime,
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl FactorySession {
    /// Pick the boards of `batch` among the enumerated `entries`: every
    /// device whose ids appear under `boards`.
    pub fn new(batch: BatchConfig, tuning: SessionConfig, entries: &[DeviceEntry]) -> Self {
        let (sender, updates) = mpsc::channel();
        let mut boards = Vec::new();
        for (ids, soc, _) in batch.boards() {
            for entry in entries.iter().filter(|e| e.matches(&ids)) {
                info!(usb = %ids, path = %entry.path, soc = %soc, "Found board");
                boards.push(BoardSlot {
                    ids: ids.clone(),
                    path: entry.path.clone(),
                    soc,
                    phase: BoardPhase::Rom,
                    prompt: None,
                    status: String::new(),
                    log: Vec::new(),
                    resume: None,
                    worker: None,
                });
            }
        }
        Self {
            batch,
            tuning,
            boards,
            updates,
            sender,
            log: Vec::new(),
            started: SystemTime::now(),
        }
    }

    pub fn boards(&self) -> &[BoardSlot] {
        &self.boards
    }

    fn note(&mut self, line: String) {
        info!("{}", line);
        self.log.push(line);
    }

    /// Start one worker per board. `provider` builds the device provider
    /// each worker owns.
    pub fn start(&mut self, provider: impl Fn() -> Box<dyn DeviceProvider>) -> Result<()> {
        if self.boards.is_empty() {
            bail!("No board of the batch found on the bus");
        }
        self.note(format!("Start: {} boards", self.boards.len()));
        for index in 0..self.boards.len() {
            let slot = &self.boards[index];
            let model = slot.soc.name();
            let Some(pipeline) = self.batch.soc_models.get(model).cloned() else {
                bail!("SoC model {} has no pipeline", model);
            };
            let (resume, resume_rx) = mpsc::channel();
            let mut board = BoardPipeline::new(
                index,
                slot.path.clone(),
                slot.soc,
                pipeline,
                self.tuning.clone(),
                self.sender.clone(),
                resume_rx,
            );
            let mut device_provider = provider();
            let path = slot.path.clone();
            let worker = thread::Builder::new()
                .name(format!("board-{}", path))
                .spawn(move || {
                    let _span = info_span!("board", path = %path).entered();
                    // Failures are reported through the update channel
                    let _ = board.run(device_provider.as_mut());
                })
                .with_context(|| format!("starting worker for board {}", slot.path))?;
            let slot = &mut self.boards[index];
            slot.resume = Some(resume);
            slot.worker = Some(worker);
        }
        Ok(())
    }

    fn apply(&mut self, message: BoardMessage) {
        let Some(slot) = self.boards.get_mut(message.board) else {
            warn!(board = message.board, "Update from unknown board");
            return;
        };
        match message.update {
            BoardUpdate::Phase(phase) => {
                let line = format!("board {} phase: {} -> {}", slot.path, slot.phase, phase);
                slot.phase = phase;
                if phase != BoardPhase::Paused {
                    slot.prompt = None;
                }
                self.note(line);
            }
            BoardUpdate::Log(line) => {
                slot.status = line.clone();
                slot.log.push(line);
            }
            BoardUpdate::Prompt(prompt) => slot.prompt = Some(prompt),
        }
    }

    /// Take in every pending update and reap finished workers. Returns
    /// true once every board is done or failed.
    pub fn poll(&mut self) -> bool {
        loop {
            match self.updates.try_recv() {
                Ok(message) => self.apply(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        let mut lost = Vec::new();
        for (index, slot) in self.boards.iter_mut().enumerate() {
            let finished = slot.worker.as_ref().is_some_and(JoinHandle::is_finished);
            if !finished {
                continue;
            }
            if let Some(worker) = slot.worker.take()
                && worker.join().is_err()
            {
                lost.push(index);
            }
        }
        // Messages sent just before the workers exited
        while let Ok(message) = self.updates.try_recv() {
            self.apply(message);
        }
        for index in lost {
            let slot = &mut self.boards[index];
            error!(board = %slot.path, "Board worker panicked");
            slot.phase = BoardPhase::Failure;
            let line = format!("board {} worker panicked", slot.path);
            self.note(line);
        }
        self.is_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.boards.iter().all(|b| b.phase.is_finished() && b.worker.is_none())
    }

    /// Boards waiting for the operator, with their prompt.
    pub fn paused(&self) -> Vec<(usize, &str)> {
        self.boards
            .iter()
            .enumerate()
            .filter(|(_, b)| b.phase == BoardPhase::Paused)
            .map(|(i, b)| (i, b.prompt.as_deref().unwrap_or("")))
            .collect()
    }

    /// Let a paused board go on.
    pub fn resume(&mut self, board: usize) -> Result<()> {
        let Some(slot) = self.boards.get(board) else {
            bail!("No board {}", board);
        };
        if slot.phase != BoardPhase::Paused {
            bail!("Board {} is not paused ({})", slot.path, slot.phase);
        }
        let line = format!("board {} resumed by operator", slot.path);
        slot.resume
            .as_ref()
            .context("board has no worker")?
            .send(())
            .map_err(|_| anyhow::anyhow!("board {} worker has exited", slot.path))?;
        self.note(line);
        Ok(())
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for board in &self.boards {
            match board.phase {
                BoardPhase::Done => summary.done += 1,
                BoardPhase::Failure => summary.failed += 1,
                BoardPhase::Paused => summary.paused += 1,
                _ => summary.running += 1,
            }
        }
        summary
    }

    /// Session log: summary, batch, per-board results, then the factory
    /// log and every board's log.
    pub fn format_log(&self) -> String {
        let summary = self.summary();
        let mut out = String::new();
        let _ = writeln!(out, "usbrescue factory session {}", unix_secs(self.started));
        let _ = writeln!(
            out,
            "summary: {} done {} failed {} other",
            summary.done,
            summary.failed,
            summary.running + summary.paused
        );
        let _ = writeln!(out, "batch:");
        for (ids, model) in &self.batch.boards {
            let tasks: Vec<&str> = self
                .batch
                .soc_models
                .get(model)
                .map(|p| p.tasks.iter().map(|t| t.name()).collect())
                .unwrap_or_default();
            let _ = writeln!(out, "\t{}: {} [{}]", ids, model, tasks.join(", "));
        }
        let _ = writeln!(out, "results:");
        for board in &self.boards {
            let _ = writeln!(out, "{} at {}: {}", board.ids, board.path, board.phase);
        }
        let _ = writeln!(out, "\nFACTORY LOG:\n");
        for line in &self.log {
            let _ = writeln!(out, "{}", line);
        }
        for board in &self.boards {
            let _ = writeln!(out, "\nBOARD LOG {}:\n", board.path);
            for line in &board.log {
                let _ = writeln!(out, "{}", line);
            }
        }
        out
    }

    /// Write the session log into `dir`. Returns the file written.
    pub fn save_log(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("session-{}.log", unix_secs(self.started)));
        if path.exists() {
            bail!("Log file {} already exists", path.display());
        }
        fs::write(&path, self.format_log()).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Session log written");
        Ok(path)
    }
}

impl Drop for FactorySession {
    /// Paused boards are released by dropping their resume channel; the
    /// workers are then waited for.
    fn drop(&mut self) {
        for slot in &mut self.boards {
            slot.resume = None;
        }
        for slot in &mut self.boards {
            if let Some(worker) = slot.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::MockProvider;

    fn batch() -> BatchConfig {
        BatchConfig::from_yaml_str(
            "boards: {'0483:df11': stm32mp15, '1f3a:efe8': a64}\n\
             soc-models: {stm32mp15: {tasks: [{task: reset}]}, a64: {}}",
            "batch",
        )
        .unwrap()
    }

    fn entry(vid: u16, pid: u16, path: &str) -> DeviceEntry {
        DeviceEntry {
            vid,
            pid,
            release: 0,
            path: path.parse().unwrap(),
        }
    }

    fn wait(session: &mut FactorySession) {
        for _ in 0..500 {
            if session.poll() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("session did not finish");
    }

    #[test]
    fn test_boards_found_by_ids() {
        let entries = [
            entry(0x0483, 0xdf11, "1-1"),
            entry(0x0483, 0xdf11, "1-2"),
            entry(0x1d6b, 0x0002, "2-1"),
        ];
        let session = FactorySession::new(batch(), SessionConfig::default(), &entries);
        let paths: Vec<String> = session.boards().iter().map(|b| b.path.to_string()).collect();
        assert_eq!(paths, vec!["1-1", "1-2"]);
        assert!(session.boards().iter().all(|b| b.phase == BoardPhase::Rom));
    }

    #[test]
    fn test_no_board_is_an_error() {
        let mut session = FactorySession::new(batch(), SessionConfig::default(), &[]);
        assert!(session.start(|| Box::new(MockProvider::new())).is_err());
        assert!(session.is_finished());
    }

    #[test]
    fn test_failed_boards_logged() {
        let entries = [entry(0x0483, 0xdf11, "1-1"), entry(0x0483, 0xdf11, "1-2")];
        let mut session = FactorySession::new(batch(), SessionConfig::default(), &entries);
        session.start(|| Box::new(MockProvider::new())).unwrap();
        wait(&mut session);

        assert_eq!(
            session.summary(),
            Summary {
                failed: 2,
                ..Default::default()
            }
        );
        assert!(session.resume(0).is_err());
        let log = session.format_log();
        assert!(log.contains("summary: 0 done 2 failed 0 other"));
        assert!(log.contains("\t0483:df11: stm32mp15 [reset]"));
        assert!(log.contains("0483:df11 at 1-2: FAILURE"));
        assert!(log.contains("board 1-1 phase: ROM -> RECOVERING"));
        assert!(log.contains("BOARD LOG 1-1:"));

        let dir = tempfile::tempdir().unwrap();
        let path = session.save_log(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), log);
        assert!(session.save_log(dir.path()).is_err());
    }
}
