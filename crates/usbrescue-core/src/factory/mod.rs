//! Factory flashing of many boards at once.
//!
//! A batch file names the boards to look for and, per SoC model, the
//! recovery firmware and the tasks to run once U-Boot is up. Each board
//! runs on its own worker thread under a [`FactorySession`].

pub mod pipeline;
pub mod session;
pub mod tasks;

pub use pipeline::{BoardMessage, BoardPhase, BoardPipeline, BoardUpdate};
pub use session::{BoardSlot, FactorySession, Summary};
pub use tasks::{BatchConfig, SocPipeline, Task, TaskError};
