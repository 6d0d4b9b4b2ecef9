//! Phase tracking for a board recovery.

use thiserror::Error;
use tracing::info;

use crate::events::{EventSink, RecoveryEvent, RecoveryPhase};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid phase transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RecoveryPhase,
    pub to: RecoveryPhase,
}

/// Current phase of one board, with the transitions it may take.
///
/// `Done` and `Failure` are terminal. `Paused` is only reachable from a
/// second stage transfer and only returns to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseMachine {
    phase: RecoveryPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: RecoveryPhase::DeviceSearch,
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, RecoveryPhase::Done | RecoveryPhase::Failure)
    }

    pub fn allows(from: RecoveryPhase, to: RecoveryPhase) -> bool {
        use RecoveryPhase::*;
        match (from, to) {
            (Done | Failure, _) => false,
            (_, Failure) => true,
            (DeviceSearch, Phase1Transfer) => true,
            (Phase1Transfer, ReenumerationWait | Phase2Transfer | Done) => true,
            (ReenumerationWait, Phase1Transfer | Phase2Transfer | Done) => true,
            (Phase2Transfer, ReenumerationWait | Paused | Done) => true,
            (Paused, Phase2Transfer) => true,
            _ => false,
        }
    }

    /// Move to `to`, reporting the change to `sink`. Staying in the same
    /// phase is a no-op.
    pub fn transition(&mut self, to: RecoveryPhase, sink: &dyn EventSink) -> Result<(), TransitionError> {
        if to == self.phase {
            return Ok(());
        }
        if !Self::allows(self.phase, to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        info!(from = %self.phase, to = %to, "Phase transition");
        sink.on_event(&RecoveryEvent::PhaseChanged {
            from: self.phase,
            to,
        });
        self.phase = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use RecoveryPhase::*;

    #[test]
    fn test_two_stage_flow() {
        let sink = RecordingSink::new();
        let mut machine = PhaseMachine::new();
        for phase in [Phase1Transfer, ReenumerationWait, Phase2Transfer, Phase2Transfer, Done] {
            machine.transition(phase, &sink).unwrap();
        }
        assert!(machine.is_terminal());
        assert_eq!(
            sink.phases(),
            vec![Phase1Transfer, ReenumerationWait, Phase2Transfer, Done]
        );
    }

    #[test]
    fn test_rejects_invalid_transitions() {
        let sink = RecordingSink::new();
        let mut machine = PhaseMachine::new();
        assert_eq!(
            machine.transition(Phase2Transfer, &sink),
            Err(TransitionError {
                from: DeviceSearch,
                to: Phase2Transfer
            })
        );
        machine.transition(Failure, &sink).unwrap();
        assert!(machine.transition(Phase1Transfer, &sink).is_err());
        assert!(sink.phases() == vec![Failure]);
    }

    #[test]
    fn test_pause_only_from_second_stage() {
        assert!(!PhaseMachine::allows(Phase1Transfer, Paused));
        assert!(PhaseMachine::allows(Phase2Transfer, Paused));
        assert!(PhaseMachine::allows(Paused, Phase2Transfer));
        assert!(PhaseMachine::allows(Paused, Failure));
        assert!(!PhaseMachine::allows(Paused, Done));
    }
}
