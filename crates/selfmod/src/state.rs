//! Self-modification lifecycle as an explicit state machine.
//!
//! `Running → ChangeStaged → RestartRequested → ProcessReplaced`

use ouroboros_core::error::ModificationError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModState {
    /// No uncommitted-to-runtime source changes
    #[default]
    Running,
    /// At least one committed source change awaits a restart
    ChangeStaged,
    /// A restart was requested and the process is about to be replaced
    RestartRequested,
    /// A healthy successor took over; this process must not resume
    ProcessReplaced,
}

impl std::fmt::Display for ModState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::ChangeStaged => "change_staged",
            Self::RestartRequested => "restart_requested",
            Self::ProcessReplaced => "process_replaced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModEvent {
    /// A source change was committed and recorded
    ChangeCommitted,
    RestartRequested,
    /// The launch failed before any successor took over
    RestartAborted { changes_pending: bool },
    /// A successor reported healthy
    SuccessorHealthy,
}

pub fn transition(current: ModState, event: ModEvent) -> Result<ModState, ModificationError> {
    use ModEvent as E;
    use ModState as S;

    match (current, event) {
        (S::Running | S::ChangeStaged, E::ChangeCommitted) => Ok(S::ChangeStaged),
        (S::Running | S::ChangeStaged, E::RestartRequested) => Ok(S::RestartRequested),
        (S::RestartRequested, E::RestartRequested | E::ChangeCommitted) => {
            Err(ModificationError::RestartInProgress)
        }
        (S::RestartRequested, E::RestartAborted { changes_pending: true }) => Ok(S::ChangeStaged),
        (S::RestartRequested, E::RestartAborted { changes_pending: false }) => Ok(S::Running),
        (S::RestartRequested, E::SuccessorHealthy) => Ok(S::ProcessReplaced),
        _ => Err(ModificationError::InvalidTransition {
            from: current.to_string(),
            event: format!("{event:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let s = transition(ModState::Running, ModEvent::ChangeCommitted).unwrap();
        assert_eq!(s, ModState::ChangeStaged);
        let s = transition(s, ModEvent::ChangeCommitted).unwrap();
        let s = transition(s, ModEvent::RestartRequested).unwrap();
        assert_eq!(s, ModState::RestartRequested);
        let s = transition(s, ModEvent::SuccessorHealthy).unwrap();
        assert_eq!(s, ModState::ProcessReplaced);
    }

    #[test]
    fn restart_blocks_further_changes() {
        let s = ModState::RestartRequested;
        assert!(matches!(
            transition(s, ModEvent::ChangeCommitted),
            Err(ModificationError::RestartInProgress)
        ));
        assert!(matches!(
            transition(s, ModEvent::RestartRequested),
            Err(ModificationError::RestartInProgress)
        ));
    }

    #[test]
    fn aborted_restart_returns_to_staged_or_running() {
        let s = ModState::RestartRequested;
        assert_eq!(
            transition(s, ModEvent::RestartAborted { changes_pending: true }).unwrap(),
            ModState::ChangeStaged
        );
        assert_eq!(
            transition(s, ModEvent::RestartAborted { changes_pending: false }).unwrap(),
            ModState::Running
        );
    }

    #[test]
    fn replaced_is_terminal() {
        for event in [
            ModEvent::ChangeCommitted,
            ModEvent::RestartRequested,
            ModEvent::SuccessorHealthy,
            ModEvent::RestartAborted { changes_pending: false },
        ] {
            assert!(transition(ModState::ProcessReplaced, event).is_err());
        }
        assert!(transition(ModState::Running, ModEvent::SuccessorHealthy).is_err());
    }
}
