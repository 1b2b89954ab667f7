//! Autonomy levels and the gate that decides whether an action may run.
//!
//! The gate is a pure function: all state about pending confirmations is
//! owned by the agent loop.

use serde::{Deserialize, Serialize};

use crate::tool::DangerLevel;

/// How much freedom the agent has to act. Ordered from most to least
/// restrictive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Every action needs confirmation, even reads
    Paranoid,
    /// Anything with side effects needs confirmation (default)
    #[default]
    Careful,
    /// Only self-modification needs confirmation
    Balanced,
    /// Never blocks; dangerous actions are audited after the fact
    Autonomous,
}

impl AutonomyLevel {
    pub const ALL: [AutonomyLevel; 4] = [
        AutonomyLevel::Paranoid,
        AutonomyLevel::Careful,
        AutonomyLevel::Balanced,
        AutonomyLevel::Autonomous,
    ];
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Paranoid => "paranoid",
            Self::Careful => "careful",
            Self::Balanced => "balanced",
            Self::Autonomous => "autonomous",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "paranoid" => Ok(Self::Paranoid),
            "careful" => Ok(Self::Careful),
            "balanced" => Ok(Self::Balanced),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(format!(
                "unknown autonomy level '{other}' (expected paranoid, careful, balanced or autonomous)"
            )),
        }
    }
}

/// What the gate decided for one pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Dispatch now. `audit` asks for a post-hoc journal entry.
    Proceed { audit: bool },
    /// Suspend the conversation until a confirmation event arrives.
    RequireConfirmation,
}

impl GateDecision {
    pub fn proceeds(&self) -> bool {
        matches!(self, Self::Proceed { .. })
    }
}

/// Decide whether an action of `danger` may run under `level`.
///
/// | level      | needs confirmation for                  |
/// |------------|-----------------------------------------|
/// | Paranoid   | everything                              |
/// | Careful    | moderate, dangerous, self_modifying     |
/// | Balanced   | self_modifying                          |
/// | Autonomous | nothing (dangerous and above audited)   |
///
/// A standing confirmation lets the action through at any level.
pub fn evaluate(
    danger: DangerLevel,
    level: AutonomyLevel,
    has_standing_confirmation: bool,
) -> GateDecision {
    let audit = danger >= DangerLevel::Dangerous;

    let blocked = match level {
        AutonomyLevel::Paranoid => true,
        AutonomyLevel::Careful => danger >= DangerLevel::Moderate,
        AutonomyLevel::Balanced => danger == DangerLevel::SelfModifying,
        AutonomyLevel::Autonomous => false,
    };

    if blocked && !has_standing_confirmation {
        GateDecision::RequireConfirmation
    } else {
        GateDecision::Proceed {
            audit: audit && level == AutonomyLevel::Autonomous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AutonomyLevel::*;
    use DangerLevel::*;

    const CONFIRM: GateDecision = GateDecision::RequireConfirmation;
    const GO: GateDecision = GateDecision::Proceed { audit: false };
    const AUDIT: GateDecision = GateDecision::Proceed { audit: true };

    #[test]
    fn exhaustive_gate_table() {
        let table = [
            (Paranoid, Safe, CONFIRM),
            (Paranoid, Moderate, CONFIRM),
            (Paranoid, Dangerous, CONFIRM),
            (Paranoid, SelfModifying, CONFIRM),
            (Careful, Safe, GO),
            (Careful, Moderate, CONFIRM),
            (Careful, Dangerous, CONFIRM),
            (Careful, SelfModifying, CONFIRM),
            (Balanced, Safe, GO),
            (Balanced, Moderate, GO),
            (Balanced, Dangerous, GO),
            (Balanced, SelfModifying, CONFIRM),
            (Autonomous, Safe, GO),
            (Autonomous, Moderate, GO),
            (Autonomous, Dangerous, AUDIT),
            (Autonomous, SelfModifying, AUDIT),
        ];
        assert_eq!(table.len(), AutonomyLevel::ALL.len() * DangerLevel::ALL.len());

        for (level, danger, expected) in table {
            assert_eq!(
                evaluate(danger, level, false),
                expected,
                "level={level} danger={danger}"
            );
        }
    }

    #[test]
    fn standing_confirmation_always_proceeds() {
        for level in AutonomyLevel::ALL {
            for danger in DangerLevel::ALL {
                assert!(evaluate(danger, level, true).proceeds(), "{level}/{danger}");
            }
        }
    }

    #[test]
    fn levels_are_ordered() {
        assert!(Paranoid < Careful && Careful < Balanced && Balanced < Autonomous);
    }

    #[test]
    fn parse_and_display_agree() {
        for level in AutonomyLevel::ALL {
            assert_eq!(level.to_string().parse::<AutonomyLevel>().unwrap(), level);
        }
        assert!("reckless".parse::<AutonomyLevel>().is_err());
    }
}
