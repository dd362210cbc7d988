//! Execution state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one plugin.
///
/// ```text
/// idle      -> starting
/// starting  -> running
/// starting  -> failed     (instantiation failed)
/// running   -> completed
/// running   -> failed
/// running   -> cancelled
/// completed -> idle
/// failed    -> idle
/// cancelled -> idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether `from -> to` is an edge of the state graph.
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Starting, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Completed, Self::Idle)
                | (Self::Failed, Self::Idle)
                | (Self::Cancelled, Self::Idle)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionState {
    type Err = ExecutionStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ExecutionStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionState`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStateParseError(pub String);

impl fmt::Display for ExecutionStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution state: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStateParseError {}

/// Attempted edge outside the state graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid state transition for {plugin_id}: {from} -> {to}")]
pub struct TransitionError {
    pub plugin_id: String,
    pub from: ExecutionState,
    pub to: ExecutionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ExecutionState; 6] = [
        ExecutionState::Idle,
        ExecutionState::Starting,
        ExecutionState::Running,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ];

    #[test]
    fn display_roundtrip() {
        for state in ALL {
            assert_eq!(state.to_string().parse::<ExecutionState>().unwrap(), state);
        }
        assert!("paused".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn every_terminal_state_returns_to_idle() {
        for state in ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(ExecutionState::is_valid_transition(state, ExecutionState::Idle));
            assert!(!ExecutionState::is_valid_transition(state, ExecutionState::Running));
        }
    }

    #[test]
    fn idle_only_starts() {
        for to in ALL {
            assert_eq!(
                ExecutionState::is_valid_transition(ExecutionState::Idle, to),
                to == ExecutionState::Starting,
                "idle -> {to}"
            );
        }
    }

    #[test]
    fn cancellation_only_from_running() {
        for from in ALL {
            assert_eq!(
                ExecutionState::is_valid_transition(from, ExecutionState::Cancelled),
                from == ExecutionState::Running,
                "{from} -> cancelled"
            );
        }
    }
}
