//! Pure state machine for one job's control flow
//!
//! No async and no I/O: `transition(state, event, retry_budget)` decides the
//! next state and the agent loop performs the work that state implies.
//! Invalid transitions abort with `IoFailure` rather than panic.

use backspace_core::AbortReason;
use serde::{Deserialize, Serialize};

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Materializing,
    Generating { attempt: u32 },
    Applying { attempt: u32 },
    Validating { attempt: u32 },
    /// Attempt failed with budget remaining; next is `Generating`
    Revising { attempt: u32 },
    Accepted { attempt: u32 },
    Aborted { reason: AbortReason },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted { .. } | Self::Aborted { .. })
    }

    /// Attempt number for states inside an attempt
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Self::Generating { attempt }
            | Self::Applying { attempt }
            | Self::Validating { attempt }
            | Self::Revising { attempt }
            | Self::Accepted { attempt } => Some(*attempt),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Materializing => "materializing",
            Self::Generating { .. } => "generating",
            Self::Applying { .. } => "applying",
            Self::Validating { .. } => "validating",
            Self::Revising { .. } => "revising",
            Self::Accepted { .. } => "accepted",
            Self::Aborted { .. } => "aborted",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted { reason } => write!(f, "aborted({})", reason),
            other => match other.attempt() {
                Some(attempt) => write!(f, "{}#{}", other.name(), attempt),
                None => write!(f, "{}", other.name()),
            },
        }
    }
}

/// What happened in the state the job was in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    Start,
    Materialized,
    /// Materialization or another non-retryable step failed
    Failed { reason: AbortReason },
    EditSetReady,
    /// Generator error, timeout or empty edit set
    GenerationFailed,
    Applied,
    ApplyConflict,
    ValidationPassed,
    ValidationFailed,
    /// Leave `Revising` for the next attempt
    Retry,
    /// Cancellation or deadline
    Interrupted { reason: AbortReason },
}

/// Deterministic transition function
///
/// `retry_budget` is the maximum number of attempts.
pub fn transition(state: JobState, event: LoopEvent, retry_budget: u32) -> JobState {
    use JobState::*;
    use LoopEvent as E;

    let revise_or_abort = |attempt: u32, exhausted: AbortReason| {
        if attempt < retry_budget {
            Revising { attempt }
        } else {
            Aborted { reason: exhausted }
        }
    };

    match (state, event) {
        // Terminal states absorb everything
        (s, _) if s.is_terminal() => s,

        (_, E::Interrupted { reason }) => Aborted { reason },
        (_, E::Failed { reason }) => Aborted { reason },

        (Pending, E::Start) => Materializing,
        (Materializing, E::Materialized) if retry_budget > 0 => Generating { attempt: 1 },
        (Materializing, E::Materialized) => Aborted {
            reason: AbortReason::GenerationExhausted,
        },

        (Generating { attempt }, E::EditSetReady) => Applying { attempt },
        (Generating { attempt }, E::GenerationFailed) => {
            revise_or_abort(attempt, AbortReason::GenerationExhausted)
        }

        (Applying { attempt }, E::Applied) => Validating { attempt },
        (Applying { attempt }, E::ApplyConflict) => {
            revise_or_abort(attempt, AbortReason::ApplyExhausted)
        }

        (Validating { attempt }, E::ValidationPassed) => Accepted { attempt },
        (Validating { attempt }, E::ValidationFailed) => {
            revise_or_abort(attempt, AbortReason::ValidationExhausted)
        }

        (Revising { attempt }, E::Retry) => Generating {
            attempt: attempt + 1,
        },

        // Anything else is a bug in the driver
        _ => Aborted {
            reason: AbortReason::IoFailure,
        },
    }
}
