//! Job state model.
//!
//! Three views of a job's state exist at any time: what jobwarden last wrote to
//! the sidecar record ([`NaiveState`]), what the scheduler currently reports
//! ([`BatchState`]), and the reconciliation of the two ([`RealState`]).

use serde::{Deserialize, Serialize};

/// State last written to the sidecar record by jobwarden itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NaiveState {
    /// Submitted, runner not started yet.
    Queued,
    /// Runner marked the job as running.
    Running,
    /// Script exited with zero.
    Finished,
    /// Script or orchestration failed.
    Failed,
    /// Killed by an operator or a termination signal.
    Killed,
    /// Anything unparseable.
    #[serde(other)]
    Unknown,
}

impl NaiveState {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            "killed" => Self::Killed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for NaiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// State reported live by the scheduler. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Queued,
    Held,
    Running,
    Suspended,
    Waiting,
    Exiting,
    Moving,
    Finished,
    /// The scheduler does not know the job (anymore).
    Unknown,
}

impl BatchState {
    /// Map a PBS-style one-letter job state code.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "Q" => Self::Queued,
            "H" => Self::Held,
            "R" => Self::Running,
            "S" => Self::Suspended,
            "W" => Self::Waiting,
            "E" => Self::Exiting,
            "T" => Self::Moving,
            "F" => Self::Finished,
            _ => Self::Unknown,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Queued => "Q",
            Self::Held => "H",
            Self::Running => "R",
            Self::Suspended => "S",
            Self::Waiting => "W",
            Self::Exiting => "E",
            Self::Moving => "T",
            Self::Finished => "F",
            Self::Unknown => "?",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Held => "held",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Waiting => "waiting",
            Self::Exiting => "exiting",
            Self::Moving => "moving",
            Self::Finished => "finished",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Reconciled state of a job. Always derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealState {
    Queued,
    Held,
    Suspended,
    Waiting,
    /// Scheduler started the job before the runner updated the record.
    Booting,
    Running,
    Exiting,
    Killed,
    Failed,
    Finished,
    /// A combination that should never happen; needs manual attention.
    InAnInconsistentState,
    Unknown,
}

impl RealState {
    /// Reconcile the record's state with the scheduler's view.
    ///
    /// Total and pure: every pair maps to exactly one state, and terminal
    /// record states win over whatever the scheduler reports.
    pub fn reconcile(naive: NaiveState, batch: BatchState) -> Self {
        use BatchState as B;

        match naive {
            NaiveState::Unknown => Self::Unknown,
            NaiveState::Killed => Self::Killed,
            NaiveState::Finished => Self::Finished,
            NaiveState::Failed => Self::Failed,
            NaiveState::Queued => match batch {
                B::Queued | B::Moving => Self::Queued,
                B::Held => Self::Held,
                B::Suspended => Self::Suspended,
                B::Waiting => Self::Waiting,
                B::Running => Self::Booting,
                _ => Self::InAnInconsistentState,
            },
            NaiveState::Running => match batch {
                B::Running => Self::Running,
                B::Suspended => Self::Suspended,
                B::Exiting => Self::Exiting,
                _ => Self::InAnInconsistentState,
            },
        }
    }

    /// Waiting for the scheduler to start the job in some way.
    pub fn is_queued_family(&self) -> bool {
        matches!(self, Self::Queued | Self::Held | Self::Waiting | Self::Booting)
    }

    /// The job reached an end state on its own.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Needs manual intervention or cannot be judged at all.
    pub fn is_undeterminable(&self) -> bool {
        matches!(self, Self::Unknown | Self::InAnInconsistentState)
    }
}

impl std::fmt::Display for RealState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Held => "held",
            Self::Suspended => "suspended",
            Self::Waiting => "waiting",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Exiting => "exiting",
            Self::Killed => "killed",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::InAnInconsistentState => "in an inconsistent state",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}
