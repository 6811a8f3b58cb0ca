//! Execution status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The status of an execution, stage or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Not yet started.
    NotStarted,
    /// Currently executing.
    Running,
    /// Paused by a user; resumes where it left off.
    Paused,
    /// Waiting on an external signal.
    Suspended,
    /// Completed successfully.
    Succeeded,
    /// Failed, but the pipeline is allowed to continue.
    FailedContinue,
    /// Failed and halted the pipeline.
    Terminal,
    /// Canceled by a user or by a failed sibling branch.
    Canceled,
    /// The task asked to loop back to an earlier task.
    Redirect,
    /// Failed, halting this branch without failing the pipeline.
    Stopped,
    /// Queued behind a concurrency limit.
    Buffered,
    /// Skipped, either manually or by a precondition.
    Skipped,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl ExecutionStatus {
    /// All statuses in declaration order.
    pub const ALL: [Self; 12] = [
        Self::NotStarted,
        Self::Running,
        Self::Paused,
        Self::Suspended,
        Self::Succeeded,
        Self::FailedContinue,
        Self::Terminal,
        Self::Canceled,
        Self::Redirect,
        Self::Stopped,
        Self::Buffered,
        Self::Skipped,
    ];

    /// Returns true once no further work will happen.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Self::Canceled
                | Self::Succeeded
                | Self::Stopped
                | Self::Skipped
                | Self::Terminal
                | Self::FailedContinue
        )
    }

    /// Returns true if the status stops downstream work.
    #[must_use]
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Terminal | Self::Canceled | Self::Stopped)
    }

    /// Returns true if downstream stages may start.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Stopped | Self::Skipped)
    }

    /// Returns true if the status is a failure of any kind.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Terminal | Self::Stopped | Self::FailedContinue)
    }

    /// Returns the wire name, e.g. `NOT_STARTED`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Succeeded => "SUCCEEDED",
            Self::FailedContinue => "FAILED_CONTINUE",
            Self::Terminal => "TERMINAL",
            Self::Canceled => "CANCELED",
            Self::Redirect => "REDIRECT",
            Self::Stopped => "STOPPED",
            Self::Buffered => "BUFFERED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Combines the statuses of child work into one status.
    ///
    /// Failures dominate in the order TERMINAL, CANCELED, STOPPED,
    /// FAILED_CONTINUE. Any unfinished child keeps the result RUNNING. A
    /// non-empty set of only skipped children is SKIPPED and an empty set is
    /// NOT_STARTED.
    #[must_use]
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let statuses: Vec<Self> = statuses.into_iter().collect();
        if statuses.is_empty() {
            return Self::NotStarted;
        }

        let any = |wanted: Self| statuses.iter().any(|s| *s == wanted);
        if any(Self::Terminal) {
            Self::Terminal
        } else if any(Self::Canceled) {
            Self::Canceled
        } else if any(Self::Stopped) {
            Self::Stopped
        } else if statuses.iter().any(|s| !s.is_complete()) {
            Self::Running
        } else if any(Self::FailedContinue) {
            Self::FailedContinue
        } else if statuses.iter().all(|s| *s == Self::Skipped) {
            Self::Skipped
        } else {
            Self::Succeeded
        }
    }

    /// Final status of an execution given its top-level stage statuses.
    ///
    /// Stages that never started (downstream of a halt) are ignored. A
    /// pipeline whose failures were all allowed to continue, or only stopped
    /// branches, succeeds.
    #[must_use]
    pub fn for_execution<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let started: Vec<Self> = statuses
            .into_iter()
            .filter(|s| *s != Self::NotStarted)
            .collect();

        if started.iter().any(|s| *s == Self::Terminal) {
            Self::Terminal
        } else if started.iter().any(|s| *s == Self::Canceled) {
            Self::Canceled
        } else if started.iter().any(|s| !s.is_complete()) {
            Self::Running
        } else {
            Self::Succeeded
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown execution status: {s}"))
    }
}

/// Whether an execution is a user pipeline or an ad-hoc orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// A configured pipeline.
    Pipeline,
    /// A one-off orchestration (e.g. from the UI).
    Orchestration,
}

impl Default for ExecutionType {
    fn default() -> Self {
        Self::Pipeline
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Orchestration => write!(f, "orchestration"),
        }
    }
}

/// Position of a synthetic stage relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyntheticStageOwner {
    /// Runs before the parent's tasks.
    #[serde(rename = "STAGE_BEFORE")]
    Before,
    /// Runs after the parent's tasks.
    #[serde(rename = "STAGE_AFTER")]
    After,
}

impl SyntheticStageOwner {
    /// Separator used when deriving child ref ids.
    #[must_use]
    pub fn ref_id_separator(&self) -> char {
        match self {
            Self::Before => '<',
            Self::After => '>',
        }
    }
}

impl fmt::Display for SyntheticStageOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => write!(f, "STAGE_BEFORE"),
            Self::After => write!(f, "STAGE_AFTER"),
        }
    }
}
