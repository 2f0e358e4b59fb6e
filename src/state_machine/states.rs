use serde::{Deserialize, Serialize};
use std::fmt;

/// Run status definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run has been stored but no job has been created yet
    Created,
    /// At least one job of the run has been created
    Active,
    /// A stage of the run failed
    Failed,
    /// Every configured stage finished successfully
    Finished,
    /// Every configured stage finished, at least one of them reported issues
    FinishedWithIssues,
}

impl RunStatus {
    /// Check if this is a terminal status (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Finished | Self::FinishedWithIssues
        )
    }

    /// Check if the run has failed
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Finished => write!(f, "FINISHED"),
            Self::FinishedWithIssues => write!(f, "FINISHED_WITH_ISSUES"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "ACTIVE" => Ok(Self::Active),
            "FAILED" => Ok(Self::Failed),
            "FINISHED" => Ok(Self::Finished),
            "FINISHED_WITH_ISSUES" => Ok(Self::FinishedWithIssues),
            _ => Err(format!("Invalid run status: {s}")),
        }
    }
}

/// Job status definitions, shared by the jobs of every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job row exists, no work request published yet
    Created,
    /// Work request published to the stage's queue
    Scheduled,
    /// A worker picked the job up
    Running,
    /// The stage failed
    Failed,
    /// The stage completed successfully
    Finished,
    /// The stage completed but reported issues
    FinishedWithIssues,
}

impl JobStatus {
    /// Statuses from which a job counts as not started
    pub const NOT_STARTED: [JobStatus; 2] = [JobStatus::Created, JobStatus::Scheduled];

    /// Statuses that still need work
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Created, JobStatus::Scheduled, JobStatus::Running];

    /// Statuses a job cannot leave again
    pub const TERMINAL: [JobStatus; 3] = [
        JobStatus::Failed,
        JobStatus::Finished,
        JobStatus::FinishedWithIssues,
    ];

    /// Check if this is a terminal ("completed") status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Finished | Self::FinishedWithIssues
        )
    }

    /// Check if no worker has started the job yet
    pub fn is_not_started(&self) -> bool {
        matches!(self, Self::Created | Self::Scheduled)
    }

    /// Check if this job satisfies the dependencies of other stages
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Finished | Self::FinishedWithIssues)
    }

    /// Check if this is the failure status
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Failed => write!(f, "FAILED"),
            Self::Finished => write!(f, "FINISHED"),
            Self::FinishedWithIssues => write!(f, "FINISHED_WITH_ISSUES"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "SCHEDULED" => Ok(Self::Scheduled),
            "RUNNING" => Ok(Self::Running),
            "FAILED" => Ok(Self::Failed),
            "FINISHED" => Ok(Self::Finished),
            "FINISHED_WITH_ISSUES" => Ok(Self::FinishedWithIssues),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

/// Default status for new runs
impl Default for RunStatus {
    fn default() -> Self {
        Self::Created
    }
}

/// Default status for new jobs
impl Default for JobStatus {
    fn default() -> Self {
        Self::Created
    }
}
