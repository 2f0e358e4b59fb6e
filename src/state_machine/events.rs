use super::states::JobStatus;
use serde::{Deserialize, Serialize};

/// Events that can trigger job status transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// Work request was published
    Schedule,
    /// A worker started processing the job
    Start,
    /// The worker finished, possibly reporting issues
    Complete { has_issues: bool },
    /// The stage or its worker failed with the given message
    Fail(String),
}

impl JobEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Start => "start",
            Self::Complete { .. } => "complete",
            Self::Fail(_) => "fail",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Fail(_))
    }

    /// Determine the status a job in `current` moves to.
    ///
    /// `None` means the event is stale or duplicated for that status and must
    /// be ignored; this is never an error.
    pub fn target_status(&self, current: JobStatus) -> Option<JobStatus> {
        match (current, self) {
            (JobStatus::Created, Self::Schedule) => Some(JobStatus::Scheduled),
            (status, Self::Start) if status.is_not_started() => Some(JobStatus::Running),
            (status, Self::Complete { has_issues }) if !status.is_terminal() => {
                Some(if *has_issues {
                    JobStatus::FinishedWithIssues
                } else {
                    JobStatus::Finished
                })
            }
            (status, Self::Fail(_)) if !status.is_terminal() => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Helper for creating common events
impl JobEvent {
    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }

    /// Create a completion event from a worker's issue flag
    pub fn complete(has_issues: bool) -> Self {
        Self::Complete { has_issues }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_only_from_not_started() {
        assert_eq!(
            JobEvent::Start.target_status(JobStatus::Created),
            Some(JobStatus::Running)
        );
        assert_eq!(
            JobEvent::Start.target_status(JobStatus::Scheduled),
            Some(JobStatus::Running)
        );
        assert_eq!(JobEvent::Start.target_status(JobStatus::Running), None);
        assert_eq!(JobEvent::Start.target_status(JobStatus::Finished), None);
    }

    #[test]
    fn test_completion_ignored_once_terminal() {
        for status in JobStatus::TERMINAL {
            assert_eq!(JobEvent::complete(false).target_status(status), None);
            assert_eq!(JobEvent::fail_with_error("boom").target_status(status), None);
        }
        assert_eq!(
            JobEvent::complete(true).target_status(JobStatus::Scheduled),
            Some(JobStatus::FinishedWithIssues)
        );
        assert_eq!(
            JobEvent::fail_with_error("boom").target_status(JobStatus::Created),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn test_schedule_only_from_created() {
        assert_eq!(
            JobEvent::Schedule.target_status(JobStatus::Created),
            Some(JobStatus::Scheduled)
        );
        assert_eq!(JobEvent::Schedule.target_status(JobStatus::Running), None);
    }

    #[test]
    fn test_event_accessors() {
        let event = JobEvent::fail_with_error("worker crashed");
        assert_eq!(event.event_type(), "fail");
        assert_eq!(event.error_message(), Some("worker crashed"));
        assert!(event.is_terminal());
        assert!(!JobEvent::Start.is_terminal());
    }
}
