//! Shared enums for jobs and plans.
//!
//! These are the stable vocabulary written into job frontmatter and plan
//! config. String forms are part of the on-disk format and must not change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    NeedsReview,
    PendingUser,
    PendingLlm,
    Hold,
    Todo,
    Abandoned,
}

impl JobStatus {
    pub const ALL: [JobStatus; 11] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Blocked,
        JobStatus::NeedsReview,
        JobStatus::PendingUser,
        JobStatus::PendingLlm,
        JobStatus::Hold,
        JobStatus::Todo,
        JobStatus::Abandoned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Blocked => "blocked",
            JobStatus::NeedsReview => "needs_review",
            JobStatus::PendingUser => "pending_user",
            JobStatus::PendingLlm => "pending_llm",
            JobStatus::Hold => "hold",
            JobStatus::Todo => "todo",
            JobStatus::Abandoned => "abandoned",
        }
    }

    /// Terminal statuses record `completed_at` and `duration`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Abandoned
        )
    }

    pub fn icon(self) -> &'static str {
        match self {
            JobStatus::Completed => "✓",
            JobStatus::Running => "◐",
            JobStatus::Failed => "✗",
            JobStatus::Abandoned => "⊘",
            JobStatus::PendingUser | JobStatus::PendingLlm => "…",
            JobStatus::Hold | JobStatus::Blocked => "⏸",
            JobStatus::Pending | JobStatus::Todo | JobStatus::NeedsReview => "○",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "job status",
                value: s.to_string(),
            })
    }
}

/// A rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Check whether a job may move from `from` to `to`.
///
/// The core path is `pending -> running -> {completed | failed}`. A completed
/// job never changes status again.
pub fn check_transition(from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
    use JobStatus::{
        Abandoned, Blocked, Completed, Failed, Hold, NeedsReview, Pending, PendingLlm,
        PendingUser, Running, Todo,
    };

    let allowed = match (from, to) {
        (Completed, _) => false,
        (_, Abandoned) => from != Abandoned,
        (Pending | PendingUser | PendingLlm, Running) => true,
        (Running, Completed | Failed | PendingUser | PendingLlm | NeedsReview | Pending) => true,
        (Failed, Pending) => true,
        (Pending | Todo | Blocked, Hold) => true,
        (Hold | Todo | Blocked, Pending) => true,
        (Pending, Blocked | Todo) => true,
        (PendingUser | NeedsReview, Completed) => true,
        (NeedsReview, Pending) => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Executor family for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Shell,
    Oneshot,
    Agent,
    InteractiveAgent,
    Chat,
    /// Shorthand for a oneshot job whose output mode is `generate_jobs`.
    GenerateJobs,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Shell,
        JobType::Oneshot,
        JobType::Agent,
        JobType::InteractiveAgent,
        JobType::Chat,
        JobType::GenerateJobs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Shell => "shell",
            JobType::Oneshot => "oneshot",
            JobType::Agent => "agent",
            JobType::InteractiveAgent => "interactive_agent",
            JobType::Chat => "chat",
            JobType::GenerateJobs => "generate_jobs",
        }
    }

    /// Agent types run in a terminal session and need a worktree.
    pub fn is_agent(self) -> bool {
        matches!(self, JobType::Agent | JobType::InteractiveAgent)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "job type",
                value: s.to_string(),
            })
    }
}

/// Where a oneshot job's response goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Append under the job's `## Output` section.
    #[default]
    Append,
    /// Write to `output.path` (relative to the plan directory).
    File,
    /// Discard.
    None,
    /// Parse new job documents out of the response.
    GenerateJobs,
}

impl FromStr for OutputMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(OutputMode::Append),
            "file" => Ok(OutputMode::File),
            "none" => Ok(OutputMode::None),
            "generate_jobs" => Ok(OutputMode::GenerateJobs),
            _ => Err(UnknownVariant {
                kind: "output type",
                value: s.to_string(),
            }),
        }
    }
}

/// Plan lifecycle status stored in `.grove-plan.yml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Active,
    Review,
    Finished,
    Hold,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Active => "active",
            PlanStatus::Review => "review",
            PlanStatus::Finished => "finished",
            PlanStatus::Hold => "hold",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().expect("parse"), status);
        }
        assert!("PENDING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn core_path_is_allowed() {
        check_transition(JobStatus::Pending, JobStatus::Running).expect("start");
        check_transition(JobStatus::Running, JobStatus::Completed).expect("complete");
        check_transition(JobStatus::Running, JobStatus::Failed).expect("fail");
    }

    #[test]
    fn completed_is_immutable() {
        for to in JobStatus::ALL {
            let err = check_transition(JobStatus::Completed, to).unwrap_err();
            assert_eq!(err.from, JobStatus::Completed);
        }
    }

    #[test]
    fn pending_cannot_skip_running() {
        assert!(check_transition(JobStatus::Pending, JobStatus::Completed).is_err());
        assert!(check_transition(JobStatus::Pending, JobStatus::Failed).is_err());
    }

    #[test]
    fn job_type_parses_snake_case() {
        assert_eq!(
            "interactive_agent".parse::<JobType>().expect("parse"),
            JobType::InteractiveAgent
        );
        assert!(JobType::Agent.is_agent());
        assert!(!JobType::Shell.is_agent());
    }
}
