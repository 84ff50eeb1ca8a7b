//! `flow chat run`: answer chats that are waiting on the LLM.

use anyhow::Result;
use tracing::{debug, info};

use crate::core::job::Job;
use crate::core::types::{JobStatus, JobType};
use crate::dispatch::{DispatchError, Dispatcher, Outcome, RunOptions};

/// Chats picked for a run plus the requested titles that were passed over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatSelection {
    pub selected: Vec<String>,
    /// `(requested title, reason)`.
    pub skipped: Vec<(String, String)>,
}

fn is_runnable_chat(job: &Job) -> bool {
    job.job_type == JobType::Chat && job.status == JobStatus::PendingUser
}

fn matches_title(job: &Job, title: &str) -> bool {
    job.title.eq_ignore_ascii_case(title.trim())
        || job.filename == title
        || job.id == title
        || job.stem() == title
}

/// Without titles every `pending_user` chat is selected. With titles, only
/// chats matching one of them and also runnable.
pub fn select_chats(jobs: &[Job], titles: &[String]) -> ChatSelection {
    let mut selection = ChatSelection::default();
    if titles.is_empty() {
        selection.selected = jobs
            .iter()
            .filter(|job| is_runnable_chat(job))
            .map(|job| job.filename.clone())
            .collect();
        return selection;
    }
    for title in titles {
        let matched: Vec<&Job> = jobs.iter().filter(|job| matches_title(job, title)).collect();
        if matched.is_empty() {
            selection
                .skipped
                .push((title.clone(), "no chat with that title".to_string()));
            continue;
        }
        for job in matched {
            if !is_runnable_chat(job) {
                let reason = if job.job_type == JobType::Chat {
                    format!("status is {}", job.status)
                } else {
                    format!("{} is a {} job, not a chat", job.filename, job.job_type)
                };
                selection.skipped.push((title.clone(), reason));
            } else if !selection.selected.contains(&job.filename) {
                selection.selected.push(job.filename.clone());
            }
        }
    }
    selection
}

#[derive(Debug, Default)]
pub struct ChatRunReport {
    pub selection: ChatSelection,
    pub answered: Vec<Outcome>,
    /// Selected chats whose last turn is already an LLM reply.
    pub waiting_on_user: Vec<String>,
}

/// Run one turn for every selected chat.
pub fn run_chats(dispatcher: &Dispatcher<'_>, titles: &[String]) -> Result<ChatRunReport> {
    let jobs = dispatcher.store().load_jobs()?;
    let selection = select_chats(&jobs, titles);
    debug!(selected = ?selection.selected, "chat selection");
    let mut report = ChatRunReport {
        selection,
        ..ChatRunReport::default()
    };
    for filename in report.selection.selected.clone() {
        match dispatcher.run_job(&filename, RunOptions::default()) {
            Ok(outcome) => report.answered.push(outcome),
            Err(err) => match err.downcast_ref::<DispatchError>() {
                Some(DispatchError::NotRunnable { .. }) => report.waiting_on_user.push(filename),
                _ => return Err(err),
            },
        }
    }
    info!(answered = report.answered.len(), "chat run finished");
    Ok(report)
}
