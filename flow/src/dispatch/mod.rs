//! Job execution.
//!
//! Every job type shares one contract: preconditions are checked without
//! touching the job file, then the job is marked `running` and persisted,
//! the type-specific executor runs, and the outcome is written back (output
//! section, terminal status, optional summary). Failures after the job went
//! `running` are recorded as `failed` and returned as a [`DispatchError`].

mod agent;
mod chat;
mod generate;
mod oneshot;
mod shell;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::chat::{awaiting_llm, parse_turns};
use crate::core::generated::GenerationError;
use crate::core::graph::DependencyGraph;
use crate::core::job::{Job, JobError};
use crate::core::output::append_output;
use crate::core::types::{JobStatus, JobType};
use crate::io::config::FlowConfig;
use crate::io::container::ContainerProbe;
use crate::io::discovery::WorkspaceDiscovery;
use crate::io::job_store::{JobStore, LockState, resolve};
use crate::io::llm::{LlmClient, Summarizer};
use crate::io::logs::JobLogs;
use crate::io::session::SessionManager;
use crate::plan::Plan;
use crate::worktree::{WorktreeManager, WorktreeRequest};

/// Why a job could not be run or did not succeed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot run '{job}': dependency '{dependency}' is {status}")]
    DependencyNotMet {
        job: String,
        dependency: String,
        status: String,
    },
    #[error("cannot run '{job}': {job_type} jobs require a worktree (set 'worktree' on the job or the plan)")]
    WorktreeRequired { job: String, job_type: JobType },
    #[error("failed to provision worktree '{worktree}': {message}")]
    WorktreeProvisionFailed { worktree: String, message: String },
    #[error("container '{container}' is not running; start it and retry")]
    ContainerNotRunning { container: String },
    #[error("session launch for '{job}' failed: {message}\n  inspect with: {diagnostic}")]
    SessionLaunchFailed {
        job: String,
        message: String,
        diagnostic: String,
    },
    #[error("'{job}' failed: {message}")]
    ExecutionFailed { job: String, message: String },
    #[error("'{job}' produced unusable jobs: {source}")]
    GenerationParseFailed {
        job: String,
        #[source]
        source: GenerationError,
    },
    #[error("'{job}' is already completed")]
    AlreadyCompleted { job: String },
    #[error("'{job}' is already running")]
    AlreadyRunning { job: String },
    #[error("cannot run '{job}': it is {status}")]
    NotRunnable { job: String, status: String },
    #[error(
        "cannot run '{job}': interactive_agent jobs require a human session and --skip-interactive was given; rerun without --skip-interactive"
    )]
    InteractiveSkipped { job: String },
    #[error(
        "'{job}' is marked running but no live process holds it; reset it with 'flow plan jobs reset {job}' or mark it done with 'flow plan complete {job}'"
    )]
    StaleRunning { job: String },
}

impl DispatchError {
    /// Raised before the job file was touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            DispatchError::DependencyNotMet { .. }
                | DispatchError::WorktreeRequired { .. }
                | DispatchError::ContainerNotRunning { .. }
                | DispatchError::AlreadyCompleted { .. }
                | DispatchError::AlreadyRunning { .. }
                | DispatchError::NotRunnable { .. }
                | DispatchError::InteractiveSkipped { .. }
                | DispatchError::StaleRunning { .. }
        )
    }
}

/// External capabilities used by executors.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub llm: &'a dyn LlmClient,
    pub sessions: &'a dyn SessionManager,
    pub containers: &'a dyn ContainerProbe,
    pub discovery: &'a dyn WorkspaceDiscovery,
    pub summarizer: Option<&'a dyn Summarizer>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_interactive: bool,
}

/// Result of a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub filename: String,
    pub status: JobStatus,
    /// Text appended to the job's output section.
    pub output: Option<String>,
    /// Files created by `generate_jobs`.
    pub created: Vec<String>,
    /// Lines for the user (worktree setup, attach hints).
    pub notes: Vec<String>,
}

/// What an executor produced.
#[derive(Debug, Default)]
struct Execution {
    status: Option<JobStatus>,
    output: Option<String>,
    /// Replacement body (chats rewrite their conversation).
    body: Option<String>,
    failure: Option<String>,
    created: Vec<String>,
    notes: Vec<String>,
}

impl Execution {
    fn finished(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Everything an executor may read.
struct ExecContext<'a> {
    plan: &'a Plan,
    flow: &'a FlowConfig,
    store: &'a JobStore,
    jobs: &'a [Job],
    graph: &'a DependencyGraph,
    collab: Collaborators<'a>,
    logs: JobLogs,
    /// Where commands run: the worktree (or its repository), else the plan directory.
    workdir: PathBuf,
    /// Worktree root when the job has one.
    worktree: Option<PathBuf>,
    container: Option<&'a str>,
}

impl ExecContext<'_> {
    fn model_for(&self, job: &Job) -> Option<String> {
        job.model
            .clone()
            .or_else(|| self.plan.config.model.clone())
            .or_else(|| self.flow.default_model.clone())
    }
}

pub struct Dispatcher<'a> {
    plan: &'a Plan,
    flow: &'a FlowConfig,
    store: JobStore,
    collab: Collaborators<'a>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(plan: &'a Plan, flow: &'a FlowConfig, collab: Collaborators<'a>) -> Self {
        Self {
            plan,
            flow,
            store: plan.store(),
            collab,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Run one job by filename or id.
    #[instrument(skip_all, fields(plan = %self.plan.name, job = reference))]
    pub fn run_job(&self, reference: &str, options: RunOptions) -> Result<Outcome> {
        let jobs = self.store.load_jobs()?;
        let graph = DependencyGraph::build(&jobs)?;
        let mut job = resolve(&jobs, reference)
            .cloned()
            .ok_or_else(|| JobError::NotFound(reference.to_string()))?;
        if job.worktree.is_none() && job.job_type.is_agent() {
            job.worktree = self.plan.config.worktree.clone();
        }

        self.preflight(&job, &graph, options)?;

        let mut notes = Vec::new();
        let worktree = match job.worktree.clone() {
            Some(name) => Some(self.provision(&name, &job, &mut notes)?),
            None => None,
        };
        let workdir = match (&worktree, &job.repository) {
            (Some(tree), Some(repo)) => tree.join(repo),
            (Some(tree), None) => tree.clone(),
            (None, _) => self.plan.dir.clone(),
        };

        let container = self.container();

        job.set_status(JobStatus::Running, Utc::now())?;
        self.store.write(&job)?;
        self.store.write_lock(&job, std::process::id())?;
        info!(job = %job.filename, job_type = %job.job_type, "job running");

        let ctx = ExecContext {
            plan: self.plan,
            flow: self.flow,
            store: &self.store,
            jobs: &jobs,
            graph: &graph,
            collab: self.collab,
            logs: JobLogs::new(&self.plan.dir, &job),
            workdir,
            worktree,
            container,
        };
        let result = match job.job_type {
            JobType::Shell => shell::execute(&job, &ctx),
            JobType::Oneshot | JobType::GenerateJobs => oneshot::execute(&job, &ctx),
            JobType::Agent | JobType::InteractiveAgent => agent::execute(&job, &ctx),
            JobType::Chat => chat::execute(&job, &ctx),
        };
        let exec = match result {
            Ok(exec) => exec,
            Err(err) => {
                self.finish(&mut job, execution_error(&err))?;
                return Err(err.into());
            }
        };
        let failure = exec.failure.clone();
        let mut outcome = self.finish(&mut job, exec)?;
        notes.append(&mut outcome.notes);
        outcome.notes = notes;
        if let Some(message) = failure {
            return Err(DispatchError::ExecutionFailed {
                job: job.filename,
                message,
            }
            .into());
        }
        Ok(outcome)
    }

    /// Checks that must pass before the job file is modified.
    fn preflight(&self, job: &Job, graph: &DependencyGraph, options: RunOptions) -> Result<()> {
        let name = job.filename.clone();
        match job.status {
            JobStatus::Completed => return Err(DispatchError::AlreadyCompleted { job: name }.into()),
            JobStatus::Running => {
                return Err(match self.store.lock_state(job) {
                    LockState::Held { alive: true, .. } => DispatchError::AlreadyRunning { job: name },
                    _ => DispatchError::StaleRunning { job: name },
                }
                .into());
            }
            JobStatus::PendingUser if job.job_type == JobType::Chat => {}
            JobStatus::Pending | JobStatus::PendingLlm => {}
            other => {
                return Err(DispatchError::NotRunnable {
                    job: name,
                    status: other.to_string(),
                }
                .into());
            }
        }

        if job.job_type == JobType::Chat && !awaiting_llm(&parse_turns(&job.body)) {
            return Err(DispatchError::NotRunnable {
                job: name,
                status: "waiting for a user turn".to_string(),
            }
            .into());
        }

        if let Some(unmet) = graph.unmet_dependencies(&job.filename).into_iter().next() {
            return Err(DispatchError::DependencyNotMet {
                job: name,
                dependency: unmet.reference.clone(),
                status: unmet.describe_status(),
            }
            .into());
        }

        if options.skip_interactive && job.is_interactive() {
            return Err(DispatchError::InteractiveSkipped { job: name }.into());
        }

        let problems = job.validate();
        if let Some(problem) = problems.first() {
            if problem.field == "worktree" && job.worktree.is_none() {
                return Err(DispatchError::WorktreeRequired {
                    job: name,
                    job_type: job.job_type,
                }
                .into());
            }
            return Err(JobError::Malformed {
                file: name,
                message: problems
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            }
            .into());
        }

        if job.job_type.is_agent()
            && let Some(container) = self.container()
            && !self.collab.containers.is_running(container)?
        {
            return Err(DispatchError::ContainerNotRunning {
                container: container.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn container(&self) -> Option<&'a str> {
        self.plan
            .config
            .container
            .as_deref()
            .or(self.flow.agent.container.as_deref())
    }

    fn provision(&self, name: &str, job: &Job, notes: &mut Vec<String>) -> Result<PathBuf> {
        let manager = WorktreeManager::new(
            &self.plan.repo_root,
            self.flow.context.clone(),
            self.collab.discovery,
        );
        let rules = job
            .rules_file
            .as_deref()
            .map(|rel| self.plan.dir.join(rel))
            .filter(|path| path.is_file());
        let request = WorktreeRequest {
            name,
            plan_dir: Some(&self.plan.dir),
            repos: &self.plan.config.repos,
            rules_file: rules.as_deref(),
        };
        let ensured = manager.ensure(&request, Utc::now()).map_err(|err| {
            DispatchError::WorktreeProvisionFailed {
                worktree: name.to_string(),
                message: format!("{err:#}"),
            }
        })?;
        if ensured.created {
            notes.push(format!("✓ Created worktree: {}", ensured.path.display()));
        }
        if let Some(report) = &ensured.ecosystem {
            notes.extend(report.lines());
        }
        Ok(ensured.path)
    }

    /// Write the execution result back to the job file.
    fn finish(&self, job: &mut Job, exec: Execution) -> Result<Outcome> {
        let now = Utc::now();
        if let Some(body) = exec.body {
            job.body = body;
        }
        if let Some(text) = exec.output.as_deref().filter(|t| !t.trim().is_empty()) {
            job.body = append_output(&job.body, text);
        }
        let status = exec.status.unwrap_or(JobStatus::Failed);
        if status != JobStatus::Running {
            job.set_status(status, now)?;
            self.store.remove_lock(job)?;
        }
        if status == JobStatus::Completed {
            self.summarize(job);
        }
        self.store.save(job, now)?;
        debug!(job = %job.filename, status = %status, "job finished");
        Ok(Outcome {
            filename: job.filename.clone(),
            status,
            output: exec.output,
            created: exec.created,
            notes: exec.notes,
        })
    }

    fn summarize(&self, job: &mut Job) {
        let Some(summarizer) = self.collab.summarizer.filter(|_| self.flow.summary.enabled) else {
            return;
        };
        match job.to_text().map_err(anyhow::Error::from).and_then(|text| summarizer.summarize(&text)) {
            Ok(summary) if !summary.is_empty() => job.summary = Some(summary),
            Ok(_) => {}
            Err(err) => warn!(job = %job.filename, err = %format!("{err:#}"), "summary failed"),
        }
    }
}

fn execution_error(err: &DispatchError) -> Execution {
    Execution {
        status: Some(JobStatus::Failed),
        output: Some(format!("Error: {err}\n")),
        failure: Some(err.to_string()),
        ..Execution::default()
    }
}

/// Mark a finished job completed (used by `flow plan complete`).
pub fn complete_job(
    store: &JobStore,
    reference: &str,
    summarizer: Option<&dyn Summarizer>,
    now: DateTime<Utc>,
) -> Result<Job> {
    let mut job = store.load_job(reference)?;
    job.set_status(JobStatus::Completed, now)?;
    store.remove_lock(&job)?;
    if let Some(summarizer) = summarizer {
        match summarizer.summarize(&job.to_text()?) {
            Ok(summary) if !summary.is_empty() => job.summary = Some(summary),
            Ok(_) => {}
            Err(err) => warn!(job = %job.filename, err = %format!("{err:#}"), "summary failed"),
        }
    }
    store.save(&mut job, now)?;
    Ok(job)
}

/// Read a file referenced by a job, trying the workdir, then the plan, then the repository root.
fn read_reference(ctx: &ExecContext<'_>, reference: &str) -> Result<(PathBuf, String)> {
    let candidates: Vec<PathBuf> = if Path::new(reference).is_absolute() {
        vec![PathBuf::from(reference)]
    } else {
        let mut dirs = vec![ctx.workdir.clone()];
        if let Some(tree) = &ctx.worktree {
            dirs.push(tree.clone());
        }
        dirs.push(ctx.plan.dir.clone());
        dirs.push(ctx.plan.repo_root.clone());
        dirs.into_iter().map(|dir| dir.join(reference)).collect()
    };
    for path in &candidates {
        if path.is_file() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            return Ok((path.clone(), text));
        }
    }
    Err(anyhow!("prompt source '{reference}' not found"))
}
