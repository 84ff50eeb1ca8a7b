//! Plan directories and the commands that edit them.
//!
//! A plan is a directory of job files next to a `.grove-plan.yml`. The
//! functions here implement `flow plan init/add/status/graph/complete` and the
//! `flow plan jobs ...` subcommands on top of the job store.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::graph::DependencyGraph;
use crate::core::job::{Job, JobError};
use crate::core::naming::{job_filename, next_job_number, unique_job_id, validate_worktree_name};
use crate::core::output::{append_output, stamp_lines};
use crate::core::rename::{StagedRename, stage_rename};
use crate::core::types::{JobStatus, JobType, OutputMode, PlanStatus};
use crate::io::config::FlowConfig;
use crate::io::discovery::WorkspaceDiscovery;
use crate::io::hooks::{HookContext, run_hook};
use crate::io::job_store::{JobStore, LockState, resolve};
use crate::io::plan_config::{
    PLAN_CONFIG_FILE, PlanConfig, load_plan_config, plan_config_path, write_plan_config,
};
use crate::io::state::StateStore;
use crate::worktree::{EnsuredWorktree, WorktreeManager, WorktreeRequest};

#[derive(Debug, Clone)]
pub struct Plan {
    pub name: String,
    pub dir: PathBuf,
    /// Main checkout the plan's worktrees hang off.
    pub repo_root: PathBuf,
    pub config: PlanConfig,
}

impl Plan {
    pub fn open(repo_root: &Path, dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("plan directory {} does not exist", dir.display());
        }
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("invalid plan directory {}", dir.display()))?;
        let config = load_plan_config(dir)?;
        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            repo_root: repo_root.to_path_buf(),
            config,
        })
    }

    pub fn store(&self) -> JobStore {
        JobStore::new(&self.dir)
    }

    pub fn save_config(&self) -> Result<()> {
        write_plan_config(&self.dir, &self.config)
    }

    pub fn hook_context(&self) -> HookContext {
        HookContext {
            plan_name: self.name.clone(),
            plan_dir: self.dir.clone(),
            note_ref: self.config.note_ref.clone(),
            worktree: self.config.worktree.clone(),
        }
    }

    /// Jobs and their dependency graph.
    pub fn load(&self) -> Result<(Vec<Job>, DependencyGraph)> {
        let jobs = self.store().load_jobs()?;
        let graph = DependencyGraph::build(&jobs)?;
        Ok((jobs, graph))
    }
}

/// Resolve a plan argument, falling back to the active plan of the checkout
/// containing `cwd`.
pub fn locate(
    repo_root: &Path,
    flow: &FlowConfig,
    cwd: &Path,
    reference: Option<&str>,
) -> Result<Plan> {
    let dir = match reference {
        Some(reference) => {
            let as_path = cwd.join(reference);
            if as_path.join(PLAN_CONFIG_FILE).exists() {
                as_path
            } else {
                flow.plans_root(repo_root).join(reference)
            }
        }
        None => StateStore::discover(cwd)?.active_plan()?.ok_or_else(|| {
            anyhow!("no active plan; pass a plan name or run 'flow plan set <name>'")
        })?,
    };
    Plan::open(repo_root, &dir)
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub worktree: Option<String>,
    /// Provision the worktree now instead of on first use.
    pub create_worktree: bool,
    pub model: Option<String>,
    pub container: Option<String>,
    pub repos: Vec<String>,
    pub note_ref: Option<String>,
    pub on_start: Option<String>,
    pub on_review: Option<String>,
}

#[derive(Debug)]
pub struct Initialized {
    pub plan: Plan,
    pub worktree: Option<EnsuredWorktree>,
    pub lines: Vec<String>,
}

#[instrument(skip_all, fields(plan = name))]
pub fn init(
    repo_root: &Path,
    flow: &FlowConfig,
    discovery: &dyn WorkspaceDiscovery,
    name: &str,
    options: &InitOptions,
    now: DateTime<Utc>,
) -> Result<Initialized> {
    validate_plan_name(name)?;
    if let Some(worktree) = &options.worktree {
        validate_worktree_name(worktree)?;
    }
    let dir = flow.plans_root(repo_root).join(name);
    if plan_config_path(&dir).exists() {
        bail!("plan '{name}' already exists at {}", dir.display());
    }
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

    let mut config = PlanConfig {
        model: options.model.clone(),
        worktree: options.worktree.clone(),
        repos: options.repos.clone(),
        container: options.container.clone(),
        note_ref: options.note_ref.clone(),
        ..PlanConfig::default()
    };
    config.hooks.on_start = options.on_start.clone();
    config.hooks.on_review = options.on_review.clone();
    write_plan_config(&dir, &config)?;
    let plan = Plan::open(repo_root, &dir)?;

    let mut lines = vec![
        format!("Initializing orchestration plan in:\n  {}\n", dir.display()),
        "✓ Created plan directory".to_string(),
        format!("✓ Created {}", crate::io::plan_config::PLAN_CONFIG_FILE),
    ];

    let worktree = if options.create_worktree && plan.config.worktree.is_some() {
        let ensured = ensure_plan_worktree(&plan, flow, discovery, now)?;
        lines.push(format!("✓ Created worktree: {}", ensured.path.display()));
        if let Some(report) = &ensured.ecosystem {
            lines.extend(report.lines());
        }
        Some(ensured)
    } else {
        None
    };

    // A fresh worktree already points at the plan through its own state file.
    if worktree.is_none() {
        StateStore::discover(repo_root)?.set_active_plan(&dir)?;
        lines.push(format!("✓ Set active plan to: {name}"));
    }

    if let Some(hook) = plan.config.hooks.on_start.as_deref().filter(|h| !h.trim().is_empty()) {
        match run_hook("on_start", hook, &plan.hook_context(), repo_root) {
            Ok(_) => lines.push("✓ on_start hook executed successfully.".to_string()),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "on_start hook failed");
                lines.push(format!("⚠ on_start hook failed: {err:#}"));
            }
        }
    }
    info!(dir = %dir.display(), "plan initialized");
    Ok(Initialized {
        plan,
        worktree,
        lines,
    })
}

/// Create (or reuse) the plan-level worktree.
pub fn ensure_plan_worktree(
    plan: &Plan,
    flow: &FlowConfig,
    discovery: &dyn WorkspaceDiscovery,
    now: DateTime<Utc>,
) -> Result<EnsuredWorktree> {
    let name = plan
        .config
        .worktree
        .as_deref()
        .ok_or_else(|| anyhow!("plan '{}' has no worktree configured", plan.name))?;
    let manager = WorktreeManager::new(&plan.repo_root, flow.context.clone(), discovery);
    manager.ensure(
        &WorktreeRequest {
            name,
            plan_dir: Some(&plan.dir),
            repos: &plan.config.repos,
            rules_file: None,
        },
        now,
    )
}

fn validate_plan_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
    if !valid {
        bail!("invalid plan name '{name}': use letters, digits, '-', '_' or '.'");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub job_type: JobType,
    pub depends_on: Vec<String>,
    pub worktree: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
    pub prompt_source: Vec<String>,
    pub output: OutputMode,
    pub agent_continue: bool,
    pub prepend_dependencies: bool,
}

impl NewJob {
    pub fn new(title: &str, job_type: JobType) -> Self {
        Self {
            title: title.to_string(),
            job_type,
            depends_on: Vec::new(),
            worktree: None,
            model: None,
            prompt: String::new(),
            prompt_source: Vec::new(),
            output: OutputMode::Append,
            agent_continue: false,
            prepend_dependencies: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Added {
    pub job: Job,
    /// Dependency the worktree was taken from.
    pub inherited_from: Option<String>,
}

/// Append a job to the plan with the next free number.
#[instrument(skip_all, fields(plan = %plan.name, title = %request.title))]
pub fn add_job(plan: &Plan, request: &NewJob, now: DateTime<Utc>) -> Result<Added> {
    let store = plan.store();
    let jobs = store.load_jobs()?;
    let files = store.markdown_files()?;

    let mut depends_on = Vec::with_capacity(request.depends_on.len());
    for reference in &request.depends_on {
        let dep = resolve(&jobs, reference)
            .ok_or_else(|| anyhow!("dependency '{reference}' not found in plan '{}'", plan.name))?;
        depends_on.push(dep.filename.clone());
    }

    let filename = job_filename(next_job_number(files.iter().map(String::as_str)), &request.title)?;
    let ids: HashSet<String> = jobs.iter().map(|job| job.id.clone()).collect();
    let mut job = Job::new(
        &filename,
        &unique_job_id(&request.title, &ids),
        request.title.trim(),
        request.job_type,
    );
    if request.job_type == JobType::Chat {
        job.status = JobStatus::PendingUser;
    }

    let mut inherited_from = None;
    job.worktree = match &request.worktree {
        Some(worktree) => Some(worktree.clone()),
        None => match depends_on.as_slice() {
            [only] => {
                let inherited = resolve(&jobs, only).and_then(|dep| dep.worktree.clone());
                if inherited.is_some() {
                    inherited_from = Some(only.clone());
                }
                inherited
            }
            _ => None,
        }
        .or_else(|| {
            plan.config
                .worktree
                .clone()
                .filter(|_| request.job_type.is_agent())
        }),
    };
    job.depends_on = depends_on;
    job.model = request.model.clone();
    job.prompt_source = request.prompt_source.clone();
    job.output.mode = request.output;
    job.agent_continue = request.agent_continue;
    job.prepend_dependencies = request.prepend_dependencies;
    job.body = format!("{}\n", request.prompt.trim_end());

    let mut staged = jobs.clone();
    staged.push(job.clone());
    DependencyGraph::build(&staged)?;

    store.create(&mut job, now)?;
    debug!(filename = %job.filename, worktree = ?job.worktree, "job added");
    Ok(Added {
        job,
        inherited_from,
    })
}

/// Rename a job and rewrite every reference to it.
pub fn rename_job(
    plan: &Plan,
    target: &str,
    new_title: &str,
    now: DateTime<Utc>,
) -> Result<StagedRename> {
    let store = plan.store();
    let jobs = store.load_jobs()?;
    let files: HashSet<String> = store.markdown_files()?.into_iter().collect();
    let target = resolve(&jobs, target)
        .map(|job| job.filename.clone())
        .unwrap_or_else(|| target.to_string());
    let staged = stage_rename(&jobs, &files, &target, new_title)?;
    store.commit_rename(&staged, now)?;
    info!(from = %staged.old_filename, to = %staged.new_filename, "job renamed");
    Ok(staged)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepsChange {
    pub filename: String,
    pub old: Vec<String>,
    pub new: Vec<String>,
}

impl DepsChange {
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Updated dependencies for {}", self.filename),
            format!("Old dependencies: {}", format_deps(&self.old)),
            format!("New dependencies: {}", format_deps(&self.new)),
        ]
    }
}

fn format_deps(deps: &[String]) -> String {
    if deps.is_empty() {
        "(none)".to_string()
    } else {
        deps.join(", ")
    }
}

/// Replace a job's `depends_on`. An empty list clears it.
pub fn update_deps(
    plan: &Plan,
    target: &str,
    deps: &[String],
    now: DateTime<Utc>,
) -> Result<DepsChange> {
    let store = plan.store();
    let mut jobs = store.load_jobs()?;
    let idx = resolve(&jobs, target)
        .and_then(|found| jobs.iter().position(|job| job.filename == found.filename))
        .ok_or_else(|| JobError::NotFound(target.to_string()))?;

    let mut resolved = Vec::with_capacity(deps.len());
    for reference in deps {
        let dep = resolve(&jobs, reference)
            .ok_or_else(|| anyhow!("dependency '{reference}' not found in plan '{}'", plan.name))?;
        if !resolved.contains(&dep.filename) {
            resolved.push(dep.filename.clone());
        }
    }

    let old = std::mem::replace(&mut jobs[idx].depends_on, resolved.clone());
    DependencyGraph::build(&jobs)?;
    let mut job = jobs.swap_remove(idx);
    store.save(&mut job, now)?;
    Ok(DepsChange {
        filename: job.filename,
        old,
        new: resolved,
    })
}

/// `flow plan status` text.
pub fn status_report(plan: &Plan) -> Result<String> {
    let (jobs, graph) = plan.load()?;
    let store = plan.store();
    let mut out = String::new();
    let _ = writeln!(out, "Plan: {}", plan.name);
    let _ = writeln!(out, "Status: {}", plan.config.status);
    if let Some(worktree) = &plan.config.worktree {
        let _ = writeln!(out, "Worktree: {worktree}");
    }
    out.push('\n');

    let (mut completed, mut running, mut pending, mut failed) = (0, 0, 0, 0);
    for node in graph.nodes() {
        let mut status = node.status.to_string();
        match node.status {
            JobStatus::Completed => completed += 1,
            JobStatus::Running => {
                running += 1;
                let stale = jobs
                    .iter()
                    .find(|job| job.filename == node.filename)
                    .is_some_and(|job| !matches!(store.lock_state(job), LockState::Held { alive: true, .. }));
                if stale {
                    status.push_str(" (stale)");
                }
            }
            JobStatus::Pending | JobStatus::PendingUser | JobStatus::PendingLlm => pending += 1,
            JobStatus::Failed => failed += 1,
            _ => {}
        }
        let _ = writeln!(
            out,
            "{} {} ({}) - {}",
            node.status.icon(),
            node.filename,
            node.job_type,
            status
        );
    }
    let _ = writeln!(
        out,
        "\nTotal: {}  Completed: {completed}  Running: {running}  Pending: {pending}  Failed: {failed}",
        graph.nodes().len()
    );
    let ready: Vec<&str> = graph
        .ready_set()
        .into_iter()
        .map(|node| node.filename.as_str())
        .collect();
    let _ = writeln!(out, "Ready: {}", if ready.is_empty() { "(none)".to_string() } else { ready.join(", ") });
    Ok(out)
}

#[derive(Serialize)]
struct StatusJson<'a> {
    plan: &'a str,
    jobs: Vec<JobJson<'a>>,
    statistics: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct JobJson<'a> {
    filename: &'a str,
    id: &'a str,
    title: &'a str,
    status: JobStatus,
    #[serde(rename = "type")]
    job_type: JobType,
    depends_on: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    worktree: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
}

/// `flow plan status --format json`: the jobs plus a per-status count and a
/// `total`.
pub fn status_json(plan: &Plan) -> Result<String> {
    let jobs = plan.store().load_jobs()?;
    let mut statistics = BTreeMap::new();
    for job in &jobs {
        *statistics.entry(job.status.to_string()).or_insert(0) += 1;
    }
    statistics.insert("total".to_string(), jobs.len());
    let report = StatusJson {
        plan: &plan.name,
        jobs: jobs
            .iter()
            .map(|job| JobJson {
                filename: &job.filename,
                id: &job.id,
                title: &job.title,
                status: job.status,
                job_type: job.job_type,
                depends_on: &job.depends_on,
                worktree: job.worktree.as_deref(),
                model: job.model.as_deref(),
                summary: job.summary.as_deref(),
            })
            .collect(),
        statistics,
    };
    let mut text = serde_json::to_string_pretty(&report).context("serialize plan status")?;
    text.push('\n');
    Ok(text)
}

/// One row of `flow plan list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub name: String,
    pub dir: PathBuf,
    pub status: PlanStatus,
    pub jobs: usize,
    /// `2 completed, 1 pending`, or `no jobs`.
    pub progress: String,
}

/// Plans under the plans root, by name. Finished plans are left out unless
/// `include_finished`; unreadable plans are skipped with a warning.
pub fn list_plans(repo_root: &Path, flow: &FlowConfig, include_finished: bool) -> Result<Vec<PlanSummary>> {
    let root = flow.plans_root(repo_root);
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", root.display())),
    };
    let mut summaries = Vec::new();
    for entry in entries {
        let dir = entry.with_context(|| format!("read {}", root.display()))?.path();
        let hidden = dir
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if hidden || !dir.is_dir() || !looks_like_plan(&dir)? {
            continue;
        }
        let plan = match Plan::open(repo_root, &dir) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(dir = %dir.display(), err = %format!("{err:#}"), "could not load plan");
                continue;
            }
        };
        if plan.config.status == PlanStatus::Finished && !include_finished {
            continue;
        }
        let jobs = match plan.store().load_jobs() {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(plan = %plan.name, err = %format!("{err:#}"), "could not load jobs");
                continue;
            }
        };
        summaries.push(PlanSummary {
            progress: progress(&jobs),
            jobs: jobs.len(),
            status: plan.config.status,
            name: plan.name,
            dir,
        });
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}

fn looks_like_plan(dir: &Path) -> Result<bool> {
    if dir.join(PLAN_CONFIG_FILE).is_file() {
        return Ok(true);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry.with_context(|| format!("read {}", dir.display()))?.path();
        if path.extension().is_some_and(|ext| ext == "md") {
            return Ok(true);
        }
    }
    Ok(false)
}

fn progress(jobs: &[Job]) -> String {
    let count = |statuses: &[JobStatus]| {
        jobs.iter()
            .filter(|job| statuses.contains(&job.status))
            .count()
    };
    let parts: Vec<String> = [
        (count(&[JobStatus::Completed]), "completed"),
        (count(&[JobStatus::Running]), "running"),
        (count(&[JobStatus::Pending, JobStatus::PendingUser]), "pending"),
        (count(&[JobStatus::Failed]), "failed"),
        (count(&[JobStatus::Blocked]), "blocked"),
    ]
    .into_iter()
    .filter(|(n, _)| *n > 0)
    .map(|(n, label)| format!("{n} {label}"))
    .collect();
    if parts.is_empty() {
        "no jobs".to_string()
    } else {
        parts.join(", ")
    }
}

/// `NAME  JOBS  STATUS` table, or `No plans found.`.
pub fn list_report(plans: &[PlanSummary]) -> String {
    if plans.is_empty() {
        return "No plans found.\n".to_string();
    }
    let width = plans
        .iter()
        .map(|plan| plan.name.len())
        .chain(std::iter::once("NAME".len()))
        .max()
        .unwrap_or_default();
    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}   JOBS   STATUS", "NAME");
    for plan in plans {
        let _ = writeln!(out, "{:<width$}   {:<4}   {}", plan.name, plan.jobs, plan.progress);
    }
    out
}

/// Put a plan on hold; `false` when it already was.
pub fn hold(plan: &mut Plan) -> Result<bool> {
    if plan.config.status == PlanStatus::Hold {
        return Ok(false);
    }
    if plan.config.status == PlanStatus::Finished {
        bail!("plan '{}' is finished and cannot be put on hold", plan.name);
    }
    plan.config.status = PlanStatus::Hold;
    plan.save_config()?;
    info!(plan = %plan.name, "plan on hold");
    Ok(true)
}

/// Resume an on-hold plan as `active`; `false` when it was not on hold.
pub fn unhold(plan: &mut Plan) -> Result<bool> {
    if plan.config.status != PlanStatus::Hold {
        return Ok(false);
    }
    plan.config.status = PlanStatus::Active;
    plan.save_config()?;
    info!(plan = %plan.name, "plan resumed");
    Ok(true)
}

pub fn graph_mermaid(plan: &Plan) -> Result<String> {
    let (_, graph) = plan.load()?;
    Ok(graph.to_mermaid())
}

/// Move a failed or running job back to `pending`.
pub fn reset_job(plan: &Plan, reference: &str, now: DateTime<Utc>) -> Result<Job> {
    let store = plan.store();
    let mut job = store.load_job(reference)?;
    if !matches!(job.status, JobStatus::Failed | JobStatus::Running) {
        bail!(
            "cannot reset '{}': it is {} (only failed or running jobs can be reset)",
            job.filename,
            job.status
        );
    }
    job.set_status(JobStatus::Pending, now)?;
    store.remove_lock(&job)?;
    store.save(&mut job, now)?;
    Ok(job)
}

/// Mark a job abandoned and record why in its output section.
pub fn abandon_job(
    plan: &Plan,
    reference: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Job> {
    let store = plan.store();
    let mut job = store.load_job(reference)?;
    job.set_status(JobStatus::Abandoned, now)?;
    let note = match reason {
        Some(reason) => format!("Job abandoned: {reason}"),
        None => "Job abandoned".to_string(),
    };
    job.body = append_output(&job.body, &stamp_lines(&note, now));
    store.remove_lock(&job)?;
    store.save(&mut job, now)?;
    Ok(job)
}

/// Point the checkout containing `cwd` at `plan`.
pub fn set_active(cwd: &Path, plan: &Plan) -> Result<()> {
    StateStore::discover(cwd)?.set_active_plan(&plan.dir)
}

pub fn unset_active(cwd: &Path) -> Result<bool> {
    StateStore::discover(cwd)?.unset()
}

pub fn current_active(cwd: &Path) -> Result<Option<PathBuf>> {
    StateStore::discover(cwd)?.active_plan()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{PlanFixture, job};

    #[test]
    fn add_numbers_jobs_and_inherits_worktree() {
        let fixture = PlanFixture::new();
        let now = Utc::now();
        let mut implement = NewJob::new("Implement", JobType::Agent);
        implement.worktree = Some("feature-a".to_string());
        implement.prompt = "Build it".to_string();
        let first = add_job(&fixture.plan, &implement, now).expect("add");
        assert_eq!(first.job.filename, "01-implement.md");
        assert!(first.inherited_from.is_none());

        let mut review = NewJob::new("Review", JobType::Oneshot);
        review.depends_on = vec!["01-implement.md".to_string()];
        review.prompt = "Review it".to_string();
        let second = add_job(&fixture.plan, &review, now).expect("add");
        assert_eq!(second.job.filename, "02-review.md");
        assert_eq!(second.inherited_from.as_deref(), Some("01-implement.md"));
        assert_eq!(fixture.load("02-review.md").worktree.as_deref(), Some("feature-a"));
    }

    #[test]
    fn add_resolves_dependencies_by_id() {
        let fixture = PlanFixture::new();
        let mut design = job("01-design.md", JobType::Shell);
        design.id = "design".to_string();
        design.body = "true\n".to_string();
        fixture.write(&mut design);

        let mut next = NewJob::new("Next step", JobType::Shell);
        next.depends_on = vec!["design".to_string()];
        next.prompt = "true".to_string();
        let added = add_job(&fixture.plan, &next, Utc::now()).expect("add");
        assert_eq!(added.job.depends_on, vec!["01-design.md"]);

        let mut broken = NewJob::new("Broken", JobType::Shell);
        broken.depends_on = vec!["nope".to_string()];
        let err = add_job(&fixture.plan, &broken, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("dependency 'nope' not found"));
    }

    #[test]
    fn chats_start_waiting_for_the_user() {
        let fixture = PlanFixture::new();
        let mut chat = NewJob::new("Brainstorm", JobType::Chat);
        chat.prompt = "Ideas?".to_string();
        let added = add_job(&fixture.plan, &chat, Utc::now()).expect("add");
        assert_eq!(added.job.status, JobStatus::PendingUser);
    }

    #[test]
    fn update_deps_reports_old_and_new() {
        let fixture = PlanFixture::new();
        let mut a = job("01-a.md", JobType::Shell);
        a.body = "true\n".to_string();
        fixture.write(&mut a);
        let mut b = job("02-b.md", JobType::Shell);
        b.depends_on = vec!["01-a.md".to_string()];
        b.body = "true\n".to_string();
        fixture.write(&mut b);

        let change = update_deps(&fixture.plan, "02-b.md", &[], Utc::now()).expect("clear");
        assert_eq!(
            change.lines()[1..],
            ["Old dependencies: 01-a.md", "New dependencies: (none)"]
        );
        assert!(fixture.load("02-b.md").depends_on.is_empty());

        update_deps(&fixture.plan, "01-a.md", &["02-b.md".to_string()], Utc::now())
            .expect("reverse edge");
        let err = update_deps(&fixture.plan, "02-b.md", &["01-a.md".to_string()], Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("circular dependency detected"));
        assert!(fixture.load("02-b.md").depends_on.is_empty());
    }

    #[test]
    fn status_marks_stale_running_jobs() {
        let fixture = PlanFixture::new();
        let mut done = job("01-done.md", JobType::Shell);
        done.status = JobStatus::Completed;
        done.body = "true\n".to_string();
        fixture.write(&mut done);
        let mut stuck = job("02-stuck.md", JobType::Shell);
        stuck.status = JobStatus::Running;
        stuck.depends_on = vec!["01-done.md".to_string()];
        stuck.body = "true\n".to_string();
        fixture.write(&mut stuck);
        let mut next = job("03-next.md", JobType::Shell);
        next.depends_on = vec!["01-done.md".to_string()];
        next.body = "true\n".to_string();
        fixture.write(&mut next);

        let report = status_report(&fixture.plan).expect("status");
        assert!(report.contains("02-stuck.md (shell) - running (stale)"));
        assert!(report.contains("Total: 3  Completed: 1  Running: 1  Pending: 1  Failed: 0"));
        assert!(report.contains("Ready: 03-next.md"));
    }

    #[test]
    fn reset_and_abandon() {
        let fixture = PlanFixture::new();
        let mut broken = job("01-broken.md", JobType::Shell);
        broken.status = JobStatus::Failed;
        broken.body = "false\n".to_string();
        fixture.write(&mut broken);

        let reset = reset_job(&fixture.plan, "01-broken.md", Utc::now()).expect("reset");
        assert_eq!(reset.status, JobStatus::Pending);
        assert!(reset_job(&fixture.plan, "01-broken.md", Utc::now()).is_err());

        let abandoned =
            abandon_job(&fixture.plan, "01-broken.md", Some("superseded"), Utc::now()).expect("abandon");
        assert_eq!(abandoned.status, JobStatus::Abandoned);
        assert!(fixture.load("01-broken.md").body.contains("Job abandoned: superseded"));
    }

    #[test]
    fn list_summarizes_plans_and_hides_finished() {
        let fixture = PlanFixture::new();
        let mut built = job("01-build.md", JobType::Shell);
        built.status = JobStatus::Completed;
        fixture.write(&mut built);
        fixture.write(&mut job("02-test.md", JobType::Shell));
        let mut briefing = job("03-brief.md", JobType::Oneshot);
        briefing.status = JobStatus::PendingUser;
        fixture.write(&mut briefing);

        let root = fixture.flow.plans_root(fixture.repo_root());
        let empty = root.join("empty");
        fs::create_dir_all(&empty).expect("empty plan");
        write_plan_config(&empty, &PlanConfig::default()).expect("config");
        let done = root.join("done");
        fs::create_dir_all(&done).expect("done plan");
        let finished = PlanConfig {
            status: PlanStatus::Finished,
            ..PlanConfig::default()
        };
        write_plan_config(&done, &finished).expect("config");
        fs::create_dir_all(root.join("scratch")).expect("not a plan");
        fs::create_dir_all(root.join(".archive/old")).expect("archive");

        let plans = list_plans(fixture.repo_root(), &fixture.flow, false).expect("list");
        let names: Vec<&str> = plans.iter().map(|plan| plan.name.as_str()).collect();
        assert_eq!(names, vec!["empty", "test-plan"]);
        assert_eq!(
            list_report(&plans),
            "NAME        JOBS   STATUS\n\
             empty       0      no jobs\n\
             test-plan   3      1 completed, 2 pending\n"
        );

        let all = list_plans(fixture.repo_root(), &fixture.flow, true).expect("list");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].name, "done");
        assert_eq!(all[0].status, PlanStatus::Finished);
        assert_eq!(list_report(&[]), "No plans found.\n");
    }

    #[test]
    fn hold_and_unhold_persist_status() {
        let mut fixture = PlanFixture::new();
        assert!(hold(&mut fixture.plan).expect("hold"));
        assert!(!hold(&mut fixture.plan).expect("hold again"));
        let reopened = Plan::open(fixture.repo_root(), &fixture.plan.dir).expect("reopen");
        assert_eq!(reopened.config.status, PlanStatus::Hold);

        assert!(unhold(&mut fixture.plan).expect("unhold"));
        assert!(!unhold(&mut fixture.plan).expect("unhold again"));
        let reopened = Plan::open(fixture.repo_root(), &fixture.plan.dir).expect("reopen");
        assert_eq!(reopened.config.status, PlanStatus::Active);

        fixture.plan.config.status = PlanStatus::Finished;
        assert!(hold(&mut fixture.plan).is_err());
    }

    #[test]
    fn status_json_counts_jobs_by_status() {
        let fixture = PlanFixture::new();
        let mut built = job("01-build.md", JobType::Shell);
        built.status = JobStatus::Completed;
        fixture.write(&mut built);
        let mut deploy = job("02-deploy.md", JobType::Agent);
        deploy.depends_on = vec!["01-build.md".to_string()];
        deploy.worktree = Some("feature".to_string());
        fixture.write(&mut deploy);

        let text = status_json(&fixture.plan).expect("json");
        let value: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(value["plan"], "test-plan");
        assert_eq!(value["jobs"][0]["filename"], "01-build.md");
        assert_eq!(value["jobs"][1]["type"], "agent");
        assert_eq!(value["jobs"][1]["depends_on"][0], "01-build.md");
        assert_eq!(value["jobs"][1]["worktree"], "feature");
        assert_eq!(value["statistics"]["completed"], 1);
        assert_eq!(value["statistics"]["pending"], 1);
        assert_eq!(value["statistics"]["total"], 2);
        assert!(text.starts_with("{\n  \"plan\""));
    }
}

