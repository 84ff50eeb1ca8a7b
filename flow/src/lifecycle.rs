//! Plan review and finish.
//!
//! A plan moves `active → review → finished`. Finish is a set of independent,
//! idempotent cleanup actions. When the plan has an `on_review` hook, the
//! interactive finish refuses until the plan has been reviewed.

use std::fmt;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::types::PlanStatus;
use crate::io::config::FlowConfig;
use crate::io::discovery::WorkspaceDiscovery;
use crate::io::git::Git;
use crate::io::hooks::run_hook;
use crate::io::process::{RunOptions, run_command};
use crate::io::session::{SessionManager, session_name};
use crate::io::state::StateStore;
use crate::plan::Plan;
use crate::worktree::teardown::PruneOptions;
use crate::worktree::{WorktreeManager, WorktreeState};

pub const ARCHIVE_DIR: &str = ".archive";
const DEV_PRUNE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum GateError {
    #[error(
        "plan '{plan}' has review hooks configured; run 'flow plan review {plan}' before finishing (or pass --yes)"
    )]
    ReviewRequired { plan: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    AlreadyInReview,
    Reviewed { hook_output: Option<String> },
}

/// Run the `on_review` hook and mark the plan `review`.
#[instrument(skip_all, fields(plan = %plan.name))]
pub fn review(plan: &mut Plan) -> Result<ReviewOutcome> {
    match plan.config.status {
        PlanStatus::Review => return Ok(ReviewOutcome::AlreadyInReview),
        PlanStatus::Finished => bail!("plan '{}' is already finished", plan.name),
        PlanStatus::Active | PlanStatus::Hold => {}
    }
    let hook_output = match plan.config.hooks.on_review.as_deref() {
        Some(hook) if !hook.trim().is_empty() => {
            Some(run_hook("on_review", hook, &plan.hook_context(), &plan.repo_root)?)
        }
        _ => None,
    };
    plan.config.status = PlanStatus::Review;
    plan.save_config()?;
    info!("plan in review");
    Ok(ReviewOutcome::Reviewed { hook_output })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FinishAction {
    MarkFinished,
    PruneWorktree,
    DeleteBranch,
    DeleteRemoteBranch,
    Archive,
    CleanDevLinks,
}

impl FinishAction {
    pub fn label(self) -> &'static str {
        match self {
            FinishAction::MarkFinished => "Mark plan as finished",
            FinishAction::PruneWorktree => "Prune worktree",
            FinishAction::DeleteBranch => "Delete branch",
            FinishAction::DeleteRemoteBranch => "Delete remote branch",
            FinishAction::Archive => "Archive plan directory",
            FinishAction::CleanDevLinks => "Clean dev links",
        }
    }
}

impl fmt::Display for FinishAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the actions were chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishSelection {
    /// Prompt the user; subject to the review gate.
    Interactive,
    /// `--yes`: every available action.
    All,
    /// Targeted flags: exactly these.
    Only(Vec<FinishAction>),
}

pub struct FinishContext<'a> {
    pub flow: &'a FlowConfig,
    pub discovery: &'a dyn WorkspaceDiscovery,
    pub sessions: &'a dyn SessionManager,
    /// Force worktree removal.
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct FinishReport {
    pub lines: Vec<String>,
    pub archived_to: Option<PathBuf>,
}

/// Refuse an interactive finish until a plan with review hooks was reviewed.
pub fn check_gate(plan: &Plan, selection: &FinishSelection) -> Result<(), GateError> {
    if *selection == FinishSelection::Interactive
        && plan.config.has_review_hook()
        && plan.config.status != PlanStatus::Review
        && plan.config.status != PlanStatus::Finished
    {
        return Err(GateError::ReviewRequired {
            plan: plan.name.clone(),
        });
    }
    Ok(())
}

/// Actions that would change something for this plan.
pub fn available_actions(plan: &Plan, ctx: &FinishContext<'_>) -> Result<Vec<FinishAction>> {
    let mut actions = Vec::new();
    if plan.config.status != PlanStatus::Finished {
        actions.push(FinishAction::MarkFinished);
    }
    if let Some(name) = plan.config.worktree.as_deref() {
        let manager = WorktreeManager::new(&plan.repo_root, ctx.flow.context.clone(), ctx.discovery);
        if manager.state(name)? != WorktreeState::Absent {
            actions.push(FinishAction::PruneWorktree);
        }
        let git = Git::new(&plan.repo_root);
        if git.branch_exists(name)? {
            actions.push(FinishAction::DeleteBranch);
        }
        let remote = &ctx.flow.finish.remote;
        if git.has_remote(remote)? && git.remote_branch_exists(remote, name)? {
            actions.push(FinishAction::DeleteRemoteBranch);
        }
    }
    if plan.dir.exists() && !is_archived(&plan.dir) {
        actions.push(FinishAction::Archive);
    }
    if !ctx.flow.finish.dev_prune_command.is_empty() {
        actions.push(FinishAction::CleanDevLinks);
    }
    Ok(actions)
}

/// Toggle prompt over `available`, all selected by default.
///
/// Each line of input is a space separated list of action numbers to toggle;
/// an empty line confirms.
pub fn prompt_actions(
    available: &[FinishAction],
    input: &mut dyn BufRead,
    output: &mut dyn Write,
) -> Result<Vec<FinishAction>> {
    let mut chosen = vec![true; available.len()];
    loop {
        writeln!(output, "Select finish actions (numbers toggle, enter confirms):")?;
        for (idx, action) in available.iter().enumerate() {
            let mark = if chosen[idx] { "x" } else { " " };
            writeln!(output, "  {}. [{mark}] {action}", idx + 1)?;
        }
        write!(output, "> ")?;
        output.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }
        for token in line.split_whitespace() {
            match token.parse::<usize>() {
                Ok(n) if (1..=available.len()).contains(&n) => chosen[n - 1] = !chosen[n - 1],
                _ => writeln!(output, "  ignoring '{token}'")?,
            }
        }
    }
    Ok(available
        .iter()
        .zip(chosen)
        .filter_map(|(action, keep)| keep.then_some(*action))
        .collect())
}

/// Run `actions` in a fixed order: status, worktree and branch, remote
/// branch, dev links, archive.
#[instrument(skip_all, fields(plan = %plan.name))]
pub fn finish(
    plan: &mut Plan,
    actions: &[FinishAction],
    ctx: &FinishContext<'_>,
) -> Result<FinishReport> {
    let mut report = FinishReport::default();
    let wants = |action| actions.contains(&action);

    if wants(FinishAction::MarkFinished) {
        if plan.config.status == PlanStatus::Finished {
            report.lines.push("✓ Plan already marked finished".to_string());
        } else {
            plan.config.status = PlanStatus::Finished;
            plan.save_config()?;
            report.lines.push("✓ Marked plan as finished".to_string());
        }
    }

    let prune = wants(FinishAction::PruneWorktree);
    let delete_branch = wants(FinishAction::DeleteBranch);
    if (prune || delete_branch)
        && let Some(name) = plan.config.worktree.clone()
    {
        let manager = WorktreeManager::new(&plan.repo_root, ctx.flow.context.clone(), ctx.discovery);
        if prune {
            kill_session(ctx, &name);
        }
        if !prune && matches!(manager.state(&name)?, WorktreeState::Created { .. }) {
            report
                .lines
                .push(format!("  ⚠ branch {name} kept: its worktree is still present"));
        } else {
            let pruned = manager.prune(
                &name,
                PruneOptions {
                    delete_branch,
                    force: ctx.force,
                },
            )?;
            report.lines.push(format!("Worktree {name}:"));
            report.lines.extend(pruned.lines());
        }
    }

    if wants(FinishAction::DeleteRemoteBranch)
        && let Some(name) = plan.config.worktree.as_deref()
    {
        report
            .lines
            .push(delete_remote_branch(ctx.flow, &plan.repo_root, name)?);
    }

    if wants(FinishAction::CleanDevLinks) {
        match clean_dev_links(ctx.flow, &plan.repo_root) {
            Ok(line) => report.lines.push(line),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "dev link cleanup failed");
                report.lines.push(format!("  ⚠ dev link cleanup failed: {err:#}"));
            }
        }
    }

    if wants(FinishAction::Archive) {
        let target = archive_path(&plan.dir);
        if !plan.dir.exists() && target.exists() {
            report.lines.push("✓ Plan already archived".to_string());
        } else {
            archive(plan, &target)?;
            report
                .lines
                .push(format!("✓ Archived plan to {}", target.display()));
            report.archived_to = Some(target);
        }
    }
    info!(actions = actions.len(), "plan finished");
    Ok(report)
}

fn kill_session(ctx: &FinishContext<'_>, worktree: &str) {
    let session = session_name(&ctx.flow.agent.session_prefix, worktree);
    match ctx.sessions.has_session(&session) {
        Ok(true) => {
            if let Err(err) = ctx.sessions.kill_session(&session) {
                warn!(%session, err = %format!("{err:#}"), "could not kill session");
            }
        }
        Ok(false) => {}
        Err(err) => warn!(%session, err = %format!("{err:#}"), "session lookup failed"),
    }
}

/// `<plans parent>/.archive/<plan name>`.
pub fn archive_path(plan_dir: &Path) -> PathBuf {
    let parent = plan_dir.parent().unwrap_or(Path::new("."));
    let name = plan_dir.file_name().unwrap_or_default();
    parent.join(ARCHIVE_DIR).join(name)
}

fn is_archived(plan_dir: &Path) -> bool {
    plan_dir
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name == ARCHIVE_DIR)
}

fn archive(plan: &mut Plan, target: &Path) -> Result<()> {
    if target.exists() {
        bail!("cannot archive: {} already exists", target.display());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    // The active plan pointer would dangle once the directory moves.
    let state = StateStore::at(&plan.repo_root);
    let was_active = state
        .active_plan()?
        .is_some_and(|active| same_dir(&active, &plan.dir));
    fs::rename(&plan.dir, target)
        .with_context(|| format!("move {} to {}", plan.dir.display(), target.display()))?;
    if was_active {
        state.unset()?;
    }
    plan.dir = target.to_path_buf();
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Push a deletion of `branch`; a refusal is reported, not raised.
fn delete_remote_branch(flow: &FlowConfig, repo_root: &Path, branch: &str) -> Result<String> {
    let git = Git::new(repo_root);
    let remote = &flow.finish.remote;
    if !git.remote_branch_exists(remote, branch)? {
        return Ok(format!("✓ Remote branch {remote}/{branch} already gone"));
    }
    let outcome = git.delete_remote_branch(remote, branch)?;
    if !outcome.success {
        warn!(%remote, branch, message = %outcome.message(), "remote branch not deleted");
        return Ok(format!(
            "  ⚠ remote branch {remote}/{branch} not deleted: {}",
            outcome.message()
        ));
    }
    Ok(format!("✓ Deleted remote branch {remote}/{branch}"))
}

fn clean_dev_links(flow: &FlowConfig, repo_root: &Path) -> Result<String> {
    let Some((program, args)) = flow.finish.dev_prune_command.split_first() else {
        return Ok("✓ No dev link cleanup configured".to_string());
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(repo_root);
    let output = run_command(cmd, &RunOptions::new(DEV_PRUNE_TIMEOUT, 64 * 1024))?;
    if !output.success() {
        bail!(
            "{} ({}): {}",
            flow.finish.dev_prune_command.join(" "),
            output.failure_reason(),
            output.combined_text().trim()
        );
    }
    Ok("✓ Cleaned dev links".to_string())
}
