//! `flow plan rebase`.
//!
//! A target of `main` rebases the plan's worktree branch onto main. A target
//! equal to the worktree name does the reverse in the main checkout: main is
//! rebased onto the feature branch so it can be tried out there, and must be
//! reset afterwards. Worktrees with populated submodules rebase each
//! repository on its own and report every result.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::io::config::FlowConfig;
use crate::io::discovery::{WorkspaceDiscovery, read_gitmodules};
use crate::io::git::{Git, is_checkout};
use crate::plan::Plan;
use crate::worktree::{WorktreeManager, WorktreeState, is_flow_owned};

pub const MAIN_TARGET: &str = "main";

#[derive(Debug, Error)]
pub enum RebaseError {
    #[error("no in-progress rebase found in any known worktree or source repository")]
    NoRebaseInProgress,
    #[error("conflicts detected while rebasing {repo}")]
    Conflicts { repo: String },
    #[error("invalid rebase target '{target}'. Must be 'main' or the plan's worktree name")]
    InvalidTarget { target: String },
    #[error("{repo} has uncommitted changes; commit or stash them before rebasing")]
    Dirty { repo: String },
    #[error("a rebase is already in progress in {repo}; use --continue or --abort")]
    AlreadyInProgress { repo: String },
    #[error("rebase failed in {}; succeeded: {}", .failed.join(", "), list_or_none(.succeeded))]
    Partial {
        failed: Vec<String>,
        succeeded: Vec<String>,
    },
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseMode {
    /// Feature branch onto main, inside the worktree.
    Standard,
    /// Main onto the feature branch, inside the main checkout.
    Integration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoResult {
    UpToDate,
    Rebased { onto: String },
    Conflicts,
    Failed(String),
    /// Branch not visible from this checkout.
    Skipped(String),
    Aborted,
    Continued,
}

impl RepoResult {
    fn is_failure(&self) -> bool {
        matches!(self, RepoResult::Conflicts | RepoResult::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRebase {
    pub name: String,
    pub path: PathBuf,
    pub result: RepoResult,
}

impl fmt::Display for RepoRebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = &self.name;
        match &self.result {
            RepoResult::UpToDate => write!(f, "✓ {name}: Already up to date."),
            RepoResult::Rebased { onto } => write!(f, "✓ {name}: rebased onto {onto}"),
            RepoResult::Conflicts => write!(f, "✗ {name}: conflicts detected while rebasing {name}"),
            RepoResult::Failed(message) => write!(f, "✗ {name}: {message}"),
            RepoResult::Skipped(reason) => write!(f, "  • {name}: skipping ({reason})"),
            RepoResult::Aborted => write!(f, "✓ {name}: rebase aborted"),
            RepoResult::Continued => write!(f, "✓ {name}: rebase continued"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RebaseReport {
    pub mode: RebaseMode,
    pub repos: Vec<RepoRebase>,
    /// Printed after the per-repository lines.
    pub warnings: Vec<String>,
}

impl RebaseReport {
    pub fn lines(&self) -> Vec<String> {
        self.repos
            .iter()
            .map(ToString::to_string)
            .chain(self.warnings.iter().cloned())
            .collect()
    }
}

/// One repository that takes part in a rebase.
#[derive(Debug, Clone)]
struct Member {
    name: String,
    path: PathBuf,
}

/// Rebase the plan's worktree per `target`. `on_repo` sees each result as it
/// happens.
#[instrument(skip_all, fields(plan = %plan.name, target))]
pub fn rebase(
    plan: &Plan,
    flow: &FlowConfig,
    discovery: &dyn WorkspaceDiscovery,
    target: &str,
    mut on_repo: impl FnMut(&RepoRebase),
) -> Result<RebaseReport> {
    let Some(worktree) = plan.config.worktree.as_deref() else {
        bail!("plan '{}' has no worktree to rebase", plan.name);
    };
    let root_git = Git::new(&plan.repo_root);
    let mode = if target == worktree {
        RebaseMode::Integration
    } else if target == MAIN_TARGET || target == root_git.default_branch()? {
        RebaseMode::Standard
    } else {
        return Err(RebaseError::InvalidTarget {
            target: target.to_string(),
        }
        .into());
    };
    let manager = WorktreeManager::new(&plan.repo_root, flow.context.clone(), discovery);
    let tree = manager.path_for(worktree);
    if !matches!(manager.state(worktree)?, WorktreeState::Created { .. }) {
        bail!(
            "worktree '{worktree}' does not exist at {}; run a job that uses it first",
            tree.display()
        );
    }

    let members = match mode {
        RebaseMode::Standard => members(&tree, plan)?,
        RebaseMode::Integration => members(&plan.repo_root, plan)?,
    };
    let ecosystem = members.len() > 1;
    info!(?mode, repos = members.len(), "starting rebase");

    let mut report = RebaseReport {
        mode,
        repos: Vec::new(),
        warnings: Vec::new(),
    };
    for member in members {
        let git = Git::new(&member.path);
        let attempt = match mode {
            RebaseMode::Standard => {
                resolve_base(&git, target).and_then(|onto| rebase_member(&git, &member.name, &onto))
            }
            RebaseMode::Integration => integrate_member(&git, &member.name, worktree),
        };
        // One repository's refusal must not stop the others.
        let result = match attempt {
            Ok(result) => result,
            Err(err) if ecosystem => {
                debug!(repo = %member.name, err = %format!("{err:#}"), "repository failed");
                RepoResult::Failed(format!("{err:#}"))
            }
            Err(err) => return Err(err),
        };
        if !ecosystem && result == RepoResult::Conflicts {
            on_repo(&RepoRebase {
                name: member.name.clone(),
                path: member.path.clone(),
                result,
            });
            return Err(RebaseError::Conflicts { repo: member.name }.into());
        }
        let entry = RepoRebase {
            name: member.name,
            path: member.path,
            result,
        };
        on_repo(&entry);
        report.repos.push(entry);
    }

    if mode == RebaseMode::Integration
        && report
            .repos
            .iter()
            .any(|repo| matches!(repo.result, RepoResult::Rebased { .. }))
    {
        report
            .warnings
            .push("⚠ Your 'main' branch(es) are now in a temporary state.".to_string());
        report
            .warnings
            .push("  When finished testing, restore them with:".to_string());
        for repo in &report.repos {
            if matches!(repo.result, RepoResult::Rebased { .. }) {
                report.warnings.push(format!(
                    "    cd {} && git reset --hard {}/main",
                    repo.path.display(),
                    flow.finish.remote
                ));
            }
        }
    }

    let failed: Vec<String> = report
        .repos
        .iter()
        .filter(|repo| repo.result.is_failure())
        .map(|repo| repo.name.clone())
        .collect();
    if !failed.is_empty() {
        let succeeded = report
            .repos
            .iter()
            .filter(|repo| !repo.result.is_failure() && !matches!(repo.result, RepoResult::Skipped(_)))
            .map(|repo| repo.name.clone())
            .collect();
        if let [single] = report.repos.as_slice()
            && let RepoResult::Failed(message) = &single.result
        {
            bail!("{message}");
        }
        return Err(RebaseError::Partial { failed, succeeded }.into());
    }
    Ok(report)
}

/// Populated submodules of `checkout` allowed by the plan, then the checkout
/// itself. Submodules go first so the superproject sees their new commits.
fn members(checkout: &Path, plan: &Plan) -> Result<Vec<Member>> {
    let mut members: Vec<Member> = read_gitmodules(checkout)?
        .into_iter()
        .filter(|sub| plan.config.repo_allowed(&sub.name) || plan.config.repo_allowed(&sub.path))
        .filter(|sub| is_checkout(&checkout.join(&sub.path)))
        .map(|sub| Member {
            path: checkout.join(&sub.path),
            name: sub.name,
        })
        .collect();
    members.push(Member {
        name: repo_label(&plan.repo_root),
        path: checkout.to_path_buf(),
    });
    Ok(members)
}

fn repo_label(root: &Path) -> String {
    root.file_name()
        .map_or_else(|| root.display().to_string(), |name| name.to_string_lossy().into_owned())
}

/// `target` if it is a local branch, else its remote-tracking branch, else
/// the repository's default branch.
fn resolve_base(git: &Git, target: &str) -> Result<String> {
    if git.branch_exists(target)? {
        return Ok(target.to_string());
    }
    let remote = format!("origin/{target}");
    if git.rev_parse(&remote)?.is_some() {
        return Ok(remote);
    }
    git.default_branch()
}

/// Refuse to start on top of a rebase or tracked local changes.
fn preflight(git: &Git, name: &str) -> Result<()> {
    if git.rebase_in_progress()? {
        return Err(RebaseError::AlreadyInProgress {
            repo: name.to_string(),
        }
        .into());
    }
    let dirty = git
        .status_porcelain(true)?
        .into_iter()
        .any(|entry| entry.code != "??" && !is_flow_owned(&entry.path));
    if dirty {
        return Err(RebaseError::Dirty {
            repo: name.to_string(),
        }
        .into());
    }
    Ok(())
}

fn rebase_member(git: &Git, name: &str, onto: &str) -> Result<RepoResult> {
    preflight(git, name)?;
    if git.is_ancestor(onto, "HEAD")? {
        debug!(repo = name, onto, "already up to date");
        return Ok(RepoResult::UpToDate);
    }
    let outcome = git.rebase(onto)?;
    if outcome.success {
        return Ok(RepoResult::Rebased {
            onto: onto.to_string(),
        });
    }
    if git.rebase_in_progress()? || outcome.mentions("CONFLICT") {
        return Ok(RepoResult::Conflicts);
    }
    Ok(RepoResult::Failed(format!("git rebase {onto} failed: {}", outcome.message())))
}

fn integrate_member(git: &Git, name: &str, feature: &str) -> Result<RepoResult> {
    if !git.branch_exists(feature)? {
        return Ok(RepoResult::Skipped(format!("branch {feature} not visible here")));
    }
    preflight(git, name)?;
    let base = resolve_base(git, MAIN_TARGET)?;
    if git.current_branch().ok().as_deref() != Some(base.as_str()) {
        git.checkout(&base)?;
    }
    rebase_member(git, name, feature)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Abort,
    Continue,
}

/// Abort or continue every in-progress rebase across the plan worktree, its
/// submodules, the main checkout and discovered repositories.
#[instrument(skip_all, fields(plan = %plan.name, ?action))]
pub fn resume(
    plan: &Plan,
    flow: &FlowConfig,
    discovery: &dyn WorkspaceDiscovery,
    action: Resume,
) -> Result<Vec<RepoRebase>> {
    let mut results = Vec::new();
    for member in candidates(plan, flow, discovery)? {
        let git = Git::new(&member.path);
        if !git.rebase_in_progress()? {
            continue;
        }
        let result = match action {
            Resume::Abort => {
                let outcome = git.rebase_abort()?;
                if !outcome.success {
                    bail!("git rebase --abort failed in {}: {}", member.name, outcome.message());
                }
                RepoResult::Aborted
            }
            Resume::Continue => {
                let outcome = git.rebase_continue()?;
                if !outcome.success {
                    if git.rebase_in_progress()? {
                        return Err(RebaseError::Conflicts { repo: member.name }.into());
                    }
                    bail!("git rebase --continue failed in {}: {}", member.name, outcome.message());
                }
                RepoResult::Continued
            }
        };
        results.push(RepoRebase {
            name: member.name,
            path: member.path,
            result,
        });
    }
    if results.is_empty() {
        return Err(RebaseError::NoRebaseInProgress.into());
    }
    Ok(results)
}

fn candidates(
    plan: &Plan,
    flow: &FlowConfig,
    discovery: &dyn WorkspaceDiscovery,
) -> Result<Vec<Member>> {
    let mut all = Vec::new();
    if let Some(worktree) = plan.config.worktree.as_deref() {
        let manager = WorktreeManager::new(&plan.repo_root, flow.context.clone(), discovery);
        let tree = manager.path_for(worktree);
        if is_checkout(&tree) {
            all.extend(members(&tree, plan)?);
        }
    }
    all.extend(members(&plan.repo_root, plan)?);
    all.extend(discovery.known_repos(&plan.repo_root)?.into_iter().map(|repo| Member {
        name: repo.name,
        path: repo.path,
    }));

    let mut seen = HashSet::new();
    Ok(all
        .into_iter()
        .filter(|member| {
            let key = member.path.canonicalize().unwrap_or_else(|_| member.path.clone());
            seen.insert(key)
        })
        .collect())
}
