//! Worktree teardown.
//!
//! Removal never fails a finish because git refused: the worktree is reported
//! as left behind and every branch that can still be deleted is deleted.
//! Submodule worktrees go first, then the superproject worktree, then
//! submodule branches, and the superproject branch only once its worktree is
//! actually gone.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::discovery::read_gitmodules;
use crate::io::git::{Git, GitOutcome};
use crate::worktree::{WorktreeManager, is_flow_owned};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOptions {
    pub delete_branch: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub path: PathBuf,
    /// The worktree directory is gone (or never existed).
    pub removed: bool,
    /// Git's refusal when the worktree could not be removed.
    pub left_behind: Option<String>,
    pub deleted_branches: Vec<String>,
    pub warnings: Vec<String>,
}

impl PruneReport {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(message) = &self.left_behind {
            lines.push(format!(
                "  ⚠ worktree {} left behind: {message}",
                self.path.display()
            ));
        } else if self.removed {
            lines.push(format!("  ✓ removed worktree {}", self.path.display()));
        }
        for branch in &self.deleted_branches {
            lines.push(format!("  ✓ deleted branch {branch}"));
        }
        for warning in &self.warnings {
            lines.push(format!("  ⚠ {warning}"));
        }
        lines
    }
}

/// A submodule checkout inside the worktree that is a linked worktree of
/// some source repository.
struct LinkedSubmodule {
    label: String,
    path: PathBuf,
    source: PathBuf,
}

impl WorktreeManager<'_> {
    #[instrument(skip_all, fields(name, force = options.force))]
    pub fn prune(&self, name: &str, options: PruneOptions) -> Result<PruneReport> {
        let path = self.path_for(name);
        let mut report = PruneReport {
            path: path.clone(),
            ..PruneReport::default()
        };

        let linked = self.linked_submodules(&path)?;
        for sub in &linked {
            let outcome = Git::new(&sub.source).worktree_remove(&sub.path, true)?;
            if outcome.success {
                debug!(repo = %sub.label, "removed submodule worktree");
            } else {
                report.warnings.push(format!(
                    "submodule worktree {} not removed: {}",
                    sub.path.display(),
                    outcome.message()
                ));
            }
        }

        if path.exists() {
            self.remove_superproject(&path, options.force, &mut report)?;
        } else {
            self.git.worktree_prune()?;
            report.removed = true;
        }

        if options.delete_branch {
            for sub in &linked {
                let repo = Git::new(&sub.source);
                if !repo.branch_exists(name)? {
                    continue;
                }
                let outcome = repo.branch_delete(name, true)?;
                record_branch(&mut report, &format!("{name} ({})", sub.label), &outcome);
            }
            self.delete_superproject_branch(name, &mut report)?;
        }
        info!(
            removed = report.removed,
            branches = report.deleted_branches.len(),
            "pruned worktree"
        );
        Ok(report)
    }

    fn remove_superproject(&self, path: &Path, force: bool, report: &mut PruneReport) -> Result<()> {
        let mut outcome = self.git.worktree_remove(path, force)?;
        if !outcome.success
            && !force
            && outcome.mentions("contains modified or untracked files")
            && self.only_flow_changes(path)?
        {
            debug!("retrying removal with --force; only flow files are dirty");
            outcome = self.git.worktree_remove(path, true)?;
        }
        if outcome.success {
            report.removed = true;
            return Ok(());
        }
        if force && outcome.mentions("submodules") {
            warn!(path = %path.display(), "removing worktree with submodules by hand");
            fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
            self.git.worktree_prune()?;
            report.removed = true;
            return Ok(());
        }
        warn!(path = %path.display(), message = %outcome.message(), "worktree left behind");
        report.left_behind = Some(outcome.message());
        Ok(())
    }

    /// Dirty entries are limited to files flow wrote and submodule paths.
    fn only_flow_changes(&self, path: &Path) -> Result<bool> {
        let submodules: Vec<String> = read_gitmodules(&self.root)?
            .into_iter()
            .map(|sub| sub.path)
            .collect();
        let entries = Git::new(path).status_porcelain(true)?;
        Ok(entries.iter().all(|entry| {
            is_flow_owned(&entry.path)
                || submodules
                    .iter()
                    .any(|sub| entry.path == *sub || entry.path.starts_with(&format!("{sub}/")))
        }))
    }

    fn delete_superproject_branch(&self, name: &str, report: &mut PruneReport) -> Result<()> {
        if !self.git.branch_exists(name)? {
            return Ok(());
        }
        if !report.removed {
            report
                .warnings
                .push(format!("branch {name} kept: its worktree is still present"));
            return Ok(());
        }
        let mut outcome = self.git.branch_delete(name, false)?;
        if !outcome.success
            && (outcome.mentions("not fully merged") || outcome.mentions("checked out at"))
        {
            outcome = self.git.branch_delete(name, true)?;
        }
        record_branch(report, name, &outcome);
        Ok(())
    }

    fn linked_submodules(&self, tree: &Path) -> Result<Vec<LinkedSubmodule>> {
        let mut linked = Vec::new();
        for sub in read_gitmodules(&self.root)? {
            let path = tree.join(&sub.path);
            if !is_linked_worktree(&path) {
                continue;
            }
            let source = match self.discovery.find(&self.root, &sub.name)? {
                Some(known) => known.path,
                None => self.root.join(&sub.path),
            };
            linked.push(LinkedSubmodule {
                label: sub.name,
                path,
                source,
            });
        }
        Ok(linked)
    }
}

fn record_branch(report: &mut PruneReport, label: &str, outcome: &GitOutcome) {
    if outcome.success {
        report.deleted_branches.push(label.to_string());
    } else {
        report
            .warnings
            .push(format!("branch {label} not deleted: {}", outcome.message()));
    }
}

/// `.git` is a file pointing at `<gitdir>/worktrees/<name>`. A submodule
/// cloned inside a worktree points at `.../worktrees/<tree>/modules/<name>`
/// and is not linked.
fn is_linked_worktree(path: &Path) -> bool {
    fs::read_to_string(path.join(".git"))
        .map(|text| {
            text.lines()
                .filter_map(|line| line.strip_prefix("gitdir:"))
                .any(|dir| {
                    Path::new(dir.trim())
                        .parent()
                        .and_then(Path::file_name)
                        .is_some_and(|name| name == "worktrees")
                })
        })
        .unwrap_or(false)
}
