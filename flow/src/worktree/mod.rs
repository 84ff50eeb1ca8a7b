//! Worktree lifecycle: `absent -> created -> (stale) -> pruned`.
//!
//! Worktrees live at `<root>/.grove-worktrees/<name>` on a branch of the same
//! name. [`WorktreeManager::ensure`] is idempotent: a matching worktree is
//! returned untouched, a stale registration is cleaned up and recreated.

pub mod ecosystem;
pub mod teardown;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::job::timestamp;
use crate::core::naming::validate_worktree_name;
use crate::io::config::ContextConfig;
use crate::io::discovery::{WorkspaceDiscovery, read_gitmodules};
use crate::io::git::{Git, WorktreeEntry};
use crate::io::job_store::write_atomic;
use crate::io::state::StateStore;

pub use ecosystem::EcosystemReport;
pub use teardown::{PruneOptions, PruneReport};

pub const WORKTREES_DIR: &str = ".grove-worktrees";
pub const WORKSPACE_MARKER: &str = ".grove-workspace";
/// Context rules copied into every new worktree.
pub const RULES_PATH: &str = ".grove/rules";

/// What is on disk for a worktree name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeState {
    Absent,
    Created { branch: Option<String> },
    /// Registered with git but the directory is gone, or a directory that git
    /// does not know about.
    Stale { reason: String },
}

/// Parameters for [`WorktreeManager::ensure`].
#[derive(Debug, Clone, Default)]
pub struct WorktreeRequest<'a> {
    pub name: &'a str,
    /// Plan made active inside the new worktree.
    pub plan_dir: Option<&'a Path>,
    /// Ecosystem allow-list; empty means every repository.
    pub repos: &'a [String],
    /// Rules file overriding `context.default_rules`.
    pub rules_file: Option<&'a Path>,
}

#[derive(Debug, Clone)]
pub struct EnsuredWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub created: bool,
    pub ecosystem: Option<EcosystemReport>,
}

#[derive(Debug, Serialize)]
struct WorkspaceMarker<'a> {
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<String>,
    created_at: String,
}

pub struct WorktreeManager<'a> {
    root: PathBuf,
    git: Git,
    context: ContextConfig,
    discovery: &'a dyn WorkspaceDiscovery,
}

impl<'a> WorktreeManager<'a> {
    /// Manager for the main checkout at `root`.
    pub fn new(root: &Path, context: ContextConfig, discovery: &'a dyn WorkspaceDiscovery) -> Self {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        Self {
            git: Git::new(&root),
            root,
            context,
            discovery,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(WORKTREES_DIR).join(name)
    }

    pub fn state(&self, name: &str) -> Result<WorktreeState> {
        let path = self.path_for(name);
        let entry = self.registered(&path)?;
        Ok(match entry {
            Some(entry) if entry.prunable || !path.exists() => WorktreeState::Stale {
                reason: format!("{} is registered but missing", path.display()),
            },
            Some(entry) => WorktreeState::Created {
                branch: entry.branch,
            },
            None if path.exists() => WorktreeState::Stale {
                reason: format!("{} exists but is not a git worktree", path.display()),
            },
            None => WorktreeState::Absent,
        })
    }

    /// Return the worktree for `request.name`, creating it when needed.
    #[instrument(skip_all, fields(name = request.name))]
    pub fn ensure(&self, request: &WorktreeRequest<'_>, now: DateTime<Utc>) -> Result<EnsuredWorktree> {
        validate_worktree_name(request.name)?;
        let name = request.name;
        let path = self.path_for(name);

        match self.state(name)? {
            WorktreeState::Created { branch } => {
                if branch.as_deref() != Some(name) {
                    return Err(anyhow!(
                        "worktree {} is on branch '{}', expected '{name}'",
                        path.display(),
                        branch.as_deref().unwrap_or("(detached)")
                    ));
                }
                debug!(path = %path.display(), "reusing worktree");
                return Ok(EnsuredWorktree {
                    path,
                    branch: name.to_string(),
                    created: false,
                    ecosystem: None,
                });
            }
            WorktreeState::Stale { reason } => {
                warn!(%reason, "cleaning up stale worktree");
                self.clear_stale(&path)?;
            }
            WorktreeState::Absent => {}
        }

        let base = self.git.default_branch()?;
        info!(path = %path.display(), base = %base, "creating worktree");
        self.exclude_worktrees_dir()?;
        fs::create_dir_all(self.root.join(WORKTREES_DIR))
            .with_context(|| format!("create {}", self.root.join(WORKTREES_DIR).display()))?;
        self.git.worktree_add(&path, name, Some(&base))?;

        let ecosystem = if read_gitmodules(&self.root)?.is_empty() {
            None
        } else {
            Some(ecosystem::setup(
                &self.root,
                &path,
                name,
                request.repos,
                self.discovery,
            )?)
        };

        self.write_rules(&path, request.rules_file)?;
        self.write_marker(&path, name, request.plan_dir, now)?;
        if let Some(plan_dir) = request.plan_dir {
            StateStore::at(&path).set_active_plan(plan_dir)?;
        }

        Ok(EnsuredWorktree {
            path,
            branch: name.to_string(),
            created: true,
            ecosystem,
        })
    }

    fn registered(&self, path: &Path) -> Result<Option<WorktreeEntry>> {
        Ok(self
            .git
            .worktree_list()?
            .into_iter()
            .find(|entry| entry.path.as_path() == path))
    }

    fn clear_stale(&self, path: &Path) -> Result<()> {
        self.git.worktree_prune()?;
        if path.exists() {
            let empty = fs::read_dir(path)
                .with_context(|| format!("read {}", path.display()))?
                .next()
                .is_none();
            if !empty {
                return Err(anyhow!(
                    "{} exists and is not a git worktree; move it aside first",
                    path.display()
                ));
            }
            fs::remove_dir(path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Keep `.grove-worktrees/` out of the main checkout's status.
    fn exclude_worktrees_dir(&self) -> Result<()> {
        let exclude = self.git.git_path("info/exclude")?;
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        let entry = format!("/{WORKTREES_DIR}/");
        if existing.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        write_atomic(&exclude, &updated)
    }

    fn write_rules(&self, tree: &Path, override_rules: Option<&Path>) -> Result<()> {
        let source = override_rules
            .map(Path::to_path_buf)
            .or_else(|| {
                self.context
                    .default_rules
                    .as_ref()
                    .map(|rel| self.root.join(rel))
            })
            .filter(|path| path.is_file());
        let contents = match &source {
            Some(path) => {
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
            }
            None => format!("{}\n", self.context.fallback_pattern),
        };
        debug!(
            source = %source.as_deref().map_or("fallback".into(), |p| p.display().to_string()),
            "writing context rules"
        );
        write_atomic(&tree.join(RULES_PATH), &contents)
    }

    fn write_marker(
        &self,
        tree: &Path,
        branch: &str,
        plan_dir: Option<&Path>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let marker = WorkspaceMarker {
            branch,
            plan: plan_dir
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned()),
            created_at: timestamp(now),
        };
        let text = serde_yaml::to_string(&marker).context("serialize workspace marker")?;
        write_atomic(&tree.join(WORKSPACE_MARKER), &text)
    }
}

/// Paths flow itself writes into a worktree.
pub fn is_flow_owned(rel_path: &str) -> bool {
    rel_path == WORKSPACE_MARKER
        || rel_path.starts_with(".grove/")
        || rel_path == "go.work"
        || rel_path == "go.work.sum"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::discovery::SubmoduleDiscovery;
    use crate::test_support::{TestRepo, fixed_now, git_available};

    #[test]
    fn ensure_creates_then_reuses() {
        if !git_available() {
            return;
        }
        let repo = TestRepo::new();
        let discovery = SubmoduleDiscovery;
        let manager = WorktreeManager::new(repo.path(), ContextConfig::default(), &discovery);
        let plan_dir = repo.path().join("plans/auth");
        fs::create_dir_all(&plan_dir).expect("plan dir");

        let request = WorktreeRequest {
            name: "feature-auth",
            plan_dir: Some(&plan_dir),
            ..WorktreeRequest::default()
        };
        let first = manager.ensure(&request, fixed_now()).expect("create");
        assert!(first.created);
        assert_eq!(
            Git::new(&first.path).current_branch().expect("branch"),
            "feature-auth"
        );
        assert_eq!(
            fs::read_to_string(first.path.join(RULES_PATH)).expect("rules"),
            "**/*\n"
        );
        let marker = fs::read_to_string(first.path.join(WORKSPACE_MARKER)).expect("marker");
        assert!(marker.contains("branch: feature-auth"));
        assert!(marker.contains("plan: auth"));
        assert_eq!(
            StateStore::at(&first.path).active_plan().expect("state"),
            Some(plan_dir.canonicalize().expect("canon"))
        );

        let second = manager.ensure(&request, fixed_now()).expect("reuse");
        assert!(!second.created);
        assert_eq!(second.path, first.path);
    }

    #[test]
    fn stale_registration_is_recreated() {
        if !git_available() {
            return;
        }
        let repo = TestRepo::new();
        let discovery = SubmoduleDiscovery;
        let manager = WorktreeManager::new(repo.path(), ContextConfig::default(), &discovery);
        let request = WorktreeRequest {
            name: "scratch",
            ..WorktreeRequest::default()
        };
        let created = manager.ensure(&request, fixed_now()).expect("create");
        fs::remove_dir_all(&created.path).expect("remove dir");
        assert!(matches!(
            manager.state("scratch").expect("state"),
            WorktreeState::Stale { .. }
        ));
        let again = manager.ensure(&request, fixed_now()).expect("recreate");
        assert!(again.created);
        assert!(again.path.join(WORKSPACE_MARKER).exists());
    }

    #[test]
    fn default_rules_are_copied() {
        if !git_available() {
            return;
        }
        let repo = TestRepo::new();
        fs::write(repo.path().join("RULES.txt"), "src/**\n").expect("rules");
        let discovery = SubmoduleDiscovery;
        let context = ContextConfig {
            default_rules: Some(PathBuf::from("RULES.txt")),
            ..ContextConfig::default()
        };
        let manager = WorktreeManager::new(repo.path(), context, &discovery);
        let tree = manager
            .ensure(
                &WorktreeRequest {
                    name: "rules",
                    ..WorktreeRequest::default()
                },
                fixed_now(),
            )
            .expect("create");
        assert_eq!(
            fs::read_to_string(tree.path.join(RULES_PATH)).expect("rules"),
            "src/**\n"
        );
    }

    #[test]
    fn invalid_names_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let discovery = SubmoduleDiscovery;
        let manager = WorktreeManager::new(temp.path(), ContextConfig::default(), &discovery);
        let err = manager
            .ensure(
                &WorktreeRequest {
                    name: "bad name",
                    ..WorktreeRequest::default()
                },
                fixed_now(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("worktree"));
    }

    #[test]
    fn flow_owned_paths() {
        assert!(is_flow_owned(".grove/rules"));
        assert!(is_flow_owned(WORKSPACE_MARKER));
        assert!(!is_flow_owned("src/main.rs"));
    }
}
