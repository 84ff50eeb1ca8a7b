//! Ecosystem worktrees: a superproject worktree plus one checkout per submodule.
//!
//! Repositories known to workspace discovery get a linked worktree from their
//! source checkout, so branches made inside the worktree are visible from the
//! source. Anything else gets a plain `git submodule update --init` clone.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::go_work;
use crate::io::discovery::{Submodule, WorkspaceDiscovery, read_gitmodules};
use crate::io::git::{Git, is_checkout};
use crate::io::job_store::write_atomic;

/// How one repository ended up in the worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSetup {
    Skipped,
    Linked { source: PathBuf },
    Standard,
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOutcome {
    pub name: String,
    /// Path relative to the worktree root.
    pub path: String,
    pub setup: RepoSetup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcosystemReport {
    pub repos: Vec<RepoOutcome>,
    /// Whether a `go.work` was written into the worktree.
    pub go_work: bool,
}

impl EcosystemReport {
    /// Lines in the form `  • <repo>: <what happened>`.
    pub fn lines(&self) -> Vec<String> {
        self.repos
            .iter()
            .map(|repo| {
                let what = match repo.setup {
                    RepoSetup::Skipped => "skipping (not in repos filter)",
                    RepoSetup::Linked { .. } => "creating linked worktree",
                    RepoSetup::Standard => "standard submodule checkout",
                    RepoSetup::AlreadyPresent => "already present",
                };
                format!("  • {}: {what}", repo.name)
            })
            .collect()
    }

    pub fn populated(&self) -> impl Iterator<Item = &RepoOutcome> {
        self.repos
            .iter()
            .filter(|repo| repo.setup != RepoSetup::Skipped)
    }
}

/// Populate the submodules of a fresh superproject worktree at `tree`.
#[instrument(skip_all, fields(tree = %tree.display(), branch))]
pub fn setup(
    root: &Path,
    tree: &Path,
    branch: &str,
    repos_filter: &[String],
    discovery: &dyn WorkspaceDiscovery,
) -> Result<EcosystemReport> {
    let mut report = EcosystemReport::default();
    for sub in read_gitmodules(root)? {
        let setup = if !in_filter(&sub, repos_filter) {
            RepoSetup::Skipped
        } else {
            populate(root, tree, branch, &sub, discovery)?
        };
        info!(repo = %sub.name, setup = ?setup, "ecosystem repository");
        report.repos.push(RepoOutcome {
            name: sub.name,
            path: sub.path,
            setup,
        });
    }
    report.go_work = write_go_work(root, tree, &report)?;
    Ok(report)
}

fn in_filter(sub: &Submodule, filter: &[String]) -> bool {
    filter.is_empty() || filter.iter().any(|f| *f == sub.name || *f == sub.path)
}

fn populate(
    root: &Path,
    tree: &Path,
    branch: &str,
    sub: &Submodule,
    discovery: &dyn WorkspaceDiscovery,
) -> Result<RepoSetup> {
    let target = tree.join(&sub.path);
    if is_checkout(&target) {
        return Ok(RepoSetup::AlreadyPresent);
    }
    if let Some(known) = discovery.find(root, &sub.name)? {
        debug!(repo = %sub.name, source = %known.path.display(), "linking worktree");
        fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
        Git::new(&known.path)
            .worktree_add(&target, branch, Some("HEAD"))
            .with_context(|| format!("create linked worktree for {}", sub.name))?;
        return Ok(RepoSetup::Linked { source: known.path });
    }
    debug!(repo = %sub.name, "standard submodule checkout");
    Git::new(tree)
        .submodule_update_init(&sub.path)
        .with_context(|| format!("check out submodule {}", sub.name))?;
    Git::new(&target).checkout_reset_branch(branch)?;
    Ok(RepoSetup::Standard)
}

/// Rewrite the root `go.work`, or generate one when populated repos carry a
/// `go.mod`. Returns whether a file was written.
fn write_go_work(root: &Path, tree: &Path, report: &EcosystemReport) -> Result<bool> {
    let source = root.join("go.work");
    if source.is_file() {
        let text =
            fs::read_to_string(&source).with_context(|| format!("read {}", source.display()))?;
        let populated: HashSet<String> = report
            .populated()
            .map(|repo| go_work::module_name(&repo.path).to_string())
            .collect();
        let rewritten = go_work::rewrite(&go_work::parse(&text), root, &populated);
        write_atomic(&tree.join("go.work"), &rewritten)?;
        return Ok(true);
    }
    let modules: Vec<&str> = report
        .populated()
        .filter(|repo| tree.join(&repo.path).join("go.mod").is_file())
        .map(|repo| repo.path.as_str())
        .collect();
    if modules.is_empty() {
        return Ok(false);
    }
    write_atomic(&tree.join("go.work"), &go_work::generate(modules))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::ContextConfig;
    use crate::io::discovery::SubmoduleDiscovery;
    use crate::test_support::{EcosystemRepo, StaticDiscovery, fixed_now, git_available};
    use crate::worktree::{WorktreeManager, WorktreeRequest};

    fn outcome(name: &str, setup: RepoSetup) -> RepoOutcome {
        RepoOutcome {
            name: name.to_string(),
            path: name.to_string(),
            setup,
        }
    }

    #[test]
    fn report_lines_name_each_repo() {
        let report = EcosystemReport {
            repos: vec![
                outcome("core", RepoSetup::Linked {
                    source: PathBuf::from("/src/core"),
                }),
                outcome("cli", RepoSetup::Skipped),
                outcome("docs", RepoSetup::Standard),
            ],
            go_work: false,
        };
        assert_eq!(
            report.lines(),
            vec![
                "  • core: creating linked worktree",
                "  • cli: skipping (not in repos filter)",
                "  • docs: standard submodule checkout",
            ]
        );
        assert_eq!(report.populated().count(), 2);
    }

    #[test]
    fn filter_matches_name_or_path() {
        let sub = Submodule {
            name: "core".to_string(),
            path: "libs/core".to_string(),
            url: None,
        };
        assert!(in_filter(&sub, &[]));
        assert!(in_filter(&sub, &["libs/core".to_string()]));
        assert!(!in_filter(&sub, &["cli".to_string()]));
    }

    #[test]
    fn generates_go_work_for_populated_modules() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("root");
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("core")).expect("core");
        fs::create_dir_all(tree.join("cli")).expect("cli");
        fs::create_dir_all(&root).expect("root");
        fs::write(tree.join("core/go.mod"), "module core\n").expect("go.mod");
        let report = EcosystemReport {
            repos: vec![
                outcome("core", RepoSetup::Standard),
                outcome("cli", RepoSetup::Skipped),
            ],
            go_work: false,
        };
        assert!(write_go_work(&root, &tree, &report).expect("write"));
        assert_eq!(
            fs::read_to_string(tree.join("go.work")).expect("read"),
            "go 1.21\n\nuse (\n\t./core\n)\n"
        );
    }

    #[test]
    fn known_repos_get_linked_worktrees_and_go_work() {
        if !git_available() {
            return;
        }
        let eco = EcosystemRepo::new(&[("core", Some("example.com/core")), ("cli", None)]);
        let discovery = SubmoduleDiscovery;
        let manager = WorktreeManager::new(eco.path(), ContextConfig::default(), &discovery);
        let ensured = manager
            .ensure(
                &WorktreeRequest {
                    name: "feature",
                    ..WorktreeRequest::default()
                },
                fixed_now(),
            )
            .expect("ensure");
        let report = ensured.ecosystem.expect("ecosystem report");
        assert_eq!(
            report.lines(),
            vec![
                "  • core: creating linked worktree",
                "  • cli: creating linked worktree",
            ]
        );
        assert!(report.go_work);
        assert_eq!(
            fs::read_to_string(ensured.path.join("go.work")).expect("go.work"),
            "go 1.21\n\nuse (\n\t./core\n)\n"
        );
        assert_eq!(
            Git::new(ensured.path.join("core")).current_branch().expect("branch"),
            "feature"
        );
        // The branch is visible from the source checkout.
        assert!(Git::new(eco.member("core")).branch_exists("feature").expect("branch"));
    }

    #[test]
    fn unknown_repos_get_standard_checkouts_and_filter_skips() {
        if !git_available() {
            return;
        }
        let eco = EcosystemRepo::new(&[("core", None), ("cli", None)]);
        let discovery = StaticDiscovery::default();
        let manager = WorktreeManager::new(eco.path(), ContextConfig::default(), &discovery);
        let repos = vec!["core".to_string()];
        let ensured = manager
            .ensure(
                &WorktreeRequest {
                    name: "feature",
                    repos: &repos,
                    ..WorktreeRequest::default()
                },
                fixed_now(),
            )
            .expect("ensure");
        let report = ensured.ecosystem.expect("ecosystem report");
        assert_eq!(
            report.lines(),
            vec![
                "  • core: standard submodule checkout",
                "  • cli: skipping (not in repos filter)",
            ]
        );
        assert!(!report.go_work);
        assert_eq!(
            Git::new(ensured.path.join("core")).current_branch().expect("branch"),
            "feature"
        );
        assert!(!is_checkout(&ensured.path.join("cli")));
        assert!(!Git::new(eco.member("core")).branch_exists("feature").expect("branch"));
    }
}
