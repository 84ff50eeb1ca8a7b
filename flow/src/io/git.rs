//! Git capability.
//!
//! Every git invocation in the crate goes through [`Git`]. Operations are
//! narrow and named; callers that need to inspect a refusal get the raw
//! [`GitOutcome`] instead of an error.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name, `None` when detached.
    pub branch: Option<String>,
    pub prunable: bool,
}

/// Exit status and text of a git command that is allowed to fail.
#[derive(Debug, Clone)]
pub struct GitOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutcome {
    fn from_output(output: &Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Stderr and stdout combined, trimmed.
    pub fn message(&self) -> String {
        let mut msg = self.stderr.trim().to_string();
        if !self.stdout.trim().is_empty() {
            if !msg.is_empty() {
                msg.push('\n');
            }
            msg.push_str(self.stdout.trim());
        }
        msg
    }

    pub fn mentions(&self, needle: &str) -> bool {
        self.stderr.contains(needle) || self.stdout.contains(needle)
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// `git init` with `main` as the initial branch.
    #[instrument(skip_all, fields(path = %self.workdir.display()))]
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.workdir)
            .with_context(|| format!("create {}", self.workdir.display()))?;
        self.run_checked(&["init", "-q", "-b", "main"])?;
        Ok(())
    }

    /// Top of the working tree containing `workdir`.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Root of the main checkout, even when `workdir` is a linked worktree.
    pub fn main_root(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--path-format=absolute", "--git-common-dir"])?;
        let common = PathBuf::from(out.trim());
        if common.file_name().is_some_and(|name| name == ".git")
            && let Some(parent) = common.parent()
        {
            return Ok(parent.to_path_buf());
        }
        self.toplevel()
    }

    /// Absolute path of a file inside the git directory (`rebase-merge`, ...).
    pub fn git_path(&self, name: &str) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--path-format=absolute", "--git-path", name])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Resolve a revision to a commit sha, `None` if it does not exist.
    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Branch that new worktrees are seeded from.
    ///
    /// Prefers `origin/HEAD`, then `main`, then `master`, then the current branch.
    pub fn default_branch(&self) -> Result<String> {
        let out = self.run(&["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"])?;
        if out.status.success() {
            let full = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if let Some(name) = full.strip_prefix("origin/") {
                return Ok(name.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_string());
            }
        }
        self.current_branch()
    }

    pub fn status_porcelain(&self, ignore_submodules: bool) -> Result<Vec<StatusEntry>> {
        let mut args = vec!["status", "--porcelain=v1", "-uall"];
        if ignore_submodules {
            args.push("--ignore-submodules");
        }
        let out = self.run_capture(&args)?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn add(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Commit everything staged, allowing empty commits.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<()> {
        self.run_checked(&[
            "-c",
            "user.name=flow",
            "-c",
            "user.email=flow@localhost",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            message,
        ])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", "-q", branch])?;
        Ok(())
    }

    /// Create or reset `branch` at HEAD and check it out.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_reset_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch with -B");
        self.run_checked(&["checkout", "-q", "-B", branch])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Add a linked worktree at `path` on `branch`.
    ///
    /// An existing branch is checked out as is; otherwise it is created from `base`.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: Option<&str>) -> Result<()> {
        let path_arg = path.to_string_lossy().into_owned();
        if self.branch_exists(branch)? {
            debug!(branch, "adding worktree on existing branch");
            self.run_checked(&["worktree", "add", path_arg.as_str(), branch])?;
        } else {
            debug!(branch, base, "adding worktree on new branch");
            let mut args = vec!["worktree", "add", "-b", branch, path_arg.as_str()];
            if let Some(base) = base {
                args.push(base);
            }
            self.run_checked(&args)?;
        }
        Ok(())
    }

    /// `git worktree remove`; refusals are returned, not raised.
    #[instrument(skip_all, fields(path = %path.display(), force))]
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<GitOutcome> {
        let path_arg = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_arg.as_str());
        let outcome = GitOutcome::from_output(&self.run(&args)?);
        if !outcome.success {
            debug!(message = %outcome.message(), "worktree remove refused");
        }
        Ok(outcome)
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// `git branch -d` (or `-D`); refusals are returned, not raised.
    #[instrument(skip_all, fields(branch, force))]
    pub fn branch_delete(&self, branch: &str, force: bool) -> Result<GitOutcome> {
        let flag = if force { "-D" } else { "-d" };
        Ok(GitOutcome::from_output(&self.run(&["branch", flag, branch])?))
    }

    pub fn has_remote(&self, remote: &str) -> Result<bool> {
        let out = self.run(&["remote", "get-url", remote])?;
        Ok(out.status.success())
    }

    /// `git ls-remote --heads`; an unreachable remote reads as absent.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        let out = self.run(&["ls-remote", "--heads", remote, branch])?;
        if !out.status.success() {
            debug!(remote, branch, "ls-remote failed");
            return Ok(false);
        }
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<GitOutcome> {
        Ok(GitOutcome::from_output(&self.run(&[
            "push", "-q", remote, "--delete", branch,
        ])?))
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    #[instrument(skip_all, fields(onto))]
    pub fn rebase(&self, onto: &str) -> Result<GitOutcome> {
        Ok(GitOutcome::from_output(&self.run(&["rebase", onto])?))
    }

    pub fn rebase_abort(&self) -> Result<GitOutcome> {
        Ok(GitOutcome::from_output(&self.run(&["rebase", "--abort"])?))
    }

    /// `git rebase --continue` without opening an editor.
    pub fn rebase_continue(&self) -> Result<GitOutcome> {
        let output = Command::new("git")
            .args(["rebase", "--continue"])
            .env("GIT_EDITOR", "true")
            .current_dir(&self.workdir)
            .output()
            .context("spawn git rebase --continue")?;
        Ok(GitOutcome::from_output(&output))
    }

    /// A rebase marker exists in this checkout's git directory.
    pub fn rebase_in_progress(&self) -> Result<bool> {
        for marker in ["rebase-merge", "rebase-apply"] {
            if self.git_path(marker)?.exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Populate one submodule path from its recorded URL.
    #[instrument(skip_all, fields(path = rel_path))]
    pub fn submodule_update_init(&self, rel_path: &str) -> Result<()> {
        self.run_checked(&[
            "-c",
            "protocol.file.allow=always",
            "submodule",
            "update",
            "--init",
            "--",
            rel_path,
        ])?;
        Ok(())
    }

    /// `git submodule add` from a local path.
    pub fn submodule_add(&self, url: &str, rel_path: &str) -> Result<()> {
        self.run_checked(&[
            "-c",
            "protocol.file.allow=always",
            "submodule",
            "add",
            "-q",
            url,
            rel_path,
        ])?;
        Ok(())
    }

    pub(crate) fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub(crate) fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = %args.join(" "), workdir = %self.workdir.display(), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Whether `path` is the top of a git checkout (`.git` dir or file).
pub fn is_checkout(path: &Path) -> bool {
    path.join(".git").exists()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_worktree_list(text: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in text.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                prunable: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                entry.branch = Some(branch.trim_start_matches("refs/heads/").to_string());
            } else if line.starts_with("prunable") {
                entry.prunable = true;
            }
        }
    }
    entries.extend(current);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(e.code, "??");
        assert_eq!(e.path, "foo.txt");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn parses_worktree_porcelain() {
        let text = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo/.grove-worktrees/feat\nHEAD def\nbranch refs/heads/feat\nprunable gitdir file points to non-existent location\n\nworktree /tmp/detached\nHEAD 123\ndetached\n";
        let entries = parse_worktree_list(text);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].path, PathBuf::from("/repo/.grove-worktrees/feat"));
        assert!(entries[1].prunable);
        assert_eq!(entries[2].branch, None);
    }

    #[test]
    fn outcome_message_combines_streams() {
        let outcome = GitOutcome {
            success: false,
            stdout: "CONFLICT (content)\n".to_string(),
            stderr: "error: could not apply\n".to_string(),
        };
        assert_eq!(outcome.message(), "error: could not apply\nCONFLICT (content)");
        assert!(outcome.mentions("CONFLICT"));
    }
}
