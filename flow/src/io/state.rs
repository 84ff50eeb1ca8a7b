//! Per-checkout state (`.grove/state.yml`).
//!
//! Each checkout (the main one and every linked worktree) has its own state
//! file at its root. The active plan is stored relative to that root and
//! re-anchored on read, so it stays valid wherever the checkout lives.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::io::job_store::write_atomic;

pub const STATE_RELATIVE_PATH: &str = ".grove/state.yml";
const ACTIVE_PLAN_KEY: &str = "flow.active_plan";

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// State for the checkout containing `start`.
    pub fn discover(start: &Path) -> Result<Self> {
        let root = find_checkout_root(start)
            .ok_or_else(|| anyhow!("not inside a git checkout: {}", start.display()))?;
        Ok(Self { root })
    }

    /// State for the checkout rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(STATE_RELATIVE_PATH)
    }

    /// The active plan directory as an absolute path.
    pub fn active_plan(&self) -> Result<Option<PathBuf>> {
        let map = self.read()?;
        let Some(stored) = map
            .get(Value::String(ACTIVE_PLAN_KEY.to_string()))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };
        let stored = Path::new(stored);
        if stored.is_absolute() {
            return Ok(Some(stored.to_path_buf()));
        }
        Ok(Some(normalize(&self.root.join(stored))))
    }

    pub fn set_active_plan(&self, plan_dir: &Path) -> Result<()> {
        let stored = relative_to(&absolute(plan_dir)?, &absolute(&self.root)?);
        debug!(root = %self.root.display(), plan = %stored.display(), "set active plan");
        let mut map = self.read()?;
        map.insert(
            Value::String(ACTIVE_PLAN_KEY.to_string()),
            Value::String(stored.to_string_lossy().into_owned()),
        );
        self.write(&map)
    }

    /// Clear the active plan. Returns whether one was set.
    pub fn unset(&self) -> Result<bool> {
        let mut map = self.read()?;
        let removed = map
            .remove(Value::String(ACTIVE_PLAN_KEY.to_string()))
            .is_some();
        if removed {
            self.write(&map)?;
        }
        Ok(removed)
    }

    fn read(&self) -> Result<Mapping> {
        let path = self.path();
        if !path.exists() {
            return Ok(Mapping::new());
        }
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Mapping::new());
        }
        match serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))? {
            Value::Mapping(map) => Ok(map),
            Value::Null => Ok(Mapping::new()),
            _ => Err(anyhow!("{} is not a mapping", path.display())),
        }
    }

    fn write(&self, map: &Mapping) -> Result<()> {
        let text = serde_yaml::to_string(map).context("serialize state")?;
        write_atomic(&self.path(), &text)
    }
}

/// Nearest ancestor of `start` (inclusive) holding a `.git` file or directory.
pub fn find_checkout_root(start: &Path) -> Option<PathBuf> {
    let start = absolute(start).ok()?;
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    if path.is_absolute() {
        return Ok(normalize(path));
    }
    let cwd = std::env::current_dir().context("read current directory")?;
    Ok(normalize(&cwd.join(path)))
}

/// Lexically resolve `.` and `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// `path` expressed relative to `base`; both absolute and normalized.
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 {
        return path.to_path_buf();
    }
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &path_parts[common..] {
        out.push(part);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkout(dir: &Path) {
        fs::create_dir_all(dir.join(".git")).expect("git dir");
    }

    #[test]
    fn stores_plan_relative_to_checkout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("repo");
        checkout(&root);
        let plan = root.join("plans/auth");
        fs::create_dir_all(&plan).expect("plan");

        let state = StateStore::discover(&plan).expect("discover");
        state.set_active_plan(&plan).expect("set");
        let text = fs::read_to_string(state.path()).expect("read");
        assert!(text.contains("flow.active_plan: plans/auth"));
        assert_eq!(
            state.active_plan().expect("get"),
            Some(plan.canonicalize().expect("canon"))
        );
    }

    #[test]
    fn worktree_state_is_separate_and_reanchored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("repo");
        checkout(&root);
        let plan = root.join("plans/auth");
        fs::create_dir_all(&plan).expect("plan");
        let tree = root.join(".grove-worktrees/auth");
        fs::create_dir_all(&tree).expect("tree");
        fs::write(tree.join(".git"), "gitdir: elsewhere\n").expect("git file");

        let tree_state = StateStore::discover(&tree).expect("discover tree");
        assert_eq!(tree_state.root(), tree.canonicalize().expect("canon"));
        tree_state.set_active_plan(&plan).expect("set");
        let text = fs::read_to_string(tree_state.path()).expect("read");
        assert!(text.contains("../../plans/auth"));
        assert_eq!(
            tree_state.active_plan().expect("get"),
            Some(plan.canonicalize().expect("canon"))
        );

        let main_state = StateStore::at(&root);
        assert_eq!(main_state.active_plan().expect("main"), None);
    }

    #[test]
    fn unset_preserves_other_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        checkout(temp.path());
        let state = StateStore::at(temp.path());
        fs::create_dir_all(temp.path().join(".grove")).expect("dir");
        fs::write(state.path(), "other.key: keep\n").expect("seed");
        state
            .set_active_plan(&temp.path().join("plans/x"))
            .expect("set");
        assert!(state.unset().expect("unset"));
        assert!(!state.unset().expect("unset again"));
        let text = fs::read_to_string(state.path()).expect("read");
        assert!(text.contains("other.key: keep"));
        assert!(!text.contains("active_plan"));
    }

    #[test]
    fn relative_paths_walk_up() {
        assert_eq!(
            relative_to(Path::new("/a/plans/x"), Path::new("/a/.grove-worktrees/x")),
            PathBuf::from("../../plans/x")
        );
        assert_eq!(relative_to(Path::new("/a"), Path::new("/a")), PathBuf::from("."));
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    }
}
