//! Workspace discovery: which repositories make up an ecosystem.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::git::is_checkout;

/// One `[submodule]` entry of `.gitmodules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    pub name: String,
    pub path: String,
    pub url: Option<String>,
}

/// A repository that is part of the local ecosystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownRepo {
    pub name: String,
    /// Checkout that linked worktrees are created from.
    pub path: PathBuf,
}

pub trait WorkspaceDiscovery {
    /// Repositories known locally for the ecosystem rooted at `root`.
    fn known_repos(&self, root: &Path) -> Result<Vec<KnownRepo>>;

    fn find(&self, root: &Path, name: &str) -> Result<Option<KnownRepo>> {
        Ok(self
            .known_repos(root)?
            .into_iter()
            .find(|repo| repo.name == name))
    }
}

/// Treats every initialized submodule of the main checkout as known.
#[derive(Debug, Clone, Default)]
pub struct SubmoduleDiscovery;

impl WorkspaceDiscovery for SubmoduleDiscovery {
    fn known_repos(&self, root: &Path) -> Result<Vec<KnownRepo>> {
        let repos: Vec<KnownRepo> = read_gitmodules(root)?
            .into_iter()
            .filter(|sub| is_checkout(&root.join(&sub.path)))
            .map(|sub| KnownRepo {
                path: root.join(&sub.path),
                name: sub.name,
            })
            .collect();
        debug!(count = repos.len(), root = %root.display(), "discovered repositories");
        Ok(repos)
    }
}

/// Read `<root>/.gitmodules`; a missing file means no submodules.
pub fn read_gitmodules(root: &Path) -> Result<Vec<Submodule>> {
    let path = root.join(".gitmodules");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_gitmodules(&text))
}

pub fn parse_gitmodules(text: &str) -> Vec<Submodule> {
    let mut subs = Vec::new();
    let mut current: Option<Submodule> = None;
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("[submodule") {
            subs.extend(current.take().filter(|sub| !sub.path.is_empty()));
            let name = rest.trim().trim_end_matches(']').trim().trim_matches('"');
            current = Some(Submodule {
                name: name.to_string(),
                path: String::new(),
                url: None,
            });
        } else if let Some(sub) = current.as_mut()
            && let Some((key, value)) = line.split_once('=')
        {
            match key.trim() {
                "path" => sub.path = value.trim().to_string(),
                "url" => sub.url = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    subs.extend(current.filter(|sub| !sub.path.is_empty()));
    subs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gitmodules_entries() {
        let text = "[submodule \"core\"]\n\tpath = libs/core\n\turl = ../core\n[submodule \"cli\"]\n\tpath = cli\n\turl = https://example.com/cli.git\n";
        let subs = parse_gitmodules(text);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].name, "core");
        assert_eq!(subs[0].path, "libs/core");
        assert_eq!(subs[1].url.as_deref(), Some("https://example.com/cli.git"));
    }

    #[test]
    fn missing_gitmodules_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_gitmodules(temp.path()).expect("read").is_empty());
        assert!(
            SubmoduleDiscovery
                .known_repos(temp.path())
                .expect("discover")
                .is_empty()
        );
    }
}
