//! Plan-level configuration (`.grove-plan.yml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::PlanStatus;
use crate::io::job_store::write_atomic;

pub const PLAN_CONFIG_FILE: &str = ".grove-plan.yml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    /// Ecosystem allow-list; empty means every repository.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Hooks::is_empty")]
    pub hooks: Hooks,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_ref: Option<String>,
    /// Keys this version does not know about, written back untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Hooks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_review: Option<String>,
}

impl Hooks {
    pub fn is_empty(&self) -> bool {
        self.on_start.is_none() && self.on_review.is_none()
    }
}

impl PlanConfig {
    pub fn has_review_hook(&self) -> bool {
        self.hooks
            .on_review
            .as_deref()
            .is_some_and(|hook| !hook.trim().is_empty())
    }

    pub fn repo_allowed(&self, repo: &str) -> bool {
        self.repos.is_empty() || self.repos.iter().any(|r| r == repo)
    }
}

pub fn plan_config_path(plan_dir: &Path) -> PathBuf {
    plan_dir.join(PLAN_CONFIG_FILE)
}

/// Load a plan's config; a missing file yields the defaults.
pub fn load_plan_config(plan_dir: &Path) -> Result<PlanConfig> {
    let path = plan_config_path(plan_dir);
    if !path.exists() {
        return Ok(PlanConfig::default());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(PlanConfig::default());
    }
    serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

pub fn write_plan_config(plan_dir: &Path, config: &PlanConfig) -> Result<()> {
    let text = serde_yaml::to_string(config).context("serialize plan config")?;
    write_atomic(&plan_config_path(plan_dir), &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_plan_config(temp.path()).expect("load");
        assert_eq!(cfg, PlanConfig::default());
        assert_eq!(cfg.status, PlanStatus::Active);
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            plan_config_path(temp.path()),
            "model: gpt-x\nrepos: [core]\nhooks:\n  on_review: make lint\nowner: sam\n",
        )
        .expect("write");
        let mut cfg = load_plan_config(temp.path()).expect("load");
        assert!(cfg.has_review_hook());
        assert!(cfg.repo_allowed("core"));
        assert!(!cfg.repo_allowed("cli"));
        cfg.status = PlanStatus::Review;
        write_plan_config(temp.path(), &cfg).expect("rewrite");

        let text = fs::read_to_string(plan_config_path(temp.path())).expect("read");
        assert!(text.contains("owner: sam"));
        assert!(text.contains("status: review"));
        let again = load_plan_config(temp.path()).expect("reload");
        assert_eq!(again, cfg);
    }

    #[test]
    fn blank_review_hook_does_not_gate() {
        let cfg = PlanConfig {
            hooks: Hooks {
                on_start: None,
                on_review: Some("  ".to_string()),
            },
            ..PlanConfig::default()
        };
        assert!(!cfg.has_review_hook());
        assert!(cfg.repo_allowed("anything"));
    }
}
