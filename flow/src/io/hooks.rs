//! Plan hook commands (`hooks.on_start`, `hooks.on_review`).
//!
//! A hook is a minijinja template rendered with the plan's context and run
//! through `sh -c` in the repository root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, UndefinedBehavior, context};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::io::process::{RunOptions, run_command, shell_command};

const HOOK_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const HOOK_OUTPUT_LIMIT: usize = 256 * 1024;

/// Values available to hook templates.
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub plan_name: String,
    pub plan_dir: PathBuf,
    pub note_ref: Option<String>,
    pub worktree: Option<String>,
}

pub fn render_hook(template: &str, ctx: &HookContext) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(
        template,
        context! {
            plan_name => &ctx.plan_name,
            plan_dir => ctx.plan_dir.display().to_string(),
            note_ref => ctx.note_ref.as_deref().unwrap_or_default(),
            worktree => ctx.worktree.as_deref().unwrap_or_default(),
        },
    )
    .with_context(|| format!("render hook '{template}'"))
}

/// Render and run a hook. Returns the combined output on success.
#[instrument(skip_all, fields(hook = name, plan = %ctx.plan_name))]
pub fn run_hook(name: &str, template: &str, ctx: &HookContext, repo_root: &Path) -> Result<String> {
    let script = render_hook(template, ctx)?;
    info!(script = %script, "running hook");
    let output = run_command(
        shell_command(&script, repo_root),
        &RunOptions::new(HOOK_TIMEOUT, HOOK_OUTPUT_LIMIT),
    )
    .with_context(|| format!("run {name} hook"))?;
    if !output.success() {
        warn!(reason = %output.failure_reason(), "hook failed");
        return Err(anyhow!(
            "{name} hook failed ({}): {}",
            output.failure_reason(),
            output.combined_text().trim()
        ));
    }
    Ok(output.combined_text())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HookContext {
        HookContext {
            plan_name: "auth".to_string(),
            plan_dir: PathBuf::from("/repo/plans/auth"),
            note_ref: None,
            worktree: Some("feature-auth".to_string()),
        }
    }

    #[test]
    fn renders_plan_variables() {
        let rendered =
            render_hook("check {{ plan_name }} in {{ worktree }} at {{ plan_dir }}", &ctx())
                .expect("render");
        assert_eq!(rendered, "check auth in feature-auth at /repo/plans/auth");
    }

    #[test]
    fn unknown_variable_is_an_error() {
        assert!(render_hook("echo {{ nope }}", &ctx()).is_err());
    }

    #[test]
    fn failing_hook_reports_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_hook("on_review", "echo {{ plan_name }}", &ctx(), temp.path()).expect("ok");
        assert_eq!(out.trim(), "auth");
        let err = run_hook("on_review", "echo bad; exit 3", &ctx(), temp.path()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("on_review hook failed"));
        assert!(message.contains("bad"));
    }
}
