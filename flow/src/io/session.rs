//! Terminal multiplexer capability.
//!
//! A successful `new-window` does not prove the window's command is running.
//! [`SessionManager::new_window`] reports whether the window could be seen
//! right after creation, and callers that need certainty check again with
//! [`SessionManager::window_exists`].

use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Result of opening a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowLaunch {
    /// The window was listed immediately after creation.
    Verified,
    /// The multiplexer reported success but the window was not listed.
    Unverified,
}

pub trait SessionManager {
    fn has_session(&self, session: &str) -> Result<bool>;

    fn new_session(&self, session: &str, cwd: &Path) -> Result<()>;

    /// Open `window` in `session` running `command` in `cwd`.
    fn new_window(
        &self,
        session: &str,
        window: &str,
        cwd: &Path,
        command: &str,
    ) -> Result<WindowLaunch>;

    fn window_exists(&self, session: &str, window: &str) -> Result<bool>;

    /// PID of the first pane's process, if the window is alive.
    fn pane_pid(&self, session: &str, window: &str) -> Result<Option<u32>>;

    fn send_keys(&self, target: &str, text: &str) -> Result<()>;

    fn kill_session(&self, session: &str) -> Result<()>;

    /// Shell command a human can run to inspect a failed launch.
    fn diagnostic_command(&self, session: &str) -> String {
        format!("tmux list-windows -t {session}")
    }
}

/// tmux-backed sessions.
#[derive(Debug, Clone, Default)]
pub struct Tmux;

impl Tmux {
    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = %args.join(" "), "tmux");
        Command::new("tmux")
            .args(args)
            .output()
            .with_context(|| format!("spawn tmux {}", args.join(" ")))
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "tmux {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output)
    }

    fn window_names(&self, session: &str) -> Result<Vec<String>> {
        let out = self.run(&["list-windows", "-t", session, "-F", "#{window_name}"])?;
        if !out.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

impl SessionManager for Tmux {
    fn has_session(&self, session: &str) -> Result<bool> {
        Ok(self.run(&["has-session", "-t", session])?.status.success())
    }

    #[instrument(skip_all, fields(session))]
    fn new_session(&self, session: &str, cwd: &Path) -> Result<()> {
        let cwd = cwd.to_string_lossy().into_owned();
        self.run_checked(&["new-session", "-d", "-s", session, "-c", cwd.as_str()])?;
        Ok(())
    }

    #[instrument(skip_all, fields(session, window))]
    fn new_window(
        &self,
        session: &str,
        window: &str,
        cwd: &Path,
        command: &str,
    ) -> Result<WindowLaunch> {
        let target = format!("{session}:");
        let cwd = cwd.to_string_lossy().into_owned();
        self.run_checked(&[
            "new-window",
            "-t",
            target.as_str(),
            "-n",
            window,
            "-c",
            cwd.as_str(),
            command,
        ])?;
        if self.window_names(session)?.iter().any(|name| name == window) {
            Ok(WindowLaunch::Verified)
        } else {
            warn!(session, window, "new-window succeeded but window is not listed");
            Ok(WindowLaunch::Unverified)
        }
    }

    fn window_exists(&self, session: &str, window: &str) -> Result<bool> {
        Ok(self.window_names(session)?.iter().any(|name| name == window))
    }

    fn pane_pid(&self, session: &str, window: &str) -> Result<Option<u32>> {
        let target = format!("{session}:{window}");
        let out = self.run(&["display-message", "-p", "-t", target.as_str(), "#{pane_pid}"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().parse().ok())
    }

    fn send_keys(&self, target: &str, text: &str) -> Result<()> {
        self.run_checked(&["send-keys", "-t", target, text, "Enter"])?;
        Ok(())
    }

    #[instrument(skip_all, fields(session))]
    fn kill_session(&self, session: &str) -> Result<()> {
        self.run_checked(&["kill-session", "-t", session])?;
        Ok(())
    }
}

/// Session name for a worktree (`.` and `:` are not allowed by tmux).
pub fn session_name(prefix: &str, worktree: &str) -> String {
    let raw = if prefix.is_empty() {
        worktree.to_string()
    } else {
        format!("{prefix}-{worktree}")
    };
    raw.chars()
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_sanitized() {
        assert_eq!(session_name("flow", "feature-a"), "flow-feature-a");
        assert_eq!(session_name("", "v1.2:x"), "v1_2_x");
    }
}
