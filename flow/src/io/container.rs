//! Container pre-flight checks for agent jobs.

use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

pub trait ContainerProbe {
    /// Whether `container` exists and is running.
    fn is_running(&self, container: &str) -> Result<bool>;
}

/// `docker inspect` based probe.
#[derive(Debug, Clone, Default)]
pub struct Docker;

impl ContainerProbe for Docker {
    fn is_running(&self, container: &str) -> Result<bool> {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", container])
            .output()
            .context("spawn docker inspect")?;
        let running =
            output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true";
        debug!(container, running, "container probe");
        Ok(running)
    }
}

/// Wrap `command` so it runs inside `container` at `workdir`.
pub fn exec_command(container: &str, workdir: &str, command: &str) -> String {
    format!(
        "docker exec -it -w {} {} sh -c {}",
        shell_quote(workdir),
        shell_quote(container),
        shell_quote(command)
    )
}

/// Single-quote `text` for `sh`.
pub fn shell_quote(text: &str) -> String {
    if !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return text.to_string();
    }
    format!("'{}'", text.replace('\'', r"'\''"))
}
