//! Per-job side logs under `<plan>/.logs/<job stem>/`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::core::job::{Job, timestamp};
use crate::io::job_store::write_atomic;
use crate::io::process::CommandOutput;

pub const LOGS_DIR: &str = ".logs";

#[derive(Debug, Clone)]
pub struct JobLogs {
    dir: PathBuf,
}

impl JobLogs {
    pub fn new(plan_dir: &Path, job: &Job) -> Self {
        Self {
            dir: plan_dir.join(LOGS_DIR).join(job.stem()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.dir.join("prompt.md")
    }

    pub fn shell_log_path(&self) -> PathBuf {
        self.dir.join("shell.log")
    }

    pub fn response_path(&self) -> PathBuf {
        self.dir.join("response.md")
    }

    /// Persist the exact prompt sent to the LLM.
    pub fn write_prompt(&self, prompt: &str) -> Result<PathBuf> {
        let path = self.prompt_path();
        write_atomic(&path, prompt)?;
        Ok(path)
    }

    pub fn write_response(&self, response: &str) -> Result<PathBuf> {
        let path = self.response_path();
        write_atomic(&path, response)?;
        Ok(path)
    }

    /// Write a command transcript with separate stdout and stderr sections.
    pub fn write_command_log(
        &self,
        command: &str,
        output: &CommandOutput,
        at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let path = self.shell_log_path();
        write_atomic(&path, &format_command_log(command, output, at))?;
        Ok(path)
    }
}

fn format_command_log(command: &str, output: &CommandOutput, at: DateTime<Utc>) -> String {
    let mut buf = String::new();
    buf.push_str(&format!("# {}\n", timestamp(at)));
    buf.push_str(&format!("$ {}\n", command.trim()));
    let result = if output.success() {
        "ok".to_string()
    } else {
        output.failure_reason()
    };
    buf.push_str(&format!("result: {result}\n"));
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str("=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    buf.push_str(&output.truncated_notice("command"));
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf
}
