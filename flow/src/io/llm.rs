//! LLM and summarizer backends.
//!
//! Both are opaque commands: the prompt goes in on stdin and the response is
//! whatever the command prints. Tests substitute scripted implementations.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{LlmConfig, SummaryConfig};
use crate::io::process::{RunOptions, run_command};

/// One completion call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub workdir: PathBuf,
}

pub trait LlmClient {
    fn complete(&self, request: &LlmRequest) -> Result<String>;
}

/// Runs the configured LLM command.
#[derive(Debug, Clone)]
pub struct CommandLlm {
    config: LlmConfig,
}

impl CommandLlm {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }
}

impl LlmClient for CommandLlm {
    #[instrument(skip_all, fields(model = request.model.as_deref().unwrap_or("default")))]
    fn complete(&self, request: &LlmRequest) -> Result<String> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("llm.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        if let Some(model) = &request.model {
            cmd.arg(&self.config.model_flag).arg(model);
        }
        info!(program = %program, prompt_bytes = request.prompt.len(), "calling llm");
        let opts = RunOptions {
            stdin: Some(request.prompt.as_bytes()),
            ..RunOptions::new(
                Duration::from_secs(self.config.timeout_secs),
                self.config.output_limit_bytes,
            )
        };
        let output = run_command(cmd, &opts).with_context(|| format!("run {program}"))?;
        if !output.success() {
            warn!(reason = %output.failure_reason(), "llm command failed");
            return Err(anyhow!(
                "{program} failed ({}): {}",
                output.failure_reason(),
                output.stderr_text().trim()
            ));
        }
        debug!(response_bytes = output.stdout.len(), "llm responded");
        Ok(output.stdout_text())
    }
}

pub trait Summarizer {
    /// Summarize a completed job document.
    fn summarize(&self, content: &str) -> Result<String>;
}

/// Runs the configured summary command.
#[derive(Debug, Clone)]
pub struct CommandSummarizer {
    config: SummaryConfig,
    workdir: PathBuf,
}

impl CommandSummarizer {
    pub fn new(config: SummaryConfig, workdir: PathBuf) -> Self {
        Self { config, workdir }
    }
}

impl Summarizer for CommandSummarizer {
    #[instrument(skip_all)]
    fn summarize(&self, content: &str) -> Result<String> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("summary.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let opts = RunOptions {
            stdin: Some(content.as_bytes()),
            ..RunOptions::new(Duration::from_secs(self.config.timeout_secs), 64 * 1024)
        };
        let output = run_command(cmd, &opts).with_context(|| format!("run {program}"))?;
        if !output.success() {
            return Err(anyhow!(
                "summary command failed ({}): {}",
                output.failure_reason(),
                output.stderr_text().trim()
            ));
        }
        Ok(output.stdout_text().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &[&str]) -> LlmConfig {
        LlmConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn command_llm_pipes_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let llm = CommandLlm::new(config(&["sh", "-c", "printf 'got: '; cat"]));
        let response = llm
            .complete(&LlmRequest {
                prompt: "hello".to_string(),
                model: None,
                workdir: temp.path().to_path_buf(),
            })
            .expect("complete");
        assert_eq!(response, "got: hello");
    }

    #[test]
    fn command_llm_reports_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let llm = CommandLlm::new(config(&["sh", "-c", "echo boom >&2; exit 2"]));
        let err = llm
            .complete(&LlmRequest {
                prompt: String::new(),
                model: None,
                workdir: temp.path().to_path_buf(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("exit code 2"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn summarizer_trims_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let summarizer = CommandSummarizer::new(
            SummaryConfig {
                enabled: true,
                command: vec!["sh".to_string(), "-c".to_string(), "echo '  short  '".to_string()],
                timeout_secs: 5,
            },
            temp.path().to_path_buf(),
        );
        assert_eq!(summarizer.summarize("doc").expect("summary"), "short");
    }
}
