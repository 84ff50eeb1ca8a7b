//! Flow configuration stored under `.grove/flow.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const CONFIG_RELATIVE_PATH: &str = ".grove/flow.toml";

/// Flow configuration (TOML).
///
/// Edited by humans. Every field has a default, so a missing file or a
/// partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FlowConfig {
    /// Directory holding plan directories, relative to the repository root.
    pub plans_dir: PathBuf,
    /// Directory holding standalone chats, relative to the repository root.
    pub chat_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub shell: ShellConfig,
    pub summary: SummaryConfig,
    pub context: ContextConfig,
    pub finish: FinishConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Program and leading arguments; the prompt is written to stdin.
    pub command: Vec<String>,
    /// Flag placed before the model name.
    pub model_flag: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent program and leading arguments; the prompt is passed as the last argument.
    pub command: Vec<String>,
    pub continue_flag: String,
    /// Run agents inside this container via `docker exec`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub session_prefix: String,
    pub poll_interval_ms: u64,
    /// Give up waiting on a non-interactive agent window after this long.
    pub timeout_secs: u64,
    /// Delay before re-checking a freshly launched window.
    pub verify_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SummaryConfig {
    pub enabled: bool,
    /// Receives the completed job file on stdin and prints the summary.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Rules file copied into new worktrees, relative to the repository root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_rules: Option<PathBuf>,
    /// Written when no default rules file is available.
    pub fallback_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FinishConfig {
    /// Cleans development links left behind by removed worktrees.
    pub dev_prune_command: Vec<String>,
    pub remote: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            model_flag: "-m".to_string(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            continue_flag: "--continue".to_string(),
            container: None,
            session_prefix: "flow".to_string(),
            poll_interval_ms: 2_000,
            timeout_secs: 4 * 60 * 60,
            verify_delay_ms: 500,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: vec![
                "llm".to_string(),
                "-s".to_string(),
                "Summarize the completed job below in one or two sentences.".to_string(),
            ],
            timeout_secs: 2 * 60,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_rules: None,
            fallback_pattern: "**/*".to_string(),
        }
    }
}

impl Default for FinishConfig {
    fn default() -> Self {
        Self {
            dev_prune_command: vec!["grove".to_string(), "dev".to_string(), "prune".to_string()],
            remote: "origin".to_string(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            plans_dir: PathBuf::from("plans"),
            chat_dir: PathBuf::from("chats"),
            default_model: None,
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
            shell: ShellConfig::default(),
            summary: SummaryConfig::default(),
            context: ContextConfig::default(),
            finish: FinishConfig::default(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plans_dir.as_os_str().is_empty() {
            return Err(anyhow!("plans_dir must not be empty"));
        }
        if self.llm.command.first().is_none_or(|c| c.trim().is_empty()) {
            return Err(anyhow!("llm.command must be a non-empty array"));
        }
        if self.agent.command.first().is_none_or(|c| c.trim().is_empty()) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.llm.timeout_secs == 0 || self.shell.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs and shell.timeout_secs must be > 0"));
        }
        if self.llm.output_limit_bytes == 0 || self.shell.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.agent.poll_interval_ms == 0 {
            return Err(anyhow!("agent.poll_interval_ms must be > 0"));
        }
        if self.summary.enabled && self.summary.command.is_empty() {
            return Err(anyhow!("summary.command must be set when summary is enabled"));
        }
        Ok(())
    }

    /// Absolute plans directory for a repository root.
    pub fn plans_root(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.plans_dir)
    }
}

pub fn config_path(repo_root: &Path) -> PathBuf {
    repo_root.join(CONFIG_RELATIVE_PATH)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FlowConfig::default()`.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    if !path.exists() {
        let cfg = FlowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FlowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &FlowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::job_store::write_atomic(path, &buf)
}
