//! Typed job documents.
//!
//! A job is a markdown file whose frontmatter carries a `type`. Files without
//! a `type` are notes and are not jobs. Unknown frontmatter keys are kept in
//! [`Job::extra`] and written back after the known keys.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::core::frontmatter::{self, Document, FrontmatterError, get_str, get_str_list};
use crate::core::naming::validate_worktree_name;
use crate::core::output::{format_duration, prompt_part};
use crate::core::types::{JobStatus, JobType, OutputMode, TransitionError, check_transition};

/// Known keys in their canonical write order.
const KNOWN_KEYS: &[&str] = &[
    "id",
    "title",
    "status",
    "type",
    "model",
    "depends_on",
    "prompt_source",
    "source_files",
    "worktree",
    "repository",
    "rules_file",
    "agent_continue",
    "prepend_dependencies",
    "output",
    "summary",
    "created_at",
    "updated_at",
    "started_at",
    "completed_at",
    "duration",
];

/// Structural problems with a job document.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{file}: missing required field '{field}'")]
    MissingField { file: String, field: &'static str },
    #[error("{file}: {message}")]
    Malformed { file: String, message: String },
    #[error("{file}: {source}")]
    Frontmatter {
        file: String,
        #[source]
        source: FrontmatterError,
    },
    #[error("duplicate job id '{id}' in {first} and {second}")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },
    #[error("job not found: {0}")]
    NotFound(String),
}

/// Per-type validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Output routing for a job (`output:` in frontmatter).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputSpec {
    pub mode: OutputMode,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// File name inside the plan directory (not persisted in frontmatter).
    pub filename: String,
    pub id: String,
    pub title: String,
    pub status: JobStatus,
    pub job_type: JobType,
    pub model: Option<String>,
    pub depends_on: Vec<String>,
    pub prompt_source: Vec<String>,
    pub worktree: Option<String>,
    /// Sub-repository to scope execution to inside an ecosystem worktree.
    pub repository: Option<String>,
    pub rules_file: Option<String>,
    pub agent_continue: bool,
    pub prepend_dependencies: bool,
    pub output: OutputSpec,
    pub summary: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration: Option<String>,
    pub extra: Mapping,
    pub body: String,
}

impl Job {
    /// A fresh pending job with no optional fields set.
    pub fn new(filename: &str, id: &str, title: &str, job_type: JobType) -> Self {
        Self {
            filename: filename.to_string(),
            id: id.to_string(),
            title: title.to_string(),
            status: JobStatus::Pending,
            job_type,
            model: None,
            depends_on: Vec::new(),
            prompt_source: Vec::new(),
            worktree: None,
            repository: None,
            rules_file: None,
            agent_continue: false,
            prepend_dependencies: false,
            output: OutputSpec::default(),
            summary: None,
            created_at: None,
            updated_at: None,
            started_at: None,
            completed_at: None,
            duration: None,
            extra: Mapping::new(),
            body: String::new(),
        }
    }

    /// Parse job text. Returns `Ok(None)` for markdown files that are not jobs.
    pub fn parse(filename: &str, text: &str) -> Result<Option<Job>, JobError> {
        let doc = frontmatter::parse(text).map_err(|source| JobError::Frontmatter {
            file: filename.to_string(),
            source,
        })?;
        Job::from_document(filename, doc)
    }

    pub fn from_document(filename: &str, doc: Document) -> Result<Option<Job>, JobError> {
        let Some(map) = doc.frontmatter else {
            return Ok(None);
        };
        let Some(type_raw) = get_str(&map, "type") else {
            return Ok(None);
        };
        let malformed = |message: String| JobError::Malformed {
            file: filename.to_string(),
            message,
        };
        let job_type = type_raw
            .parse::<JobType>()
            .map_err(|err| malformed(err.to_string()))?;
        let id = required(&map, filename, "id")?;
        let title = required(&map, filename, "title")?;
        let status = required(&map, filename, "status")?
            .parse::<JobStatus>()
            .map_err(|err| malformed(err.to_string()))?;

        let mut prompt_source = get_str_list(&map, "prompt_source");
        prompt_source.extend(get_str_list(&map, "source_files"));

        let extra = map
            .iter()
            .filter(|(key, _)| !key.as_str().is_some_and(|k| KNOWN_KEYS.contains(&k)))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Some(Job {
            filename: filename.to_string(),
            id,
            title,
            status,
            job_type,
            model: optional(&map, "model"),
            depends_on: get_str_list(&map, "depends_on"),
            prompt_source,
            worktree: optional(&map, "worktree"),
            repository: optional(&map, "repository"),
            rules_file: optional(&map, "rules_file"),
            agent_continue: get_bool(&map, "agent_continue"),
            prepend_dependencies: get_bool(&map, "prepend_dependencies"),
            output: parse_output(&map).map_err(malformed)?,
            summary: optional(&map, "summary"),
            created_at: optional(&map, "created_at"),
            updated_at: optional(&map, "updated_at"),
            started_at: optional(&map, "started_at"),
            completed_at: optional(&map, "completed_at"),
            duration: optional(&map, "duration"),
            extra,
            body: doc.body,
        }))
    }

    /// Frontmatter mapping in canonical key order followed by unknown keys.
    pub fn to_frontmatter(&self) -> Mapping {
        let mut map = Mapping::new();
        put(&mut map, "id", Some(&self.id));
        put(&mut map, "title", Some(&self.title));
        put(&mut map, "status", Some(self.status.as_str()));
        put(&mut map, "type", Some(self.job_type.as_str()));
        put(&mut map, "model", self.model.as_deref());
        put_list(&mut map, "depends_on", &self.depends_on);
        put_list(&mut map, "prompt_source", &self.prompt_source);
        put(&mut map, "worktree", self.worktree.as_deref());
        put(&mut map, "repository", self.repository.as_deref());
        put(&mut map, "rules_file", self.rules_file.as_deref());
        if self.agent_continue {
            map.insert("agent_continue".into(), Value::Bool(true));
        }
        if self.prepend_dependencies {
            map.insert("prepend_dependencies".into(), Value::Bool(true));
        }
        if let Some(output) = render_output(&self.output) {
            map.insert("output".into(), output);
        }
        put(&mut map, "summary", self.summary.as_deref());
        put(&mut map, "created_at", self.created_at.as_deref());
        put(&mut map, "updated_at", self.updated_at.as_deref());
        put(&mut map, "started_at", self.started_at.as_deref());
        put(&mut map, "completed_at", self.completed_at.as_deref());
        put(&mut map, "duration", self.duration.as_deref());
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        map
    }

    pub fn to_text(&self) -> Result<String, FrontmatterError> {
        frontmatter::render(&self.to_frontmatter(), &self.body)
    }

    /// Body text without any appended output section.
    pub fn prompt(&self) -> &str {
        prompt_part(&self.body).trim()
    }

    /// Effective output mode; `type: generate_jobs` implies it.
    pub fn output_mode(&self) -> OutputMode {
        if self.job_type == JobType::GenerateJobs {
            OutputMode::GenerateJobs
        } else {
            self.output.mode
        }
    }

    /// File stem used for logs, lock files and session windows.
    pub fn stem(&self) -> &str {
        self.filename.strip_suffix(".md").unwrap_or(&self.filename)
    }

    pub fn is_interactive(&self) -> bool {
        self.job_type == JobType::InteractiveAgent
    }

    /// Move to `to`, stamping timestamps.
    ///
    /// `running` records `started_at`. Terminal statuses record
    /// `completed_at` and the elapsed `duration` since `started_at`.
    pub fn set_status(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        check_transition(self.status, to)?;
        let stamp = timestamp(now);
        self.status = to;
        self.updated_at = Some(stamp.clone());
        if to == JobStatus::Running {
            self.started_at = Some(stamp);
            self.completed_at = None;
            self.duration = None;
        } else if to.is_terminal() {
            self.duration = self
                .started_at
                .as_deref()
                .and_then(|started| DateTime::parse_from_rfc3339(started).ok())
                .map(|started| format_duration(now - started.with_timezone(&Utc)));
            self.completed_at = Some(stamp);
        }
        Ok(())
    }

    /// Stamp `updated_at` (and `created_at` when unset).
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let stamp = timestamp(now);
        if self.created_at.is_none() {
            self.created_at = Some(stamp.clone());
        }
        self.updated_at = Some(stamp);
    }

    /// Per-type checks that must pass before the job is launched.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push(invalid("id", "must not be empty"));
        }
        if self.title.trim().is_empty() {
            errors.push(invalid("title", "must not be empty"));
        }
        if let Some(worktree) = &self.worktree
            && let Err(err) = validate_worktree_name(worktree)
        {
            errors.push(invalid("worktree", &err.to_string()));
        }
        if self
            .depends_on
            .iter()
            .any(|dep| dep == &self.filename || dep == &self.id)
        {
            errors.push(invalid("depends_on", "a job cannot depend on itself"));
        }
        match self.job_type {
            JobType::Shell => {
                if self.prompt().is_empty() {
                    errors.push(invalid("body", "shell job has no command to run"));
                }
            }
            JobType::Agent | JobType::InteractiveAgent => {
                if self.worktree.as_deref().is_none_or(|w| w.trim().is_empty()) {
                    errors.push(invalid(
                        "worktree",
                        &format!("{} jobs require a worktree", self.job_type),
                    ));
                }
            }
            JobType::Oneshot | JobType::GenerateJobs => {
                if self.prompt().is_empty() && self.prompt_source.is_empty() {
                    errors.push(invalid("body", "oneshot job has no prompt or prompt_source"));
                }
            }
            JobType::Chat => {
                if self.prompt().is_empty() {
                    errors.push(invalid("body", "chat job has no conversation"));
                }
            }
        }
        if self.output.mode == OutputMode::File && self.output.path.is_none() {
            errors.push(invalid("output", "file output requires a path"));
        }
        errors
    }
}

/// RFC 3339 timestamp with second precision.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn invalid(field: &'static str, message: &str) -> ValidationError {
    ValidationError {
        field,
        message: message.to_string(),
    }
}

fn required(map: &Mapping, file: &str, field: &'static str) -> Result<String, JobError> {
    match optional(map, field) {
        Some(value) => Ok(value),
        None => Err(JobError::MissingField {
            file: file.to_string(),
            field,
        }),
    }
}

fn optional(map: &Mapping, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn get_bool(map: &Mapping, key: &str) -> bool {
    match map.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

fn parse_output(map: &Mapping) -> Result<OutputSpec, String> {
    let (mode_raw, path) = match map.get("output") {
        None | Some(Value::Null) => return Ok(OutputSpec::default()),
        Some(Value::String(mode)) => (mode.clone(), None),
        Some(Value::Mapping(inner)) => (
            get_str(inner, "type").unwrap_or("append").to_string(),
            get_str(inner, "path").map(str::to_string),
        ),
        Some(_) => return Err("output must be a string or a mapping".to_string()),
    };
    let mode = match mode_raw.as_str() {
        "append" | "" => OutputMode::Append,
        "file" | "commit" => OutputMode::File,
        "none" => OutputMode::None,
        "generate_jobs" => OutputMode::GenerateJobs,
        other => return Err(format!("unknown output type '{other}'")),
    };
    Ok(OutputSpec { mode, path })
}

fn render_output(spec: &OutputSpec) -> Option<Value> {
    let mode = match spec.mode {
        OutputMode::Append if spec.path.is_none() => return None,
        OutputMode::Append => "append",
        OutputMode::File => "file",
        OutputMode::None => "none",
        OutputMode::GenerateJobs => "generate_jobs",
    };
    let mut inner = Mapping::new();
    inner.insert("type".into(), Value::String(mode.to_string()));
    if let Some(path) = &spec.path {
        inner.insert("path".into(), Value::String(path.clone()));
    }
    Some(Value::Mapping(inner))
}

fn put(map: &mut Mapping, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        map.insert(key.into(), Value::String(value.to_string()));
    }
}

fn put_list(map: &mut Mapping, key: &str, values: &[String]) {
    if !values.is_empty() {
        let items = values.iter().cloned().map(Value::String).collect();
        map.insert(key.into(), Value::Sequence(items));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SHELL_JOB: &str = "---\nid: build\ntitle: Build\nstatus: pending\ntype: shell\ndepends_on:\n  - 01-setup.md\nowner: ops\n---\ncargo build\n";

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).single().expect("time")
    }

    #[test]
    fn parses_known_and_unknown_fields() {
        let job = Job::parse("02-build.md", SHELL_JOB).expect("parse").expect("job");
        assert_eq!(job.id, "build");
        assert_eq!(job.job_type, JobType::Shell);
        assert_eq!(job.depends_on, vec!["01-setup.md"]);
        assert_eq!(job.prompt(), "cargo build");
        assert_eq!(get_str(&job.extra, "owner"), Some("ops"));
    }

    #[test]
    fn file_without_type_is_not_a_job() {
        let parsed = Job::parse("README.md", "---\ntitle: Notes\n---\nhello\n").expect("parse");
        assert!(parsed.is_none());
        assert!(Job::parse("plain.md", "no frontmatter").expect("parse").is_none());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let err = Job::parse("x.md", "---\ntype: shell\ntitle: X\nstatus: pending\n---\n")
            .unwrap_err();
        assert!(matches!(err, JobError::MissingField { field: "id", .. }));
    }

    #[test]
    fn unknown_status_is_malformed() {
        let err = Job::parse("x.md", "---\nid: x\ntitle: X\nstatus: done\ntype: shell\n---\n")
            .unwrap_err();
        assert!(err.to_string().contains("unknown job status 'done'"));
    }

    #[test]
    fn rewrite_preserves_body_and_extra_keys() {
        let mut job = Job::parse("02-build.md", SHELL_JOB).expect("parse").expect("job");
        job.status = JobStatus::Running;
        let text = job.to_text().expect("render");
        assert!(text.ends_with("---\ncargo build\n"));
        assert!(text.contains("status: running"));
        assert!(text.contains("owner: ops"));
        let reparsed = Job::parse("02-build.md", &text).expect("parse").expect("job");
        assert_eq!(reparsed.status, JobStatus::Running);
        assert_eq!(reparsed.extra, job.extra);
    }

    #[test]
    fn source_files_alias_merges_into_prompt_source() {
        let text = "---\nid: q\ntitle: Q\nstatus: pending\ntype: oneshot\nsource_files:\n  - src/lib.rs\n---\nsummarize\n";
        let job = Job::parse("01-q.md", text).expect("parse").expect("job");
        assert_eq!(job.prompt_source, vec!["src/lib.rs"]);
    }

    #[test]
    fn status_changes_stamp_times() {
        let mut job = Job::new("01-a.md", "a", "A", JobType::Shell);
        job.set_status(JobStatus::Running, at(10, 0, 0)).expect("run");
        assert_eq!(job.started_at.as_deref(), Some("2026-03-01T10:00:00Z"));
        job.set_status(JobStatus::Completed, at(10, 1, 30)).expect("complete");
        assert_eq!(job.duration.as_deref(), Some("1m30s"));
        assert_eq!(job.completed_at.as_deref(), Some("2026-03-01T10:01:30Z"));
        assert!(job.set_status(JobStatus::Pending, at(11, 0, 0)).is_err());
    }

    #[test]
    fn agent_without_worktree_fails_validation() {
        let mut job = Job::new("01-a.md", "a", "A", JobType::Agent);
        job.body = "do it".to_string();
        let errors = job.validate();
        assert!(errors.iter().any(|e| e.field == "worktree"));
        job.worktree = Some("feature-a".to_string());
        assert!(job.validate().is_empty());
    }

    #[test]
    fn shell_without_command_fails_validation() {
        let job = Job::new("01-a.md", "a", "A", JobType::Shell);
        let errors = job.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "body");
    }

    #[test]
    fn output_mapping_round_trips() {
        let text = "---\nid: g\ntitle: G\nstatus: pending\ntype: oneshot\noutput:\n  type: generate_jobs\n---\nplan it\n";
        let job = Job::parse("01-g.md", text).expect("parse").expect("job");
        assert_eq!(job.output_mode(), OutputMode::GenerateJobs);
        assert!(job.to_text().expect("render").contains("type: generate_jobs"));
    }
}
