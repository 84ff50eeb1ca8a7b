//! Jobs generated from LLM output.
//!
//! The primary format is a run of frontmatter-delimited documents. A JSON
//! `{"jobs": [...]}` document is also accepted and checked against
//! [`JOBS_SCHEMA`] before use.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::frontmatter::{self, get_str, get_str_list};
use crate::core::job::{Job, OutputSpec};
use crate::core::naming::{job_filename, unique_job_id};
use crate::core::types::{JobStatus, JobType, OutputMode};

static KEY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*:").expect("key line regex"));

pub const JOBS_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "type": "object",
  "required": ["jobs"],
  "properties": {
    "jobs": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["title", "type", "prompt"],
        "properties": {
          "title": { "type": "string", "minLength": 1 },
          "type": { "enum": ["shell", "oneshot", "agent", "interactive_agent", "chat"] },
          "depends_on": { "type": "array", "items": { "type": "string" } },
          "prompt": { "type": "string" },
          "worktree": { "type": "string" },
          "model": { "type": "string" },
          "output_type": { "enum": ["append", "file", "none", "generate_jobs"] }
        }
      }
    }
  }
}"#;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("response contains no job documents")]
    Empty,
    #[error("generated job {index}: {message}")]
    Invalid { index: usize, message: String },
    #[error("generated jobs JSON is invalid: {0}")]
    Json(String),
    #[error("generated jobs failed schema validation: {0}")]
    Schema(String),
}

/// A job definition produced by an LLM, before it has a filename.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedJob {
    pub title: String,
    pub job_type: JobType,
    pub depends_on: Vec<String>,
    pub worktree: Option<String>,
    pub model: Option<String>,
    pub output_mode: Option<OutputMode>,
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
struct JsonJobs {
    jobs: Vec<JsonJob>,
}

#[derive(Debug, Deserialize)]
struct JsonJob {
    title: String,
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    depends_on: Vec<String>,
    prompt: String,
    #[serde(default)]
    worktree: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    output_type: Option<String>,
}

/// Parse an LLM response into job definitions.
pub fn parse_response(response: &str) -> Result<Vec<GeneratedJob>, GenerationError> {
    let text = strip_code_fence(response.trim());
    let jobs = if text.starts_with('{') {
        parse_json(text)?
    } else {
        split_documents(text)
            .iter()
            .enumerate()
            .map(|(idx, doc)| parse_document(idx + 1, doc))
            .collect::<Result<Vec<_>, _>>()?
    };
    if jobs.is_empty() {
        return Err(GenerationError::Empty);
    }
    Ok(jobs)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.split_once('\n').map_or("", |(_, after)| after);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

/// Split at `---` lines that open a new frontmatter block.
fn split_documents(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut docs = Vec::new();
    let mut current: Option<String> = None;
    let mut in_header = false;
    for (idx, line) in lines.iter().enumerate() {
        let is_fence = line.trim_end() == "---";
        if is_fence && in_header {
            in_header = false;
        } else if is_fence && lines.get(idx + 1).is_some_and(|next| KEY_LINE.is_match(next)) {
            if let Some(doc) = current.take() {
                docs.push(doc);
            }
            current = Some(String::new());
            in_header = true;
        }
        if let Some(doc) = current.as_mut() {
            doc.push_str(line);
            doc.push('\n');
        }
    }
    docs.extend(current);
    docs
}

fn parse_document(index: usize, text: &str) -> Result<GeneratedJob, GenerationError> {
    let invalid = |message: String| GenerationError::Invalid { index, message };
    let doc = frontmatter::parse(text).map_err(|err| invalid(err.to_string()))?;
    let map = doc
        .frontmatter
        .ok_or_else(|| invalid("missing frontmatter".to_string()))?;
    let title = get_str(&map, "title")
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .ok_or_else(|| invalid("missing title".to_string()))?
        .to_string();
    let job_type = match get_str(&map, "type") {
        Some(raw) => raw
            .parse::<JobType>()
            .map_err(|err| invalid(err.to_string()))?,
        None => JobType::Oneshot,
    };
    let output_mode = match map.get("output") {
        Some(serde_yaml::Value::Mapping(inner)) => get_str(inner, "type").map(parse_output_mode),
        Some(serde_yaml::Value::String(mode)) => Some(parse_output_mode(mode)),
        _ => None,
    }
    .transpose()
    .map_err(invalid)?;
    Ok(GeneratedJob {
        title,
        job_type,
        depends_on: get_str_list(&map, "depends_on"),
        worktree: get_str(&map, "worktree").map(str::to_string),
        model: get_str(&map, "model").map(str::to_string),
        output_mode,
        prompt: doc.body.trim().to_string(),
    })
}

fn parse_json(text: &str) -> Result<Vec<GeneratedJob>, GenerationError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| GenerationError::Json(err.to_string()))?;
    let schema: Value =
        serde_json::from_str(JOBS_SCHEMA).map_err(|err| GenerationError::Json(err.to_string()))?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| GenerationError::Schema(err.to_string()))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(GenerationError::Schema(messages.join("; ")));
    }
    let parsed: JsonJobs =
        serde_json::from_value(value).map_err(|err| GenerationError::Json(err.to_string()))?;
    parsed
        .jobs
        .into_iter()
        .enumerate()
        .map(|(idx, job)| {
            let invalid = |message: String| GenerationError::Invalid {
                index: idx + 1,
                message,
            };
            Ok(GeneratedJob {
                job_type: job
                    .job_type
                    .parse::<JobType>()
                    .map_err(|err| invalid(err.to_string()))?,
                output_mode: job
                    .output_type
                    .as_deref()
                    .map(parse_output_mode)
                    .transpose()
                    .map_err(invalid)?,
                title: job.title,
                depends_on: job.depends_on,
                worktree: job.worktree.filter(|w| !w.is_empty()),
                model: job.model,
                prompt: job.prompt,
            })
        })
        .collect()
}

fn parse_output_mode(raw: &str) -> Result<OutputMode, String> {
    match raw {
        "append" => Ok(OutputMode::Append),
        "file" | "commit" => Ok(OutputMode::File),
        "none" => Ok(OutputMode::None),
        "generate_jobs" => Ok(OutputMode::GenerateJobs),
        other => Err(format!("unknown output type '{other}'")),
    }
}

/// Inputs for turning definitions into job documents.
#[derive(Debug, Clone)]
pub struct Materialize<'a> {
    pub next_number: u32,
    pub existing_ids: &'a HashSet<String>,
    /// Worktree for definitions that do not name one.
    pub default_worktree: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Assign filenames and ids, rewriting dependencies on generated titles.
///
/// A `depends_on` entry that names a generated title (or its id) is mapped
/// to that job's new filename; other entries are kept as written so they can
/// refer to existing jobs.
pub fn materialize(
    generated: &[GeneratedJob],
    opts: &Materialize<'_>,
) -> Result<Vec<Job>, GenerationError> {
    let mut ids = opts.existing_ids.clone();
    let mut by_title: HashMap<String, String> = HashMap::new();
    let mut assigned = Vec::with_capacity(generated.len());
    for (idx, def) in generated.iter().enumerate() {
        let number = opts.next_number + idx as u32;
        let filename = job_filename(number, &def.title).map_err(|err| GenerationError::Invalid {
            index: idx + 1,
            message: err.to_string(),
        })?;
        let id = unique_job_id(&def.title, &ids);
        ids.insert(id.clone());
        by_title.insert(def.title.clone(), filename.clone());
        by_title.insert(id.clone(), filename.clone());
        assigned.push((filename, id));
    }

    let mut jobs = Vec::with_capacity(generated.len());
    for (def, (filename, id)) in generated.iter().zip(assigned) {
        let mut job = Job::new(&filename, &id, &def.title, def.job_type);
        job.status = if def.job_type == JobType::Chat {
            JobStatus::PendingUser
        } else {
            JobStatus::Pending
        };
        job.depends_on = def
            .depends_on
            .iter()
            .map(|dep| by_title.get(dep).cloned().unwrap_or_else(|| dep.clone()))
            .collect();
        job.worktree = def
            .worktree
            .clone()
            .or_else(|| opts.default_worktree.map(str::to_string));
        job.model = def.model.clone();
        if let Some(mode) = def.output_mode {
            job.output = OutputSpec { mode, path: None };
        }
        job.body = format!("{}\n", def.prompt.trim());
        job.touch(opts.now);
        jobs.push(job);
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RESPONSE: &str = "Here is the plan.\n\n---\ntitle: Write schema\ntype: oneshot\n---\nDesign the tables.\n\n---\n\nNot a new doc.\n---\ntitle: Implement\ntype: agent\ndepends_on:\n  - Write schema\n---\nBuild it.\n";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("time")
    }

    #[test]
    fn splits_frontmatter_documents() {
        let jobs = parse_response(RESPONSE).expect("parse");
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].title, "Write schema");
        assert!(jobs[0].prompt.contains("Not a new doc."));
        assert_eq!(jobs[1].job_type, JobType::Agent);
        assert_eq!(jobs[1].depends_on, vec!["Write schema"]);
    }

    #[test]
    fn type_defaults_to_oneshot() {
        let jobs = parse_response("---\ntitle: Ask\n---\nquestion\n").expect("parse");
        assert_eq!(jobs[0].job_type, JobType::Oneshot);
    }

    #[test]
    fn fenced_response_is_unwrapped() {
        let jobs = parse_response("```markdown\n---\ntitle: A\n---\nx\n```").expect("parse");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].prompt, "x");
    }

    #[test]
    fn prose_only_is_empty() {
        let err = parse_response("I could not come up with jobs.").unwrap_err();
        assert!(matches!(err, GenerationError::Empty));
    }

    #[test]
    fn json_jobs_are_schema_checked() {
        let ok = r#"{"jobs": [{"title": "Lint", "type": "shell", "prompt": "make lint"}]}"#;
        let jobs = parse_response(ok).expect("parse");
        assert_eq!(jobs[0].job_type, JobType::Shell);

        let bad = r#"{"jobs": [{"title": "Lint", "type": "robot", "prompt": "x"}]}"#;
        assert!(matches!(
            parse_response(bad).unwrap_err(),
            GenerationError::Schema(_)
        ));
    }

    #[test]
    fn materialize_maps_titles_to_filenames() {
        let defs = parse_response(RESPONSE).expect("parse");
        let existing = HashSet::from(["write-schema".to_string()]);
        let jobs = materialize(
            &defs,
            &Materialize {
                next_number: 3,
                existing_ids: &existing,
                default_worktree: Some("feature-x"),
                now: now(),
            },
        )
        .expect("materialize");
        assert_eq!(jobs[0].filename, "03-write-schema.md");
        assert_eq!(jobs[0].id, "write-schema-2");
        assert_eq!(jobs[1].filename, "04-implement.md");
        assert_eq!(jobs[1].depends_on, vec!["03-write-schema.md"]);
        assert_eq!(jobs[1].worktree.as_deref(), Some("feature-x"));
        assert_eq!(jobs[1].status, JobStatus::Pending);
    }
}
