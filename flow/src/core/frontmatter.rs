//! Frontmatter codec for markdown documents.
//!
//! A document is an optional YAML block fenced by `---` lines followed by a
//! freeform body. Rendering rewrites only the fenced block and reproduces the
//! body byte for byte.

use serde_yaml::{Mapping, Value};
use thiserror::Error;

const FENCE: &str = "---";

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("frontmatter block is not closed (missing trailing '---')")]
    Unterminated,
    #[error("frontmatter is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("frontmatter must be a YAML mapping")]
    NotAMapping,
}

/// A parsed markdown document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// `None` when the text had no frontmatter block at all.
    pub frontmatter: Option<Mapping>,
    pub body: String,
}

/// Split text into the raw YAML block and the body.
///
/// Returns `Ok((None, text))` when the text does not start with a fence.
pub fn split(text: &str) -> Result<(Option<&str>, &str), FrontmatterError> {
    let Some(rest) = strip_fence_line(text) else {
        return Ok((None, text));
    };
    let mut offset = 0usize;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == FENCE {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((Some(yaml), body));
        }
        offset += line.len();
    }
    Err(FrontmatterError::Unterminated)
}

fn strip_fence_line(text: &str) -> Option<&str> {
    text.strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
}

/// Parse a document.
pub fn parse(text: &str) -> Result<Document, FrontmatterError> {
    let (yaml, body) = split(text)?;
    let frontmatter = match yaml {
        None => None,
        Some(raw) if raw.trim().is_empty() => Some(Mapping::new()),
        Some(raw) => match serde_yaml::from_str::<Value>(raw)? {
            Value::Mapping(map) => Some(map),
            Value::Null => Some(Mapping::new()),
            _ => return Err(FrontmatterError::NotAMapping),
        },
    };
    Ok(Document {
        frontmatter,
        body: body.to_string(),
    })
}

/// Render a frontmatter mapping and body back into document text.
pub fn render(frontmatter: &Mapping, body: &str) -> Result<String, FrontmatterError> {
    let mut out = String::from("---\n");
    if !frontmatter.is_empty() {
        let yaml = serde_yaml::to_string(frontmatter)?;
        out.push_str(&yaml);
        if !yaml.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str("---\n");
    out.push_str(body);
    Ok(out)
}

/// Read a string-valued key.
pub fn get_str<'a>(map: &'a Mapping, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

/// Read a key that may be a single string or a list of strings.
pub fn get_str_list(map: &Mapping, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::String(single)) if !single.trim().is_empty() => vec![single.clone()],
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
