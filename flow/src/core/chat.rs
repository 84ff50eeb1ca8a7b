//! Chat document turns.
//!
//! A chat body is a sequence of cells separated by `---` lines. The first cell
//! is the opening user message. LLM cells carry a `## LLM Response (<time>)`
//! header, optionally preceded by a `<!-- flow: {...} -->` directive comment.
//! New turns are only ever appended.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

const CELL_SEPARATOR: &str = "\n---\n";
const LLM_HEADER: &str = "## LLM Response";

static DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^<!-- flow: (.+?) -->[ \t]*\n?").expect("directive regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Llm,
}

/// Per-turn settings embedded as a JSON comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Directive {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Speaker,
    pub content: String,
    pub directive: Option<Directive>,
}

/// Split a chat body into turns. Empty cells are skipped.
pub fn parse_turns(body: &str) -> Vec<Turn> {
    let normalized = format!("\n{body}");
    normalized
        .split(CELL_SEPARATOR)
        .filter_map(parse_cell)
        .collect()
}

fn parse_cell(cell: &str) -> Option<Turn> {
    let directive = DIRECTIVE
        .captures_iter(cell)
        .filter_map(|caps| serde_json::from_str::<Directive>(&caps[1]).ok())
        .last();
    let stripped = DIRECTIVE.replace_all(cell, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix(LLM_HEADER) {
        let content = rest.split_once('\n').map_or("", |(_, after)| after);
        return Some(Turn {
            speaker: Speaker::Llm,
            content: content.trim().to_string(),
            directive,
        });
    }
    let content = trimmed
        .lines()
        .map(|line| line.strip_prefix("> ").unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n");
    Some(Turn {
        speaker: Speaker::User,
        content,
        directive,
    })
}

/// True when the last turn is from the user and awaits a response.
pub fn awaiting_llm(turns: &[Turn]) -> bool {
    turns.last().is_some_and(|turn| turn.speaker == Speaker::User)
}

/// Model requested by the latest user directive, if any.
pub fn requested_model(turns: &[Turn]) -> Option<&str> {
    turns
        .iter()
        .rev()
        .filter(|turn| turn.speaker == Speaker::User)
        .find_map(|turn| turn.directive.as_ref()?.model.as_deref())
}

/// Render the conversation as a single prompt for the LLM.
pub fn conversation_prompt(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        let label = match turn.speaker {
            Speaker::User => "User",
            Speaker::Llm => "Assistant",
        };
        let _ = write!(out, "{label}:\n{}\n\n", turn.content);
    }
    out.push_str("Assistant:\n");
    out
}

/// Append an LLM response cell followed by an empty user cell marker.
pub fn append_llm_turn(body: &str, block_id: &str, stamp: &str, response: &str) -> String {
    let mut out = body.trim_end().to_string();
    let _ = write!(
        out,
        "\n\n---\n\n<!-- flow: {{\"id\": \"{block_id}\"}} -->\n{LLM_HEADER} ({stamp})\n\n{}\n\n---\n\n",
        response.trim()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_cell_is_user() {
        let turns = parse_turns("What should we build?\n");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].speaker, Speaker::User);
        assert!(awaiting_llm(&turns));
    }

    #[test]
    fn appended_response_is_parsed_as_llm() {
        let body = append_llm_turn("Hi there\n", "a1b2c3", "2026-03-01 10:00:00", "Hello!");
        let turns = parse_turns(&body);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].speaker, Speaker::Llm);
        assert_eq!(turns[1].content, "Hello!");
        assert_eq!(
            turns[1].directive.as_ref().and_then(|d| d.id.as_deref()),
            Some("a1b2c3")
        );
        assert!(!awaiting_llm(&turns));
    }

    #[test]
    fn user_reply_after_response_awaits_llm() {
        let mut body = append_llm_turn("Hi\n", "x", "t", "Hello!");
        body.push_str("<!-- flow: {\"model\": \"big\"} -->\n> Tell me more\n");
        let turns = parse_turns(&body);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[2].content, "Tell me more");
        assert!(awaiting_llm(&turns));
        assert_eq!(requested_model(&turns), Some("big"));
    }

    #[test]
    fn prompt_labels_speakers() {
        let turns = parse_turns(&append_llm_turn("Q1\n", "x", "t", "A1"));
        let prompt = conversation_prompt(&turns);
        assert_eq!(prompt, "User:\nQ1\n\nAssistant:\nA1\n\nAssistant:\n");
    }
}
