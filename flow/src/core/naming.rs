//! Filename, id and worktree-name rules.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

const MAX_SLUG_LEN: usize = 50;
const MAX_WORKTREE_NAME_LEN: usize = 100;

static NUMBERED_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})-.*\.md$").expect("numbered file regex"));
static WORKTREE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("worktree name regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("worktree name must not be empty")]
    EmptyWorktree,
    #[error("worktree name '{0}' is longer than 100 characters")]
    WorktreeTooLong(String),
    #[error("worktree name '{0}' may only contain letters, digits, '-' and '_'")]
    WorktreeChars(String),
    #[error("title '{0}' does not produce a usable filename")]
    EmptySlug(String),
}

/// Lowercase, hyphenated, `[a-z0-9-]` only, at most 50 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = false;
    for ch in title.trim().chars().flat_map(char::to_lowercase) {
        let mapped = if ch.is_whitespace() || ch == '-' {
            '-'
        } else if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            continue;
        };
        if mapped == '-' {
            if last_dash || slug.is_empty() {
                last_dash = true;
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        slug.push(mapped);
    }
    let mut slug = slug.trim_end_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    slug
}

/// Two-digit numeric prefix of a job filename, if any.
pub fn numeric_prefix(filename: &str) -> Option<u32> {
    NUMBERED_FILE
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// One past the highest numbered job file (first job is 1).
pub fn next_job_number<'a>(filenames: impl IntoIterator<Item = &'a str>) -> u32 {
    filenames
        .into_iter()
        .filter_map(numeric_prefix)
        .max()
        .map_or(1, |max| max + 1)
}

/// `NN-slug.md` for a job title.
pub fn job_filename(number: u32, title: &str) -> Result<String, NameError> {
    let slug = slugify(title);
    if slug.is_empty() {
        return Err(NameError::EmptySlug(title.to_string()));
    }
    Ok(format!("{number:02}-{slug}.md"))
}

/// Filename for a renamed job, keeping the old numeric prefix.
pub fn renamed_filename(old_filename: &str, new_title: &str) -> Result<String, NameError> {
    let slug = slugify(new_title);
    if slug.is_empty() {
        return Err(NameError::EmptySlug(new_title.to_string()));
    }
    Ok(match numeric_prefix(old_filename) {
        Some(number) => format!("{number:02}-{slug}.md"),
        None => format!("{slug}.md"),
    })
}

/// The title slug, suffixed `-2`, `-3`, ... until unused.
pub fn unique_job_id(title: &str, existing: &HashSet<String>) -> String {
    let base = match slugify(title) {
        slug if slug.is_empty() => "job".to_string(),
        slug => slug,
    };
    if !existing.contains(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub fn validate_worktree_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::EmptyWorktree);
    }
    if name.len() > MAX_WORKTREE_NAME_LEN {
        return Err(NameError::WorktreeTooLong(name.to_string()));
    }
    if !WORKTREE_NAME.is_match(name) {
        return Err(NameError::WorktreeChars(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_normalizes_titles() {
        assert_eq!(slugify("Implement Auth Flow"), "implement-auth-flow");
        assert_eq!(slugify("  Fix: bug #12 (urgent)!  "), "fix-bug-12-urgent");
        assert_eq!(slugify("a -- b__c"), "a-bc");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn slugify_truncates_without_trailing_dash() {
        let title = "word ".repeat(20);
        let slug = slugify(&title);
        assert!(slug.len() <= 50);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn next_number_follows_highest_prefix() {
        assert_eq!(next_job_number(Vec::<&str>::new()), 1);
        assert_eq!(
            next_job_number(["01-a.md", "03-c.md", "notes.md", "2-x.md"]),
            4
        );
    }

    #[test]
    fn filenames_are_zero_padded() {
        assert_eq!(job_filename(2, "Review Code").expect("name"), "02-review-code.md");
        assert!(job_filename(1, "???").is_err());
    }

    #[test]
    fn rename_keeps_prefix() {
        assert_eq!(
            renamed_filename("04-old-name.md", "New Name").expect("name"),
            "04-new-name.md"
        );
        assert_eq!(renamed_filename("loose.md", "Tight").expect("name"), "tight.md");
    }

    #[test]
    fn ids_are_made_unique() {
        let mut existing = HashSet::new();
        assert_eq!(unique_job_id("Build", &existing), "build");
        existing.insert("build".to_string());
        existing.insert("build-2".to_string());
        assert_eq!(unique_job_id("Build", &existing), "build-3");
    }

    #[test]
    fn worktree_names_are_checked() {
        validate_worktree_name("feature-a_1").expect("valid");
        assert!(validate_worktree_name("").is_err());
        assert!(validate_worktree_name("has space").is_err());
        assert!(validate_worktree_name(&"x".repeat(101)).is_err());
    }
}
