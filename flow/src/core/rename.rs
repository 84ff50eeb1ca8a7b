//! Staged job renames.
//!
//! A rename produces the full set of documents that must change together:
//! the renamed job plus every job whose `depends_on` or `prompt_source`
//! refers to the old filename. Committing the set is left to the job store.

use std::collections::HashSet;

use thiserror::Error;

use crate::core::job::Job;
use crate::core::naming::{NameError, renamed_filename};

#[derive(Debug, Error)]
pub enum RenameError {
    #[error("a job with the filename '{0}' already exists")]
    AlreadyExists(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Name(#[from] NameError),
}

/// Documents to write for one rename.
#[derive(Debug, Clone)]
pub struct StagedRename {
    pub old_filename: String,
    pub new_filename: String,
    /// The renamed job, already carrying its new filename and title.
    pub renamed: Job,
    /// Other jobs with rewritten references.
    pub updated: Vec<Job>,
}

/// Stage renaming `target` (filename or id) to `new_title`.
///
/// `existing_files` holds every markdown filename in the plan directory,
/// including non-job notes.
pub fn stage_rename(
    jobs: &[Job],
    existing_files: &HashSet<String>,
    target: &str,
    new_title: &str,
) -> Result<StagedRename, RenameError> {
    let job = jobs
        .iter()
        .find(|job| job.filename == target)
        .or_else(|| jobs.iter().find(|job| job.id == target))
        .ok_or_else(|| RenameError::NotFound(target.to_string()))?;
    let old_filename = job.filename.clone();
    let new_filename = renamed_filename(&old_filename, new_title)?;
    if existing_files.contains(&new_filename) {
        return Err(RenameError::AlreadyExists(new_filename));
    }

    let mut renamed = job.clone();
    renamed.filename = new_filename.clone();
    renamed.title = new_title.trim().to_string();

    let mut updated = Vec::new();
    for other in jobs.iter().filter(|other| other.filename != old_filename) {
        let mut copy = other.clone();
        let deps = rewrite_refs(&mut copy.depends_on, &old_filename, &new_filename);
        let sources = rewrite_refs(&mut copy.prompt_source, &old_filename, &new_filename);
        if deps || sources {
            updated.push(copy);
        }
    }
    Ok(StagedRename {
        old_filename,
        new_filename,
        renamed,
        updated,
    })
}

/// Replace references to `old` (bare or as a trailing path component).
fn rewrite_refs(refs: &mut [String], old: &str, new: &str) -> bool {
    let mut changed = false;
    for entry in refs.iter_mut() {
        if entry == old {
            *entry = new.to_string();
            changed = true;
        } else if let Some(prefix) = entry.strip_suffix(old)
            && prefix.ends_with('/')
        {
            *entry = format!("{prefix}{new}");
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::JobType;

    fn jobs() -> Vec<Job> {
        let a = Job::new("01-setup.md", "setup", "Setup", JobType::Shell);
        let mut b = Job::new("02-build.md", "build", "Build", JobType::Shell);
        b.depends_on = vec!["01-setup.md".to_string()];
        let mut c = Job::new("03-docs.md", "docs", "Docs", JobType::Oneshot);
        c.prompt_source = vec!["plans/demo/01-setup.md".to_string(), "README.md".to_string()];
        vec![a, b, c]
    }

    fn files(jobs: &[Job]) -> HashSet<String> {
        jobs.iter().map(|job| job.filename.clone()).collect()
    }

    #[test]
    fn rewrites_every_reference() {
        let jobs = jobs();
        let staged = stage_rename(&jobs, &files(&jobs), "01-setup.md", "Prepare env").expect("stage");
        assert_eq!(staged.new_filename, "01-prepare-env.md");
        assert_eq!(staged.renamed.title, "Prepare env");
        assert_eq!(staged.updated.len(), 2);
        assert_eq!(staged.updated[0].depends_on, vec!["01-prepare-env.md"]);
        assert_eq!(
            staged.updated[1].prompt_source,
            vec!["plans/demo/01-prepare-env.md", "README.md"]
        );
    }

    #[test]
    fn collision_is_rejected() {
        let jobs = jobs();
        let mut existing = files(&jobs);
        existing.insert("01-build.md".to_string());
        let err = stage_rename(&jobs, &existing, "setup", "Build").unwrap_err();
        assert_eq!(
            err.to_string(),
            "a job with the filename '01-build.md' already exists"
        );
        let err = stage_rename(&jobs, &files(&jobs), "02-build.md", "Build").unwrap_err();
        assert!(matches!(err, RenameError::AlreadyExists(_)));
    }

    #[test]
    fn unknown_target_is_not_found() {
        let jobs = jobs();
        assert!(matches!(
            stage_rename(&jobs, &files(&jobs), "99-nope.md", "X").unwrap_err(),
            RenameError::NotFound(_)
        ));
    }
}
