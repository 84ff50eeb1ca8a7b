//! `generate_jobs` output: turn an LLM response into new job files.

use std::collections::HashSet;

use chrono::Utc;
use tracing::info;

use crate::core::generated::{Materialize, materialize, parse_response};
use crate::core::job::Job;
use crate::core::naming::next_job_number;
use crate::dispatch::{DispatchError, ExecContext};

/// Parse `response` and write the jobs it defines. Returns the new filenames.
pub(super) fn materialize_response(
    job: &Job,
    response: &str,
    ctx: &ExecContext<'_>,
) -> Result<Vec<String>, DispatchError> {
    let parse_failed = |source| DispatchError::GenerationParseFailed {
        job: job.filename.clone(),
        source,
    };
    let io_failed = |err: anyhow::Error| DispatchError::ExecutionFailed {
        job: job.filename.clone(),
        message: format!("{err:#}"),
    };

    let generated = parse_response(response).map_err(parse_failed)?;
    let files = ctx.store.markdown_files().map_err(io_failed)?;
    let existing_ids: HashSet<String> = ctx.jobs.iter().map(|j| j.id.clone()).collect();
    let now = Utc::now();
    let opts = Materialize {
        next_number: next_job_number(files.iter().map(String::as_str)),
        existing_ids: &existing_ids,
        default_worktree: job.worktree.as_deref(),
        now,
    };
    let mut created = materialize(&generated, &opts).map_err(parse_failed)?;

    let mut names = Vec::with_capacity(created.len());
    for new_job in &mut created {
        ctx.store.create(new_job, now).map_err(io_failed)?;
        names.push(new_job.filename.clone());
    }
    info!(count = names.len(), "generated jobs");
    Ok(names)
}
