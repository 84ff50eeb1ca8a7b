//! `oneshot` jobs: one LLM call with the assembled prompt.

use std::fmt::Write as _;

use tracing::{debug, info, warn};

use crate::core::job::Job;
use crate::core::output::prompt_part;
use crate::core::types::{JobStatus, OutputMode};
use crate::dispatch::{DispatchError, ExecContext, Execution, generate, read_reference};
use crate::io::job_store::write_atomic;
use crate::io::llm::LlmRequest;

pub(super) fn execute(job: &Job, ctx: &ExecContext<'_>) -> Result<Execution, DispatchError> {
    let prompt = build_prompt(job, ctx)?;
    if let Err(err) = ctx.logs.write_prompt(&prompt) {
        warn!(err = %format!("{err:#}"), "failed to write prompt log");
    }
    let request = LlmRequest {
        prompt,
        model: ctx.model_for(job),
        workdir: ctx.workdir.clone(),
    };
    info!(model = request.model.as_deref().unwrap_or("default"), "calling llm");
    let response = ctx
        .collab
        .llm
        .complete(&request)
        .map_err(|err| DispatchError::ExecutionFailed {
            job: job.filename.clone(),
            message: format!("{err:#}"),
        })?;
    if let Err(err) = ctx.logs.write_response(&response) {
        warn!(err = %format!("{err:#}"), "failed to write response log");
    }

    let mut exec = Execution::finished(JobStatus::Completed);
    match job.output_mode() {
        OutputMode::Append => exec.output = Some(response),
        OutputMode::None => debug!("discarding response"),
        OutputMode::File => {
            let rel = job.output.path.as_deref().unwrap_or_default();
            let path = ctx.plan.dir.join(rel);
            write_atomic(&path, &response).map_err(|err| DispatchError::ExecutionFailed {
                job: job.filename.clone(),
                message: format!("{err:#}"),
            })?;
            exec.output = Some(format!("Wrote response to {rel}\n"));
        }
        OutputMode::GenerateJobs => {
            let created = generate::materialize_response(job, &response, ctx)?;
            let mut text = format!("Generated {} job(s):\n", created.len());
            for name in &created {
                let _ = writeln!(text, "- {name}");
            }
            exec.output = Some(text);
            exec.created = created;
        }
    }
    Ok(exec)
}

/// Prompt sources, dependency context and the job's own prompt.
///
/// Dependencies are inlined as `<dependency>` blocks when
/// `prepend_dependencies` is set; otherwise their file paths are listed.
pub(super) fn build_prompt(job: &Job, ctx: &ExecContext<'_>) -> Result<String, DispatchError> {
    let mut prompt = String::new();
    for source in &job.prompt_source {
        let (path, text) =
            read_reference(ctx, source).map_err(|err| DispatchError::ExecutionFailed {
                job: job.filename.clone(),
                message: format!("{err:#}"),
            })?;
        debug!(source = %path.display(), "prompt source");
        let _ = write!(prompt, "<file path=\"{source}\">\n{}\n</file>\n\n", text.trim_end());
    }

    let deps = ctx.graph.dependencies(&job.filename);
    if job.prepend_dependencies {
        for dep in deps {
            let Some(dep_job) = ctx.jobs.iter().find(|j| j.filename == dep.filename) else {
                continue;
            };
            let _ = write!(
                prompt,
                "<dependency file=\"{}\">\n{}\n</dependency>\n\n",
                dep.filename,
                dep_job.body.trim()
            );
        }
    } else if !deps.is_empty() {
        prompt.push_str("Completed dependencies (read for context):\n");
        for dep in deps {
            let _ = writeln!(prompt, "- {}", ctx.plan.dir.join(&dep.filename).display());
        }
        prompt.push('\n');
    }

    prompt.push_str(prompt_part(&job.body).trim());
    prompt.push('\n');
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::core::types::{JobStatus, JobType};
    use crate::dispatch::RunOptions;
    use crate::test_support::{PlanFixture, job};

    #[test]
    fn oneshot_appends_response_and_logs_prompt() {
        let fixture = PlanFixture::new();
        fs::write(fixture.plan.dir.join("notes.txt"), "context notes\n").expect("notes");
        let mut design = job("01-design.md", JobType::Shell);
        design.status = JobStatus::Completed;
        design.body = "true\n".to_string();
        fixture.write(&mut design);
        let mut draft = job("02-draft.md", JobType::Oneshot);
        draft.depends_on = vec!["01-design.md".to_string()];
        draft.prompt_source = vec!["notes.txt".to_string()];
        draft.body = "Write the draft.\n".to_string();
        fixture.write(&mut draft);
        fixture.llm.push_response("the draft");

        let outcome = fixture
            .dispatcher()
            .run_job("02-draft.md", RunOptions::default())
            .expect("run");
        assert_eq!(outcome.status, JobStatus::Completed);

        let saved = fixture.load("02-draft.md");
        assert!(saved.body.ends_with("## Output\n\nthe draft\n"));
        let prompt = fs::read_to_string(fixture.plan.dir.join(".logs/02-draft/prompt.md"))
            .expect("prompt log");
        assert!(prompt.contains("<file path=\"notes.txt\">\ncontext notes\n</file>"));
        assert!(prompt.contains("01-design.md"));
        assert!(prompt.ends_with("Write the draft.\n"));
        assert_eq!(fixture.llm.prompts().len(), 1);
    }

    #[test]
    fn prepended_dependencies_are_inlined() {
        let fixture = PlanFixture::new();
        let mut design = job("01-design.md", JobType::Shell);
        design.status = JobStatus::Completed;
        design.body = "the design body\n".to_string();
        fixture.write(&mut design);
        let mut draft = job("02-draft.md", JobType::Oneshot);
        draft.depends_on = vec!["01-design.md".to_string()];
        draft.prepend_dependencies = true;
        draft.body = "Go.\n".to_string();
        fixture.write(&mut draft);
        fixture.llm.push_response("ok");

        fixture
            .dispatcher()
            .run_job("02-draft.md", RunOptions::default())
            .expect("run");
        let prompt = &fixture.llm.prompts()[0];
        assert!(prompt.contains("<dependency file=\"01-design.md\">\nthe design body\n</dependency>"));
    }

    #[test]
    fn llm_failure_marks_job_failed() {
        let fixture = PlanFixture::new();
        let mut draft = job("01-draft.md", JobType::Oneshot);
        draft.body = "Go.\n".to_string();
        fixture.write(&mut draft);
        fixture.llm.push_error("model unavailable");

        let err = fixture
            .dispatcher()
            .run_job("01-draft.md", RunOptions::default())
            .unwrap_err();
        assert!(format!("{err:#}").contains("model unavailable"));
        assert_eq!(fixture.load("01-draft.md").status, JobStatus::Failed);
    }
}
