//! `shell` jobs: the prompt is a script run with `sh -c`.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::job::Job;
use crate::core::output::stamp_lines;
use crate::core::types::JobStatus;
use crate::dispatch::{DispatchError, ExecContext, Execution};
use crate::io::process::{RunOptions, run_command, shell_command};

pub(super) fn execute(job: &Job, ctx: &ExecContext<'_>) -> Result<Execution, DispatchError> {
    let script = job.prompt();
    let mut cmd = shell_command(script, &ctx.workdir);
    cmd.env("FLOW_PLAN_DIR", &ctx.plan.dir)
        .env("FLOW_JOB", &job.filename);
    let opts = RunOptions::new(
        Duration::from_secs(ctx.flow.shell.timeout_secs),
        ctx.flow.shell.output_limit_bytes,
    );
    debug!(workdir = %ctx.workdir.display(), "running shell job");
    let output = run_command(cmd, &opts).map_err(|err| DispatchError::ExecutionFailed {
        job: job.filename.clone(),
        message: format!("{err:#}"),
    })?;

    let now = Utc::now();
    if let Err(err) = ctx.logs.write_command_log(script, &output, now) {
        warn!(err = %format!("{err:#}"), "failed to write shell log");
    }

    let mut text = output.combined_text();
    text.push_str(&output.truncated_notice("shell"));
    let mut exec = Execution::finished(if output.success() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    });
    if !output.success() {
        exec.failure = Some(output.failure_reason());
    }
    exec.output = Some(stamp_lines(&text, now));
    Ok(exec)
}
