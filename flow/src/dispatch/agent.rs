//! `agent` and `interactive_agent` jobs.
//!
//! Agents run in a tmux window of the worktree's session, optionally inside a
//! container via `docker exec`. A window reported as created is checked again
//! after a short delay because tmux can report success for a window whose
//! command died immediately. Non-interactive windows write their exit status
//! to a file that is polled until it appears.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::job::Job;
use crate::core::output::stamp_lines;
use crate::core::types::JobStatus;
use crate::dispatch::{DispatchError, ExecContext, Execution, oneshot};
use crate::io::config::AgentConfig;
use crate::io::container::{exec_command, shell_quote};
use crate::io::job_store::write_atomic;
use crate::io::session::{SessionManager, WindowLaunch, session_name};

/// Where the agent prompt is staged inside the worktree.
const PROMPTS_DIR: &str = ".grove/prompts";
const EXIT_FILE: &str = "exit_code";

#[derive(Debug, PartialEq, Eq)]
enum WaitResult {
    Exited(i32),
    Vanished,
    TimedOut,
}

pub(super) fn execute(job: &Job, ctx: &ExecContext<'_>) -> Result<Execution, DispatchError> {
    let (Some(tree), Some(worktree)) = (ctx.worktree.as_deref(), job.worktree.as_deref()) else {
        return Err(DispatchError::WorktreeRequired {
            job: job.filename.clone(),
            job_type: job.job_type,
        });
    };
    let exec_failed = |err: anyhow::Error| DispatchError::ExecutionFailed {
        job: job.filename.clone(),
        message: format!("{err:#}"),
    };

    let prompt = oneshot::build_prompt(job, ctx)?;
    if let Err(err) = ctx.logs.write_prompt(&prompt) {
        warn!(err = %format!("{err:#}"), "failed to write prompt log");
    }
    let prompt_path = tree.join(PROMPTS_DIR).join(format!("{}.md", job.stem()));
    write_atomic(&prompt_path, &prompt).map_err(exec_failed)?;

    let agent = agent_command(&ctx.flow.agent, job.agent_continue, &prompt_path);
    let inner = match ctx.container {
        Some(container) => exec_command(container, &ctx.workdir.to_string_lossy(), &agent),
        None => agent,
    };
    let exit_path = ctx.logs.dir().join(EXIT_FILE);
    if exit_path.exists() {
        fs::remove_file(&exit_path).map_err(|err| exec_failed(err.into()))?;
    }
    fs::create_dir_all(ctx.logs.dir()).map_err(|err| exec_failed(err.into()))?;
    let window_command = if job.is_interactive() {
        inner
    } else {
        let script = format!(
            "{inner}; echo $? > {}",
            shell_quote(&exit_path.to_string_lossy())
        );
        format!("sh -c {}", shell_quote(&script))
    };

    let sessions = ctx.collab.sessions;
    let session = session_name(&ctx.flow.agent.session_prefix, worktree);
    let window = job.stem();
    let launch_failed = |message: String| DispatchError::SessionLaunchFailed {
        job: job.filename.clone(),
        message,
        diagnostic: sessions.diagnostic_command(&session),
    };

    let has_session = sessions
        .has_session(&session)
        .map_err(|err| launch_failed(format!("{err:#}")))?;
    if !has_session {
        sessions
            .new_session(&session, tree)
            .map_err(|err| launch_failed(format!("could not create session: {err:#}")))?;
    }
    info!(%session, window, interactive = job.is_interactive(), "launching agent window");
    let launch = sessions
        .new_window(&session, window, &ctx.workdir, &window_command)
        .map_err(|err| launch_failed(format!("could not open window: {err:#}")))?;

    thread::sleep(Duration::from_millis(ctx.flow.agent.verify_delay_ms));
    let alive = sessions
        .window_exists(&session, window)
        .map_err(|err| launch_failed(format!("{err:#}")))?;
    debug!(?launch, alive, "window check");
    let finished_early = !job.is_interactive() && exit_path.exists();
    if !alive && !finished_early {
        let message = match launch {
            WindowLaunch::Unverified => "tmux reported the window as created but it never appeared",
            WindowLaunch::Verified => "the window closed right after launch",
        };
        return Err(launch_failed(message.to_string()));
    }
    if alive
        && let Ok(Some(pid)) = sessions.pane_pid(&session, window)
        && let Err(err) = ctx.store.write_lock(job, pid)
    {
        warn!(err = %format!("{err:#}"), "failed to record session pid");
    }

    if job.is_interactive() {
        let mut exec = Execution::finished(JobStatus::Running);
        exec.output = Some(stamp_lines(
            &format!("Interactive session started in tmux session '{session}', window '{window}'"),
            Utc::now(),
        ));
        exec.notes = vec![
            format!("✓ Launched {} in tmux session '{session}'", job.filename),
            format!("Attach with: tmux attach -t {session}"),
            format!("When finished: flow plan complete {}", job.filename),
        ];
        return Ok(exec);
    }

    let result = wait_for_exit(
        sessions,
        &session,
        window,
        &exit_path,
        Duration::from_millis(ctx.flow.agent.poll_interval_ms),
        Duration::from_secs(ctx.flow.agent.timeout_secs),
    )
    .map_err(|err| launch_failed(format!("{err:#}")))?;
    let now = Utc::now();
    let (status, line, failure) = match result {
        WaitResult::Exited(0) => (JobStatus::Completed, "agent exited with code 0".to_string(), None),
        WaitResult::Exited(code) => {
            let reason = format!("agent exited with code {code}");
            (JobStatus::Failed, reason.clone(), Some(reason))
        }
        WaitResult::Vanished => {
            let reason = "agent window closed without reporting an exit status".to_string();
            (JobStatus::Failed, reason.clone(), Some(reason))
        }
        WaitResult::TimedOut => {
            let reason = format!(
                "agent did not finish within {}s",
                ctx.flow.agent.timeout_secs
            );
            (JobStatus::Failed, reason.clone(), Some(reason))
        }
    };
    let mut exec = Execution::finished(status);
    exec.output = Some(stamp_lines(&line, now));
    exec.failure = failure;
    Ok(exec)
}

/// `<agent> [--continue] "$(cat <prompt>)"`.
fn agent_command(config: &AgentConfig, continue_session: bool, prompt_path: &Path) -> String {
    let mut parts: Vec<String> = config.command.iter().map(|part| shell_quote(part)).collect();
    if continue_session && !config.continue_flag.is_empty() {
        parts.push(shell_quote(&config.continue_flag));
    }
    parts.push(format!(
        "\"$(cat {})\"",
        shell_quote(&prompt_path.to_string_lossy())
    ));
    parts.join(" ")
}

fn wait_for_exit(
    sessions: &dyn SessionManager,
    session: &str,
    window: &str,
    exit_path: &Path,
    poll: Duration,
    timeout: Duration,
) -> anyhow::Result<WaitResult> {
    let start = Instant::now();
    loop {
        if let Some(code) = read_exit_code(exit_path) {
            return Ok(WaitResult::Exited(code));
        }
        if !sessions.window_exists(session, window)? {
            // The window may close between the write and our check.
            return Ok(read_exit_code(exit_path).map_or(WaitResult::Vanished, WaitResult::Exited));
        }
        if start.elapsed() >= timeout {
            return Ok(WaitResult::TimedOut);
        }
        thread::sleep(poll);
    }
}

fn read_exit_code(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}
