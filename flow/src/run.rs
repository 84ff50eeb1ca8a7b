//! `flow plan run`: explicit jobs, the next ready job, or every ready job.

use std::collections::HashSet;

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::core::graph::DependencyGraph;
use crate::core::types::JobType;
use crate::dispatch::{DispatchError, Dispatcher, Outcome, RunOptions};

/// Which jobs a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// These jobs, in the given order.
    Jobs(Vec<String>),
    /// The first ready job.
    Next,
    /// Ready jobs until none are left, re-reading the plan after each.
    All,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanRunOptions {
    /// Continue with other ready jobs after a failure.
    pub keep_going: bool,
    pub skip_interactive: bool,
}

/// Progress callbacks for the CLI.
#[derive(Debug)]
pub enum RunEvent<'a> {
    Started(&'a str),
    Finished(&'a Outcome),
    Failed { job: &'a str, error: &'a anyhow::Error },
    SkippedInteractive(&'a str),
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<Outcome>,
    /// `(job, message)` for jobs that failed under `--keep-going`.
    pub failed: Vec<(String, String)>,
    pub skipped_interactive: Vec<String>,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.failed.is_empty() && self.skipped_interactive.is_empty()
    }
}

/// Run jobs per `mode`.
///
/// Without `keep_going` the first failing job's error is returned as-is.
/// Interactive jobs skipped with `skip_interactive` make the whole run fail
/// once everything else has been attempted.
pub fn run_plan<F: FnMut(RunEvent<'_>)>(
    dispatcher: &Dispatcher<'_>,
    mode: &RunMode,
    options: PlanRunOptions,
    mut on_event: F,
) -> Result<RunReport> {
    let run_options = RunOptions {
        skip_interactive: options.skip_interactive,
    };
    let mut report = RunReport::default();
    let mut attempted = HashSet::new();

    match mode {
        RunMode::Jobs(jobs) => {
            for job in jobs {
                attempted.insert(job.clone());
                step(dispatcher, job, run_options, options, &mut report, &mut on_event)?;
            }
        }
        RunMode::Next => {
            if let Some(job) = next_ready(dispatcher, &attempted, options, &mut report, &mut on_event)? {
                step(dispatcher, &job, run_options, options, &mut report, &mut on_event)?;
            }
        }
        RunMode::All => {
            while let Some(job) =
                next_ready(dispatcher, &attempted, options, &mut report, &mut on_event)?
            {
                attempted.insert(job.clone());
                step(dispatcher, &job, run_options, options, &mut report, &mut on_event)?;
            }
        }
    }

    info!(
        ran = report.outcomes.len(),
        failed = report.failed.len(),
        skipped = report.skipped_interactive.len(),
        "plan run finished"
    );
    if let Some(job) = report.skipped_interactive.first() {
        return Err(DispatchError::InteractiveSkipped { job: job.clone() }.into());
    }
    if !report.failed.is_empty() {
        let names: Vec<&str> = report.failed.iter().map(|(job, _)| job.as_str()).collect();
        return Err(anyhow!("{} job(s) failed: {}", names.len(), names.join(", ")));
    }
    Ok(report)
}

fn step<F: FnMut(RunEvent<'_>)>(
    dispatcher: &Dispatcher<'_>,
    job: &str,
    run_options: RunOptions,
    options: PlanRunOptions,
    report: &mut RunReport,
    on_event: &mut F,
) -> Result<()> {
    on_event(RunEvent::Started(job));
    match dispatcher.run_job(job, run_options) {
        Ok(outcome) => {
            on_event(RunEvent::Finished(&outcome));
            report.outcomes.push(outcome);
            Ok(())
        }
        Err(err) => {
            if let Some(DispatchError::InteractiveSkipped { job }) = err.downcast_ref::<DispatchError>() {
                on_event(RunEvent::SkippedInteractive(job));
                report.skipped_interactive.push(job.clone());
                return Ok(());
            }
            on_event(RunEvent::Failed { job, error: &err });
            if !options.keep_going {
                return Err(err);
            }
            report.failed.push((job.to_string(), format!("{err:#}")));
            Ok(())
        }
    }
}

/// First ready job not yet attempted in this run.
fn next_ready<F: FnMut(RunEvent<'_>)>(
    dispatcher: &Dispatcher<'_>,
    attempted: &HashSet<String>,
    options: PlanRunOptions,
    report: &mut RunReport,
    on_event: &mut F,
) -> Result<Option<String>> {
    let jobs = dispatcher.store().load_jobs()?;
    let graph = DependencyGraph::build(&jobs)?;
    for node in graph.ready_set() {
        if attempted.contains(&node.filename) {
            continue;
        }
        if options.skip_interactive && node.job_type == JobType::InteractiveAgent {
            if !report.skipped_interactive.contains(&node.filename) {
                on_event(RunEvent::SkippedInteractive(&node.filename));
                report.skipped_interactive.push(node.filename.clone());
            }
            continue;
        }
        debug!(job = %node.filename, "next ready job");
        return Ok(Some(node.filename.clone()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::JobStatus;
    use crate::test_support::{PlanFixture, job};

    fn shell(fixture: &PlanFixture, filename: &str, script: &str, deps: &[&str]) {
        let mut j = job(filename, JobType::Shell);
        j.body = format!("{script}\n");
        j.depends_on = deps.iter().map(ToString::to_string).collect();
        fixture.write(&mut j);
    }

    #[test]
    fn all_reruns_ready_set_after_each_job() {
        let fixture = PlanFixture::new();
        shell(&fixture, "01-a.md", "echo a", &[]);
        shell(&fixture, "02-b.md", "echo b", &["01-a.md"]);
        shell(&fixture, "03-c.md", "echo c", &["01-a.md"]);

        let mut started = Vec::new();
        let report = run_plan(
            &fixture.dispatcher(),
            &RunMode::All,
            PlanRunOptions::default(),
            |event| {
                if let RunEvent::Started(job) = event {
                    started.push(job.to_string());
                }
            },
        )
        .expect("run");
        assert_eq!(started, vec!["01-a.md", "02-b.md", "03-c.md"]);
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(fixture.load("03-c.md").status, JobStatus::Completed);
    }

    #[test]
    fn next_runs_only_the_first_ready_job() {
        let fixture = PlanFixture::new();
        shell(&fixture, "01-a.md", "true", &[]);
        shell(&fixture, "02-b.md", "true", &[]);
        let report = run_plan(&fixture.dispatcher(), &RunMode::Next, PlanRunOptions::default(), |_| {})
            .expect("run");
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(fixture.load("02-b.md").status, JobStatus::Pending);
    }

    #[test]
    fn keep_going_continues_past_failures() {
        let fixture = PlanFixture::new();
        shell(&fixture, "01-bad.md", "exit 1", &[]);
        shell(&fixture, "02-after-bad.md", "true", &["01-bad.md"]);
        shell(&fixture, "03-other.md", "true", &[]);

        let err = run_plan(
            &fixture.dispatcher(),
            &RunMode::All,
            PlanRunOptions {
                keep_going: true,
                ..PlanRunOptions::default()
            },
            |_| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("1 job(s) failed: 01-bad.md"));
        assert_eq!(fixture.load("03-other.md").status, JobStatus::Completed);
        assert_eq!(fixture.load("02-after-bad.md").status, JobStatus::Pending);
    }

    #[test]
    fn stop_on_first_failure_without_keep_going() {
        let fixture = PlanFixture::new();
        shell(&fixture, "01-bad.md", "exit 1", &[]);
        shell(&fixture, "02-other.md", "true", &[]);
        let err = run_plan(&fixture.dispatcher(), &RunMode::All, PlanRunOptions::default(), |_| {})
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::ExecutionFailed { .. })
        ));
        assert_eq!(fixture.load("02-other.md").status, JobStatus::Pending);
    }

    #[test]
    fn skipped_interactive_job_fails_the_run_after_others() {
        let fixture = PlanFixture::new();
        let mut pair = job("01-pair.md", JobType::InteractiveAgent);
        pair.worktree = Some("feature".to_string());
        pair.body = "Pair.\n".to_string();
        fixture.write(&mut pair);
        shell(&fixture, "02-lint.md", "true", &[]);

        let err = run_plan(
            &fixture.dispatcher(),
            &RunMode::All,
            PlanRunOptions {
                skip_interactive: true,
                ..PlanRunOptions::default()
            },
            |_| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("--skip-interactive"));
        assert_eq!(fixture.load("02-lint.md").status, JobStatus::Completed);
        assert_eq!(fixture.load("01-pair.md").status, JobStatus::Pending);
    }
}
