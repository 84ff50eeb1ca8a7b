//! CLI tests: spawn the flow binary and check output and exit codes.

use std::path::Path;
use std::process::{Command, Output};

use flow::exit_codes;
use flow::test_support::{TestRepo, git_available};

fn flow(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_flow"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("spawn flow")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn shell_plan_runs_to_completion() {
    if !git_available() {
        return;
    }
    let repo = TestRepo::new();
    let dir = repo.path();

    let init = flow(dir, &["plan", "init", "demo"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK), "{}", stderr(&init));
    assert!(stdout(&init).contains("✓ Set active plan to: demo"));

    let add = flow(dir, &["plan", "add", "--title", "Say hi", "--type", "shell", "--prompt", "echo hi"]);
    assert!(stdout(&add).contains("✓ Created job: 01-say-hi.md"), "{}", stderr(&add));

    let run = flow(dir, &["plan", "run", "--all"]);
    assert_eq!(run.status.code(), Some(exit_codes::OK), "{}", stderr(&run));

    let status = flow(dir, &["plan", "status"]);
    assert!(stdout(&status).contains("✓ 01-say-hi.md (shell) - completed"));

    let again = flow(dir, &["plan", "run", "01-say-hi.md"]);
    assert_eq!(again.status.code(), Some(exit_codes::PRECONDITION));
    assert!(stderr(&again).contains("already completed"));
}

#[test]
fn missing_dependency_and_cycle_are_structural() {
    if !git_available() {
        return;
    }
    let repo = TestRepo::new();
    let dir = repo.path();
    flow(dir, &["plan", "init", "broken"]);
    let add = flow(dir, &["plan", "add", "--title", "X", "--type", "shell", "-d", "nope"]);
    assert_ne!(add.status.code(), Some(exit_codes::OK));
    assert!(stderr(&add).contains("dependency 'nope' not found in plan 'broken'"));

    flow(dir, &["plan", "add", "--title", "A", "--type", "shell"]);
    flow(dir, &["plan", "add", "--title", "B", "--type", "shell", "-d", "01-a.md"]);
    let cycle = flow(dir, &["plan", "jobs", "update-deps", "01-a.md", "02-b.md"]);
    assert_eq!(cycle.status.code(), Some(exit_codes::STRUCTURAL));
    assert!(stderr(&cycle).contains("circular dependency detected"));
}

#[test]
fn review_hook_gates_finish() {
    if !git_available() {
        return;
    }
    let repo = TestRepo::new();
    let dir = repo.path();
    flow(dir, &["plan", "init", "gated", "--on-review", "true"]);

    let gated = flow(dir, &["plan", "finish"]);
    assert_eq!(gated.status.code(), Some(exit_codes::GATED));
    assert!(stderr(&gated).contains(
        "plan 'gated' has review hooks configured; run 'flow plan review gated' before finishing (or pass --yes)"
    ));

    let review = flow(dir, &["plan", "review"]);
    assert_eq!(review.status.code(), Some(exit_codes::OK), "{}", stderr(&review));
    let twice = flow(dir, &["plan", "review"]);
    assert!(stdout(&twice).contains("Plan 'gated' is already in review. No action taken."));

    let finished = flow(dir, &["plan", "finish", "--mark-finished"]);
    assert_eq!(finished.status.code(), Some(exit_codes::OK), "{}", stderr(&finished));
    assert!(stdout(&finished).contains("✓ Marked plan as finished"));
}

#[test]
fn rebase_abort_without_rebase_is_a_conflict_code() {
    if !git_available() {
        return;
    }
    let repo = TestRepo::new();
    let dir = repo.path();
    flow(dir, &["plan", "init", "r", "--worktree", "feature"]);
    let abort = flow(dir, &["plan", "rebase", "--abort"]);
    assert_eq!(abort.status.code(), Some(exit_codes::CONFLICT));
    assert!(stderr(&abort).contains("no in-progress rebase found"));
}

#[test]
fn list_hold_and_json_status() {
    if !git_available() {
        return;
    }
    let repo = TestRepo::new();
    let dir = repo.path();

    let empty = flow(dir, &["plan", "list"]);
    assert_eq!(empty.status.code(), Some(exit_codes::OK), "{}", stderr(&empty));
    assert_eq!(stdout(&empty), "No plans found.\n");

    flow(dir, &["plan", "init", "demo"]);
    flow(dir, &["plan", "add", "--title", "Say hi", "--type", "shell", "--prompt", "echo hi"]);
    let listed = flow(dir, &["plan", "list"]);
    assert!(stdout(&listed).contains("demo   1      1 pending"), "{}", stdout(&listed));

    let hold = flow(dir, &["plan", "hold"]);
    assert!(stdout(&hold).contains("✓ Plan 'demo' is on hold"), "{}", stderr(&hold));
    let status = flow(dir, &["plan", "status"]);
    assert!(stdout(&status).contains("Status: hold"));
    let unhold = flow(dir, &["plan", "unhold"]);
    assert!(stdout(&unhold).contains("✓ Plan 'demo' is active again"));

    let json = flow(dir, &["plan", "status", "--format", "json"]);
    assert_eq!(json.status.code(), Some(exit_codes::OK), "{}", stderr(&json));
    let value: serde_json::Value = serde_json::from_str(&stdout(&json)).expect("json status");
    assert_eq!(value["plan"], "demo");
    assert_eq!(value["statistics"]["pending"], 1);
    assert_eq!(value["statistics"]["total"], 1);
}
