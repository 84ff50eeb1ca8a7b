//! Worktree provisioning, rebase and teardown against real git repositories.

use std::fs;

use flow::core::types::JobType;
use flow::io::discovery::SubmoduleDiscovery;
use flow::lifecycle::{FinishAction, FinishContext, available_actions, finish};
use flow::plan::{self, InitOptions, NewJob};
use flow::rebase::{self, RebaseError, RepoResult, Resume};
use flow::test_support::{
    EcosystemRepo, ScriptedSession, StaticDiscovery, TestRepo, commit_file_in, fixed_now,
    git_available, test_flow_config,
};

#[test]
fn agent_jobs_inherit_the_plan_worktree() {
    if !git_available() {
        return;
    }
    let repo = TestRepo::new();
    let flow = test_flow_config();
    let discovery = StaticDiscovery::default();
    let options = InitOptions {
        worktree: Some("feature-auth".to_string()),
        ..InitOptions::default()
    };
    let plan = plan::init(repo.path(), &flow, &discovery, "auth", &options, fixed_now())
        .expect("init")
        .plan;
    // Lazily created: nothing on disk until a job needs it.
    assert!(!repo.path().join(".grove-worktrees/feature-auth").exists());

    let notes = plan::add_job(&plan, &NewJob::new("Write notes", JobType::Oneshot), fixed_now())
        .expect("notes");
    assert_eq!(notes.job.worktree, None);
    let agent = plan::add_job(&plan, &NewJob::new("Build", JobType::Agent), fixed_now())
        .expect("agent");
    assert_eq!(agent.job.worktree.as_deref(), Some("feature-auth"));

    let followup = NewJob {
        depends_on: vec![agent.job.filename.clone()],
        ..NewJob::new("Review build", JobType::Shell)
    };
    let added = plan::add_job(&plan, &followup, fixed_now()).expect("followup");
    assert_eq!(added.job.worktree.as_deref(), Some("feature-auth"));
    assert_eq!(added.inherited_from.as_deref(), Some(agent.job.filename.as_str()));
}

#[test]
fn rebase_then_finish_removes_worktree_and_branch() {
    if !git_available() {
        return;
    }
    let repo = TestRepo::new();
    let flow = test_flow_config();
    let discovery = StaticDiscovery::default();
    let sessions = ScriptedSession::default();
    let options = InitOptions {
        worktree: Some("feature".to_string()),
        create_worktree: true,
        ..InitOptions::default()
    };
    let initialized =
        plan::init(repo.path(), &flow, &discovery, "ship", &options, fixed_now()).expect("init");
    let tree = initialized.worktree.expect("worktree created").path;
    let mut plan = initialized.plan;
    assert!(tree.join(".grove-workspace").exists());

    commit_file_in(&tree, "feature.txt", "feature\n", "feature work");
    repo.commit_file("main.txt", "main\n", "main work");

    let mut seen = Vec::new();
    let report = rebase::rebase(&plan, &flow, &discovery, "main", |repo| seen.push(repo.clone()))
        .expect("rebase");
    assert_eq!(seen.len(), 1);
    assert!(matches!(report.repos[0].result, RepoResult::Rebased { .. }));
    assert!(tree.join("main.txt").exists());

    let err = rebase::resume(&plan, &flow, &discovery, Resume::Continue).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RebaseError>(),
        Some(RebaseError::NoRebaseInProgress)
    ));

    let ctx = FinishContext {
        flow: &flow,
        discovery: &discovery,
        sessions: &sessions,
        force: false,
    };
    let available = available_actions(&plan, &ctx).expect("actions");
    assert_eq!(
        available,
        vec![
            FinishAction::MarkFinished,
            FinishAction::PruneWorktree,
            FinishAction::DeleteBranch,
            FinishAction::Archive,
        ]
    );
    let report = finish(&mut plan, &available, &ctx).expect("finish");
    assert!(!tree.exists(), "worktree left behind: {:?}", report.lines);
    assert!(!repo.git().branch_exists("feature").expect("branch"));

    // Everything is already done; a second pass changes nothing.
    assert_eq!(available_actions(&plan, &ctx).expect("actions"), Vec::new());
}

#[test]
fn ecosystem_rebase_reports_every_repository() {
    if !git_available() {
        return;
    }
    let eco = EcosystemRepo::new(&[("core", None), ("cli", None)]);
    let flow = test_flow_config();
    let discovery = SubmoduleDiscovery;
    let options = InitOptions {
        worktree: Some("feature".to_string()),
        create_worktree: true,
        ..InitOptions::default()
    };
    let initialized =
        plan::init(eco.path(), &flow, &discovery, "ship", &options, fixed_now()).expect("init");
    let tree = initialized.worktree.expect("worktree created").path;
    let plan = initialized.plan;

    commit_file_in(&eco.member("core"), "core.txt", "core\n", "core work");
    fs::write(tree.join("cli/README.md"), "local edit\n").expect("dirty cli");

    let mut seen = Vec::new();
    let err = rebase::rebase(&plan, &flow, &discovery, "main", |repo| seen.push(repo.clone()))
        .unwrap_err();
    match err.downcast_ref::<RebaseError>() {
        Some(RebaseError::Partial { failed, succeeded }) => {
            assert_eq!(failed, &vec!["cli".to_string()]);
            assert_eq!(succeeded, &vec!["core".to_string(), "super".to_string()]);
        }
        other => panic!("unexpected error {other:?}: {err:#}"),
    }
    let names: Vec<&str> = seen.iter().map(|repo| repo.name.as_str()).collect();
    assert_eq!(names, vec!["core", "cli", "super"]);
    assert!(matches!(seen[0].result, RepoResult::Rebased { .. }));
    assert!(
        seen[1].to_string().contains("cli has uncommitted changes"),
        "{}",
        seen[1]
    );
    assert_eq!(seen[2].result, RepoResult::UpToDate);
    assert!(tree.join("core/core.txt").exists());
}
