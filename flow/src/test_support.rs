//! Scripted collaborators and fixtures for tests.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::core::job::Job;
use crate::core::types::JobType;
use crate::dispatch::{Collaborators, Dispatcher};
use crate::io::config::FlowConfig;
use crate::io::container::ContainerProbe;
use crate::io::discovery::{KnownRepo, WorkspaceDiscovery};
use crate::io::git::Git;
use crate::io::llm::{LlmClient, LlmRequest, Summarizer};
use crate::io::plan_config::{PlanConfig, write_plan_config};
use crate::io::session::{SessionManager, WindowLaunch};
use crate::plan::Plan;

/// Whether `git` can be spawned. Tests that need it return early otherwise.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// A fixed instant so timestamps in assertions are deterministic.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Deterministic job with an id and title derived from the filename.
pub fn job(filename: &str, job_type: JobType) -> Job {
    let stem = filename.trim_end_matches(".md");
    let id = stem
        .split_once('-')
        .filter(|(prefix, _)| prefix.chars().all(|c| c.is_ascii_digit()))
        .map_or(stem, |(_, rest)| rest);
    Job::new(filename, id, id, job_type)
}

/// A temporary git repository with one commit on `main`.
pub struct TestRepo {
    _temp: TempDir,
    path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().canonicalize().expect("canonical tempdir");
        let git = Git::new(&path);
        git.init().expect("git init");
        git.run_checked(&["config", "user.name", "flow-test"])
            .expect("config name");
        git.run_checked(&["config", "user.email", "flow-test@localhost"])
            .expect("config email");
        fs::write(path.join("README.md"), "# test repo\n").expect("readme");
        git.add_all().expect("add");
        git.commit("initial commit").expect("commit");
        Self { _temp: temp, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git(&self) -> Git {
        Git::new(&self.path)
    }

    /// Write `rel` and commit only that file.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) {
        commit_file_in(&self.path, rel, contents, message);
    }
}

/// Write `rel` under `checkout` and commit only that file.
pub fn commit_file_in(checkout: &Path, rel: &str, contents: &str, message: &str) {
    let path = checkout.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir");
    }
    fs::write(&path, contents).expect("write file");
    let git = Git::new(checkout);
    git.add(&[rel]).expect("add");
    git.commit(message).expect("commit");
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// A superproject at `<tmp>/super` with one submodule per name, each cloned
/// from a source repository under `<tmp>/sources`.
pub struct EcosystemRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl EcosystemRepo {
    /// `modules` are `(name, go module)` pairs; a go module name adds a
    /// committed `go.mod` to that repository.
    pub fn new(modules: &[(&str, Option<&str>)]) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().canonicalize().expect("canonical tempdir");
        let sources = base.join("sources");
        let root = base.join("super");

        let git = Git::new(&root);
        git.init().expect("git init");
        fs::write(root.join("README.md"), "# superproject\n").expect("readme");
        git.add(&["README.md"]).expect("add");
        git.commit("initial commit").expect("commit");

        for (name, go_module) in modules {
            let source = sources.join(name);
            Git::new(&source).init().expect("init source");
            commit_file_in(&source, "README.md", &format!("# {name}\n"), "initial commit");
            if let Some(module) = go_module {
                commit_file_in(&source, "go.mod", &format!("module {module}\n"), "add go.mod");
            }
            git.submodule_add(&source.to_string_lossy(), name)
                .expect("submodule add");
        }
        git.commit("add submodules").expect("commit submodules");
        Self { _temp: temp, root }
    }

    /// The superproject's main checkout.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The submodule checkout inside the main checkout.
    pub fn member(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// LLM that replays queued responses and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: RefCell<VecDeque<Result<String, String>>>,
    requests: RefCell<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn push_response(&self, response: &str) {
        self.responses
            .borrow_mut()
            .push_back(Ok(response.to_string()));
    }

    pub fn push_error(&self, message: &str) {
        self.responses
            .borrow_mut()
            .push_back(Err(message.to_string()));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|req| req.prompt.clone())
            .collect()
    }

    pub fn models(&self) -> Vec<Option<String>> {
        self.requests
            .borrow()
            .iter()
            .map(|req| req.model.clone())
            .collect()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, request: &LlmRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        match self.responses.borrow_mut().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted response left")),
        }
    }
}

/// How [`ScriptedSession`] treats new windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Windows open and stay listed.
    #[default]
    Verified,
    /// `new_window` succeeds but the window never shows up.
    Unverified,
    /// `new_window` returns an error.
    Failing,
    /// The window command runs to completion synchronously, then the window closes.
    Execute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedWindow {
    pub session: String,
    pub window: String,
    pub cwd: PathBuf,
    pub command: String,
}

#[derive(Default)]
pub struct ScriptedSession {
    mode: RefCell<SessionMode>,
    sessions: RefCell<HashSet<String>>,
    windows: RefCell<Vec<LaunchedWindow>>,
    keys: RefCell<Vec<(String, String)>>,
}

impl ScriptedSession {
    pub fn set_mode(&self, mode: SessionMode) {
        *self.mode.borrow_mut() = mode;
    }

    pub fn windows(&self) -> Vec<LaunchedWindow> {
        self.windows.borrow().clone()
    }

    pub fn sent_keys(&self) -> Vec<(String, String)> {
        self.keys.borrow().clone()
    }
}

impl SessionManager for ScriptedSession {
    fn has_session(&self, session: &str) -> Result<bool> {
        Ok(self.sessions.borrow().contains(session))
    }

    fn new_session(&self, session: &str, _cwd: &Path) -> Result<()> {
        self.sessions.borrow_mut().insert(session.to_string());
        Ok(())
    }

    fn new_window(
        &self,
        session: &str,
        window: &str,
        cwd: &Path,
        command: &str,
    ) -> Result<WindowLaunch> {
        let mode = *self.mode.borrow();
        if mode == SessionMode::Failing {
            return Err(anyhow!("create window failed: no server running"));
        }
        self.windows.borrow_mut().push(LaunchedWindow {
            session: session.to_string(),
            window: window.to_string(),
            cwd: cwd.to_path_buf(),
            command: command.to_string(),
        });
        match mode {
            SessionMode::Unverified => Ok(WindowLaunch::Unverified),
            SessionMode::Execute => {
                Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(cwd)
                    .status()
                    .map_err(|err| anyhow!("run window command: {err}"))?;
                Ok(WindowLaunch::Verified)
            }
            SessionMode::Verified | SessionMode::Failing => Ok(WindowLaunch::Verified),
        }
    }

    fn window_exists(&self, session: &str, window: &str) -> Result<bool> {
        if *self.mode.borrow() != SessionMode::Verified {
            return Ok(false);
        }
        Ok(self
            .windows
            .borrow()
            .iter()
            .any(|w| w.session == session && w.window == window))
    }

    fn pane_pid(&self, session: &str, window: &str) -> Result<Option<u32>> {
        Ok(self
            .window_exists(session, window)?
            .then(std::process::id))
    }

    fn send_keys(&self, target: &str, text: &str) -> Result<()> {
        self.keys
            .borrow_mut()
            .push((target.to_string(), text.to_string()));
        Ok(())
    }

    fn kill_session(&self, session: &str) -> Result<()> {
        self.sessions.borrow_mut().remove(session);
        Ok(())
    }
}

/// Containers are running unless marked stopped.
#[derive(Default)]
pub struct FakeContainerProbe {
    stopped: RefCell<HashSet<String>>,
}

impl FakeContainerProbe {
    pub fn set_running(&self, container: &str, running: bool) {
        let mut stopped = self.stopped.borrow_mut();
        if running {
            stopped.remove(container);
        } else {
            stopped.insert(container.to_string());
        }
    }
}

impl ContainerProbe for FakeContainerProbe {
    fn is_running(&self, container: &str) -> Result<bool> {
        Ok(!self.stopped.borrow().contains(container))
    }
}

/// Discovery with a fixed repository list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    pub repos: Vec<KnownRepo>,
}

impl WorkspaceDiscovery for StaticDiscovery {
    fn known_repos(&self, _root: &Path) -> Result<Vec<KnownRepo>> {
        Ok(self.repos.clone())
    }
}

/// Summarizer that returns a fixed text.
pub struct FixedSummarizer(pub String);

impl Summarizer for FixedSummarizer {
    fn summarize(&self, _content: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Flow config tuned for fast tests.
pub fn test_flow_config() -> FlowConfig {
    let mut flow = FlowConfig::default();
    flow.agent.command = vec!["true".to_string()];
    flow.agent.poll_interval_ms = 10;
    flow.agent.verify_delay_ms = 0;
    flow.agent.timeout_secs = 10;
    flow.shell.timeout_secs = 10;
    flow
}

enum Root {
    Temp(TempDir),
    Repo(TestRepo),
}

/// A plan named `test-plan` under `<root>/plans` with scripted collaborators.
pub struct PlanFixture {
    _root: Root,
    root: PathBuf,
    pub plan: Plan,
    pub flow: FlowConfig,
    pub llm: ScriptedLlm,
    pub sessions: ScriptedSession,
    pub containers: FakeContainerProbe,
    pub discovery: StaticDiscovery,
}

impl PlanFixture {
    /// Plan in a plain temporary directory (no git).
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().canonicalize().expect("canonical tempdir");
        Self::build(Root::Temp(temp), root)
    }

    /// Plan inside a [`TestRepo`]; `None` when git is unavailable.
    pub fn with_git() -> Option<Self> {
        if !git_available() {
            return None;
        }
        let repo = TestRepo::new();
        let root = repo.path().to_path_buf();
        Some(Self::build(Root::Repo(repo), root))
    }

    fn build(holder: Root, root: PathBuf) -> Self {
        let flow = test_flow_config();
        let dir = flow.plans_root(&root).join("test-plan");
        fs::create_dir_all(&dir).expect("plan dir");
        write_plan_config(&dir, &PlanConfig::default()).expect("plan config");
        let plan = Plan::open(&root, &dir).expect("open plan");
        Self {
            _root: holder,
            root,
            plan,
            flow,
            llm: ScriptedLlm::default(),
            sessions: ScriptedSession::default(),
            containers: FakeContainerProbe::default(),
            discovery: StaticDiscovery::default(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.root
    }

    /// Route agent jobs through `container` and set whether it runs.
    pub fn set_container(&mut self, container: &str, running: bool) {
        self.plan.config.container = Some(container.to_string());
        self.containers.set_running(container, running);
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            llm: &self.llm,
            sessions: &self.sessions,
            containers: &self.containers,
            discovery: &self.discovery,
            summarizer: None,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.plan, &self.flow, self.collaborators())
    }

    pub fn write(&self, job: &mut Job) {
        self.plan.store().save(job, fixed_now()).expect("write job");
    }

    pub fn load(&self, reference: &str) -> Job {
        self.plan.store().load_job(reference).expect("load job")
    }
}

impl Default for PlanFixture {
    fn default() -> Self {
        Self::new()
    }
}
