//! Plan and job orchestration CLI.
//!
//! Plans are directories of markdown job files under `plans_dir`. The active
//! plan of each checkout is recorded in `.grove/state.yml`, so most commands
//! take an optional `--plan`.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use flow::chat::run_chats;
use flow::core::types::{JobType, OutputMode};
use flow::dispatch::{Collaborators, Dispatcher, complete_job};
use flow::exit_codes;
use flow::io::config::{FlowConfig, config_path, load_config};
use flow::io::container::Docker;
use flow::io::discovery::SubmoduleDiscovery;
use flow::io::git::Git;
use flow::io::llm::{CommandLlm, CommandSummarizer, Summarizer};
use flow::io::session::Tmux;
use flow::lifecycle::{
    FinishAction, FinishContext, FinishSelection, ReviewOutcome, available_actions, check_gate,
    finish, prompt_actions, review,
};
use flow::logging;
use flow::plan::{self, InitOptions, NewJob, Plan};
use flow::rebase::{self, Resume};
use flow::run::{PlanRunOptions, RunEvent, RunMode, run_plan};

#[derive(Parser)]
#[command(name = "flow", version, about = "Plan and job orchestration over git worktrees")]
struct Cli {
    /// Debug tracing for flow on stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage plans and their jobs.
    Plan(PlanArgs),
    /// Work with chat jobs.
    Chat {
        #[command(subcommand)]
        command: ChatCommand,
    },
}

#[derive(Args)]
struct PlanArgs {
    /// Plan name or directory; defaults to the active plan.
    #[arg(long, global = true)]
    plan: Option<String>,
    #[command(subcommand)]
    command: PlanCommand,
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Create a plan directory and make it active.
    Init {
        name: String,
        /// Worktree used by the plan's agent jobs.
        #[arg(long)]
        worktree: Option<String>,
        /// Create the worktree now instead of on first use.
        #[arg(long, requires = "worktree")]
        create_worktree: bool,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        container: Option<String>,
        /// Ecosystem repositories to populate (default: all).
        #[arg(long, value_delimiter = ',')]
        repos: Vec<String>,
        #[arg(long)]
        note_ref: Option<String>,
        #[arg(long)]
        on_start: Option<String>,
        #[arg(long)]
        on_review: Option<String>,
    },
    /// Add a job with the next free number.
    Add(AddArgs),
    /// Run jobs: the given ones, the next ready one, or all ready ones.
    Run {
        jobs: Vec<String>,
        #[arg(long, conflicts_with = "jobs")]
        all: bool,
        /// Continue with other ready jobs after a failure.
        #[arg(long)]
        keep_going: bool,
        #[arg(long)]
        skip_interactive: bool,
    },
    /// List plans with their job progress.
    List {
        #[arg(long)]
        include_finished: bool,
    },
    /// Show job statuses and the ready set.
    Status {
        #[arg(short, long, value_enum, default_value_t = StatusFormat::Text)]
        format: StatusFormat,
    },
    /// Print the dependency graph as Mermaid.
    Graph,
    /// Rebase the plan's worktree onto main, or main onto the worktree.
    Rebase {
        /// `main`, or the worktree name for an integration rebase.
        #[arg(default_value = "main")]
        target: String,
        #[arg(long, conflicts_with = "continue_")]
        abort: bool,
        #[arg(long = "continue")]
        continue_: bool,
    },
    /// Run the review hook and mark the plan in review.
    Review,
    /// Park a plan.
    Hold,
    /// Resume an on-hold plan.
    Unhold,
    /// Clean up a finished plan.
    Finish(FinishArgs),
    /// Make a plan active for this checkout.
    Set { name: String },
    /// Clear the active plan.
    Unset,
    /// Print the active plan.
    Current,
    /// Mark a running or pending_user job completed.
    Complete { job: String },
    /// Edit jobs.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum StatusFormat {
    Text,
    Json,
}

#[derive(Args)]
struct AddArgs {
    #[arg(long)]
    title: String,
    #[arg(long = "type", value_parser = clap::value_parser!(JobType))]
    job_type: JobType,
    /// Dependency filename or id (repeatable).
    #[arg(short = 'd', long = "depends-on")]
    depends_on: Vec<String>,
    #[arg(long)]
    worktree: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Prompt text, or the shell script for shell jobs.
    #[arg(long, default_value = "")]
    prompt: String,
    /// File whose content is referenced by the prompt (repeatable).
    #[arg(long = "source")]
    prompt_source: Vec<String>,
    #[arg(long, value_parser = clap::value_parser!(OutputMode), default_value = "append")]
    output: OutputMode,
    /// Continue the previous agent session.
    #[arg(long = "continue")]
    agent_continue: bool,
    #[arg(long)]
    prepend_dependencies: bool,
}

#[derive(Args)]
struct FinishArgs {
    /// Run every available action without prompting.
    #[arg(short, long)]
    yes: bool,
    #[arg(long)]
    mark_finished: bool,
    #[arg(long)]
    prune_worktree: bool,
    #[arg(long)]
    delete_branch: bool,
    /// Delete the worktree branch on the configured remote.
    #[arg(long)]
    delete_remote: bool,
    #[arg(long)]
    archive: bool,
    #[arg(long)]
    clean_dev_links: bool,
    /// Force worktree removal.
    #[arg(long)]
    force: bool,
}

impl FinishArgs {
    fn selection(&self) -> FinishSelection {
        if self.yes {
            return FinishSelection::All;
        }
        let flagged: Vec<FinishAction> = [
            (self.mark_finished, FinishAction::MarkFinished),
            (self.prune_worktree, FinishAction::PruneWorktree),
            (self.delete_branch, FinishAction::DeleteBranch),
            (self.delete_remote, FinishAction::DeleteRemoteBranch),
            (self.archive, FinishAction::Archive),
            (self.clean_dev_links, FinishAction::CleanDevLinks),
        ]
        .into_iter()
        .filter_map(|(set, action)| set.then_some(action))
        .collect();
        if flagged.is_empty() {
            FinishSelection::Interactive
        } else {
            FinishSelection::Only(flagged)
        }
    }
}

#[derive(Subcommand)]
enum JobsCommand {
    /// Retitle a job and rewrite references to it.
    Rename { job: String, title: String },
    /// Replace a job's dependencies; no arguments clears them.
    UpdateDeps { job: String, deps: Vec<String> },
    /// Move a failed or running job back to pending.
    Reset { job: String },
    /// Give up on a job.
    Abandon {
        job: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum ChatCommand {
    /// Answer chats waiting on the LLM.
    Run {
        /// Chat titles; default is every chat waiting for a reply.
        titles: Vec<String>,
        #[arg(long)]
        plan: Option<String>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let workspace = Workspace::discover()?;
    match cli.command {
        Command::Plan(args) => cmd_plan(&workspace, args),
        Command::Chat {
            command: ChatCommand::Run { titles, plan },
        } => cmd_chat_run(&workspace, plan.as_deref(), &titles),
    }
}

/// Where the command runs and the real collaborators behind it.
struct Workspace {
    cwd: PathBuf,
    repo_root: PathBuf,
    flow: FlowConfig,
    llm: CommandLlm,
    discovery: SubmoduleDiscovery,
    summarizer: Option<CommandSummarizer>,
}

impl Workspace {
    fn discover() -> Result<Self> {
        let cwd = std::env::current_dir().context("read current directory")?;
        let repo_root = Git::new(&cwd)
            .main_root()
            .context("flow must run inside a git repository")?;
        let flow = load_config(&config_path(&repo_root))?;
        let summarizer = flow
            .summary
            .enabled
            .then(|| CommandSummarizer::new(flow.summary.clone(), repo_root.clone()));
        Ok(Self {
            llm: CommandLlm::new(flow.llm.clone()),
            discovery: SubmoduleDiscovery,
            summarizer,
            cwd,
            repo_root,
            flow,
        })
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            llm: &self.llm,
            sessions: &Tmux,
            containers: &Docker,
            discovery: &self.discovery,
            summarizer: self.summarizer.as_ref().map(|s| s as &dyn Summarizer),
        }
    }

    fn plan(&self, reference: Option<&str>) -> Result<Plan> {
        plan::locate(&self.repo_root, &self.flow, &self.cwd, reference)
    }
}

fn cmd_plan(ws: &Workspace, args: PlanArgs) -> Result<()> {
    let reference = args.plan.as_deref();
    let now = Utc::now();
    match args.command {
        PlanCommand::Init {
            name,
            worktree,
            create_worktree,
            model,
            container,
            repos,
            note_ref,
            on_start,
            on_review,
        } => {
            let options = InitOptions {
                worktree,
                create_worktree,
                model,
                container,
                repos,
                note_ref,
                on_start,
                on_review,
            };
            let initialized =
                plan::init(&ws.repo_root, &ws.flow, &ws.discovery, &name, &options, now)?;
            print_lines(&initialized.lines);
            Ok(())
        }
        PlanCommand::Add(add) => cmd_add(ws, reference, add),
        PlanCommand::Run {
            jobs,
            all,
            keep_going,
            skip_interactive,
        } => {
            let mode = if !jobs.is_empty() {
                RunMode::Jobs(jobs)
            } else if all {
                RunMode::All
            } else {
                RunMode::Next
            };
            cmd_run(
                ws,
                reference,
                &mode,
                PlanRunOptions {
                    keep_going,
                    skip_interactive,
                },
            )
        }
        PlanCommand::List { include_finished } => {
            let plans = plan::list_plans(&ws.repo_root, &ws.flow, include_finished)?;
            print!("{}", plan::list_report(&plans));
            Ok(())
        }
        PlanCommand::Status { format } => {
            let plan = ws.plan(reference)?;
            match format {
                StatusFormat::Text => print!("{}", plan::status_report(&plan)?),
                StatusFormat::Json => print!("{}", plan::status_json(&plan)?),
            }
            Ok(())
        }
        PlanCommand::Graph => {
            print!("{}", plan::graph_mermaid(&ws.plan(reference)?)?);
            Ok(())
        }
        PlanCommand::Rebase {
            target,
            abort,
            continue_,
        } => cmd_rebase(ws, reference, &target, abort, continue_),
        PlanCommand::Review => {
            let mut plan = ws.plan(reference)?;
            match review(&mut plan)? {
                ReviewOutcome::AlreadyInReview => {
                    println!("Plan '{}' is already in review. No action taken.", plan.name);
                }
                ReviewOutcome::Reviewed { hook_output } => {
                    if let Some(output) = hook_output.filter(|o| !o.trim().is_empty()) {
                        print!("{output}");
                        println!("✓ on_review hook executed successfully.");
                    }
                    println!("✓ Plan '{}' marked as review", plan.name);
                }
            }
            Ok(())
        }
        PlanCommand::Hold => {
            let mut plan = ws.plan(reference)?;
            if plan::hold(&mut plan)? {
                println!("✓ Plan '{}' is on hold", plan.name);
            } else {
                println!("Plan '{}' is already on hold", plan.name);
            }
            Ok(())
        }
        PlanCommand::Unhold => {
            let mut plan = ws.plan(reference)?;
            if plan::unhold(&mut plan)? {
                println!("✓ Plan '{}' is active again", plan.name);
            } else {
                println!("Plan '{}' is not on hold", plan.name);
            }
            Ok(())
        }
        PlanCommand::Finish(finish_args) => cmd_finish(ws, reference, &finish_args),
        PlanCommand::Set { name } => {
            let plan = ws.plan(Some(&name))?;
            plan::set_active(&ws.cwd, &plan)?;
            println!("✓ Set active plan to: {}", plan.name);
            Ok(())
        }
        PlanCommand::Unset => {
            if plan::unset_active(&ws.cwd)? {
                println!("✓ Cleared active plan");
            } else {
                println!("No active plan set");
            }
            Ok(())
        }
        PlanCommand::Current => {
            match plan::current_active(&ws.cwd)? {
                Some(dir) => println!("{}", display_name(&dir)),
                None => println!("No active plan set"),
            }
            Ok(())
        }
        PlanCommand::Complete { job } => {
            let plan = ws.plan(reference)?;
            let summarizer = ws.summarizer.as_ref().map(|s| s as &dyn Summarizer);
            let job = complete_job(&plan.store(), &job, summarizer, now)?;
            println!("✓ Marked {} as completed", job.filename);
            Ok(())
        }
        PlanCommand::Jobs { command } => cmd_jobs(ws, reference, command),
    }
}

fn cmd_add(ws: &Workspace, reference: Option<&str>, add: AddArgs) -> Result<()> {
    let plan = ws.plan(reference)?;
    let request = NewJob {
        depends_on: add.depends_on,
        worktree: add.worktree,
        model: add.model,
        prompt: add.prompt,
        prompt_source: add.prompt_source,
        output: add.output,
        agent_continue: add.agent_continue,
        prepend_dependencies: add.prepend_dependencies,
        ..NewJob::new(&add.title, add.job_type)
    };
    let added = plan::add_job(&plan, &request, Utc::now())?;
    println!("✓ Created job: {}", added.job.filename);
    if let (Some(dep), Some(worktree)) = (&added.inherited_from, &added.job.worktree) {
        println!("  Inherited worktree '{worktree}' from {dep}");
    }
    Ok(())
}

fn cmd_run(
    ws: &Workspace,
    reference: Option<&str>,
    mode: &RunMode,
    options: PlanRunOptions,
) -> Result<()> {
    let plan = ws.plan(reference)?;
    let dispatcher = Dispatcher::new(&plan, &ws.flow, ws.collaborators());
    let report = run_plan(&dispatcher, mode, options, |event| match event {
        RunEvent::Started(job) => println!("▶ Running {job}"),
        RunEvent::Finished(outcome) => {
            print_lines(&outcome.notes);
            for created in &outcome.created {
                println!("  ✓ Created job: {created}");
            }
            println!("✓ {}: {}", outcome.filename, outcome.status);
        }
        RunEvent::Failed { job, error } => eprintln!("✗ {job}: {error:#}"),
        RunEvent::SkippedInteractive(job) => println!("⏭ Skipping interactive job {job}"),
    })?;
    if report.is_empty() {
        println!("No ready jobs.");
    }
    Ok(())
}

fn cmd_rebase(
    ws: &Workspace,
    reference: Option<&str>,
    target: &str,
    abort: bool,
    continue_: bool,
) -> Result<()> {
    let plan = ws.plan(reference)?;
    if abort || continue_ {
        let action = if abort { Resume::Abort } else { Resume::Continue };
        for repo in rebase::resume(&plan, &ws.flow, &ws.discovery, action)? {
            println!("{repo}");
        }
        return Ok(());
    }
    let report = rebase::rebase(&plan, &ws.flow, &ws.discovery, target, |repo| {
        println!("{repo}");
    })?;
    print_lines(&report.warnings);
    Ok(())
}

fn cmd_finish(ws: &Workspace, reference: Option<&str>, args: &FinishArgs) -> Result<()> {
    let mut plan = ws.plan(reference)?;
    let selection = args.selection();
    check_gate(&plan, &selection)?;
    let ctx = FinishContext {
        flow: &ws.flow,
        discovery: &ws.discovery,
        sessions: &Tmux,
        force: args.force,
    };
    let available = available_actions(&plan, &ctx)?;
    let actions = match selection {
        FinishSelection::All => available,
        FinishSelection::Only(actions) => actions,
        FinishSelection::Interactive => {
            if available.is_empty() {
                Vec::new()
            } else {
                let stdin = std::io::stdin();
                let mut stdout = std::io::stdout();
                let chosen = prompt_actions(&available, &mut stdin.lock(), &mut stdout)?;
                stdout.flush()?;
                chosen
            }
        }
    };
    if actions.is_empty() {
        println!("Nothing to do for plan '{}'.", plan.name);
        return Ok(());
    }
    let report = finish(&mut plan, &actions, &ctx)?;
    print_lines(&report.lines);
    Ok(())
}

fn cmd_jobs(ws: &Workspace, reference: Option<&str>, command: JobsCommand) -> Result<()> {
    let plan = ws.plan(reference)?;
    let now = Utc::now();
    match command {
        JobsCommand::Rename { job, title } => {
            let staged = plan::rename_job(&plan, &job, &title, now)?;
            println!("✓ Renamed {} to {}", staged.old_filename, staged.new_filename);
            for updated in &staged.updated {
                println!("  ✓ Updated references in {}", updated.filename);
            }
        }
        JobsCommand::UpdateDeps { job, deps } => {
            print_lines(&plan::update_deps(&plan, &job, &deps, now)?.lines());
        }
        JobsCommand::Reset { job } => {
            let job = plan::reset_job(&plan, &job, now)?;
            println!("✓ Reset {} to pending", job.filename);
        }
        JobsCommand::Abandon { job, reason } => {
            let job = plan::abandon_job(&plan, &job, reason.as_deref(), now)?;
            println!("✓ Abandoned {}", job.filename);
        }
    }
    Ok(())
}

/// Chats run against the given plan, the active plan, or the standalone chat
/// directory.
fn cmd_chat_run(ws: &Workspace, reference: Option<&str>, titles: &[String]) -> Result<()> {
    let plan = match reference {
        Some(_) => ws.plan(reference)?,
        None => match plan::current_active(&ws.cwd)? {
            Some(dir) => Plan::open(&ws.repo_root, &dir)?,
            None => {
                let dir = ws.repo_root.join(&ws.flow.chat_dir);
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("create {}", dir.display()))?;
                Plan::open(&ws.repo_root, &dir)?
            }
        },
    };
    let dispatcher = Dispatcher::new(&plan, &ws.flow, ws.collaborators());
    let report = run_chats(&dispatcher, titles)?;
    for (title, reason) in &report.selection.skipped {
        println!("  • {title}: skipping ({reason})");
    }
    for outcome in &report.answered {
        println!("✓ {}: answered, waiting for your reply", outcome.filename);
    }
    for filename in &report.waiting_on_user {
        println!("  • {filename}: already answered, waiting for your reply");
    }
    if report.selection.selected.is_empty() {
        println!("No chats are waiting for a reply.");
    }
    Ok(())
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

fn display_name(dir: &Path) -> String {
    dir.file_name()
        .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned())
}
