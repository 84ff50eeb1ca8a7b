//! Plan and job orchestration.
//!
//! A plan is a directory of markdown job files. Each job declares a type and
//! its dependencies; the engine computes what is ready, dispatches jobs to a
//! type-specific executor and manages the git worktrees agents run in.
//!
//! - **[`core`]**: Pure logic (job documents, dependency graph, naming, chats).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (filesystem, git, processes, tmux,
//!   containers, LLM commands).
//!
//! Orchestration modules ([`plan`], [`dispatch`], [`run`], [`chat`],
//! [`worktree`], [`lifecycle`], [`rebase`]) combine the two to implement CLI
//! commands.

pub mod chat;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod plan;
pub mod rebase;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worktree;
