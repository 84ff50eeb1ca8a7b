//! Side-effecting adapters: filesystem, git, processes and sessions.

pub mod config;
pub mod container;
pub mod discovery;
pub mod git;
pub mod hooks;
pub mod job_store;
pub mod llm;
pub mod logs;
pub mod plan_config;
pub mod process;
pub mod session;
pub mod state;
