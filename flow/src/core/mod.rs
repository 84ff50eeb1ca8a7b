//! Deterministic, pure logic for plans and jobs.
//!
//! Core modules are free of I/O side effects. They operate on in-memory job
//! documents and return deterministic outputs suitable for tests.

pub mod chat;
pub mod frontmatter;
pub mod generated;
pub mod go_work;
pub mod graph;
pub mod job;
pub mod naming;
pub mod output;
pub mod rename;
pub mod types;
