//! Dependency graph over a plan's jobs.
//!
//! The graph is derived from `depends_on` every time it is needed and never
//! persisted. Nodes are ordered by filename, which is also the tie-break for
//! every ordering the graph produces.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

use thiserror::Error;

use crate::core::job::Job;
use crate::core::types::{JobStatus, JobType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("circular dependency detected: {}", .path.join(" → "))]
    Cycle { path: Vec<String> },
    #[error("job '{job}' depends on itself")]
    SelfDependency { job: String },
    #[error("duplicate job id '{id}' in {first} and {second}")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub filename: String,
    pub id: String,
    pub title: String,
    pub status: JobStatus,
    pub job_type: JobType,
}

/// A dependency that blocks a job from running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmetDependency {
    /// The reference as written in `depends_on`.
    pub reference: String,
    /// `None` when the reference does not resolve to any job.
    pub status: Option<JobStatus>,
}

impl UnmetDependency {
    pub fn describe_status(&self) -> String {
        match self.status {
            Some(status) => status.to_string(),
            None => "missing".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    /// Resolved dependency edges, dependent -> dependency.
    edges: Vec<Vec<usize>>,
    /// References that resolved to nothing, per node.
    missing: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph, failing fast on self-dependencies, duplicate ids and cycles.
    pub fn build(jobs: &[Job]) -> Result<Self, GraphError> {
        let mut sorted: Vec<&Job> = jobs.iter().collect();
        sorted.sort_by(|a, b| a.filename.cmp(&b.filename));

        let mut by_filename = HashMap::new();
        let mut by_id: HashMap<&str, usize> = HashMap::new();
        for (idx, job) in sorted.iter().enumerate() {
            by_filename.insert(job.filename.clone(), idx);
            if let Some(prev) = by_id.insert(job.id.as_str(), idx) {
                return Err(GraphError::DuplicateId {
                    id: job.id.clone(),
                    first: sorted[prev].filename.clone(),
                    second: job.filename.clone(),
                });
            }
        }

        let mut edges = Vec::with_capacity(sorted.len());
        let mut missing = Vec::with_capacity(sorted.len());
        for (idx, job) in sorted.iter().enumerate() {
            let mut deps = Vec::new();
            let mut unresolved = Vec::new();
            for reference in &job.depends_on {
                let target = by_filename
                    .get(reference.as_str())
                    .or_else(|| by_id.get(reference.as_str()))
                    .copied();
                match target {
                    Some(target) if target == idx => {
                        return Err(GraphError::SelfDependency {
                            job: job.filename.clone(),
                        });
                    }
                    Some(target) => {
                        if !deps.contains(&target) {
                            deps.push(target);
                        }
                    }
                    None => unresolved.push(reference.clone()),
                }
            }
            edges.push(deps);
            missing.push(unresolved);
        }

        let nodes = sorted
            .iter()
            .map(|job| GraphNode {
                filename: job.filename.clone(),
                id: job.id.clone(),
                title: job.title.clone(),
                status: job.status,
                job_type: job.job_type,
            })
            .collect();

        let graph = Self {
            nodes,
            index: by_filename,
            edges,
            missing,
        };
        graph.detect_cycle()?;
        Ok(graph)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, filename: &str) -> Option<&GraphNode> {
        self.index.get(filename).map(|&idx| &self.nodes[idx])
    }

    /// Resolve a filename or id to a node.
    pub fn resolve(&self, reference: &str) -> Option<&GraphNode> {
        self.node(reference)
            .or_else(|| self.nodes.iter().find(|node| node.id == reference))
    }

    pub fn dependencies(&self, filename: &str) -> Vec<&GraphNode> {
        self.index
            .get(filename)
            .map(|&idx| self.edges[idx].iter().map(|&dep| &self.nodes[dep]).collect())
            .unwrap_or_default()
    }

    /// Dependencies of `filename` that are not yet satisfied, in `depends_on` order.
    pub fn unmet_dependencies(&self, filename: &str) -> Vec<UnmetDependency> {
        let Some(&idx) = self.index.get(filename) else {
            return Vec::new();
        };
        let dependent = &self.nodes[idx];
        let mut unmet: Vec<UnmetDependency> = self.edges[idx]
            .iter()
            .map(|&dep| &self.nodes[dep])
            .filter(|dep| !satisfies(dependent, dep))
            .map(|dep| UnmetDependency {
                reference: dep.filename.clone(),
                status: Some(dep.status),
            })
            .collect();
        unmet.extend(self.missing[idx].iter().map(|reference| UnmetDependency {
            reference: reference.clone(),
            status: None,
        }));
        unmet
    }

    pub fn dependencies_met(&self, filename: &str) -> bool {
        self.index.contains_key(filename) && self.unmet_dependencies(filename).is_empty()
    }

    /// Pending jobs whose dependencies are all completed, in filename order.
    pub fn ready_set(&self) -> Vec<&GraphNode> {
        self.nodes
            .iter()
            .filter(|node| node.status == JobStatus::Pending)
            .filter(|node| self.dependencies_met(&node.filename))
            .collect()
    }

    /// Kahn's algorithm with filename order as the tie-break.
    pub fn topological_order(&self) -> Vec<&GraphNode> {
        let mut remaining: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| idx)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = ready.pop_first() {
            order.push(&self.nodes[idx]);
            for (dependent, deps) in self.edges.iter().enumerate() {
                if deps.contains(&idx) {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }

    /// All transitive dependencies of `filename` plus the job itself, in run order.
    pub fn closure(&self, filename: &str) -> Vec<&GraphNode> {
        let Some(&start) = self.index.get(filename) else {
            return Vec::new();
        };
        let mut wanted = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            if wanted.insert(idx) {
                stack.extend(self.edges[idx].iter().copied());
            }
        }
        self.topological_order()
            .into_iter()
            .filter(|node| wanted.contains(&self.index[&node.filename]))
            .collect()
    }

    /// Mermaid `graph TD` rendering with edges dependency --> dependent.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        for node in &self.nodes {
            let _ = writeln!(
                out,
                "    {}[\"{}\"]:::{}",
                mermaid_id(&node.id),
                node.title.replace('"', "'"),
                node.status.as_str()
            );
        }
        for (idx, deps) in self.edges.iter().enumerate() {
            for &dep in deps {
                let _ = writeln!(
                    out,
                    "    {} --> {}",
                    mermaid_id(&self.nodes[dep].id),
                    mermaid_id(&self.nodes[idx].id)
                );
            }
        }
        for (status, style) in [
            (JobStatus::Pending, "fill:#f5f5f5,stroke:#999"),
            (JobStatus::Running, "fill:#fff3cd,stroke:#d39e00"),
            (JobStatus::Completed, "fill:#d4edda,stroke:#28a745"),
            (JobStatus::Failed, "fill:#f8d7da,stroke:#dc3545"),
            (JobStatus::PendingUser, "fill:#e2e3f3,stroke:#6f42c1"),
            (JobStatus::Abandoned, "fill:#eeeeee,stroke:#666,stroke-dasharray:4"),
        ] {
            let _ = writeln!(out, "    classDef {} {}", status.as_str(), style);
        }
        out
    }

    fn detect_cycle(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS; the stack holds (node, next edge index).
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Active;
            while let Some(&mut (node, ref mut next)) = stack.last_mut() {
                if let Some(&dep) = self.edges[node].get(*next) {
                    *next += 1;
                    match marks[dep] {
                        Mark::Active => {
                            let start = stack
                                .iter()
                                .position(|(idx, _)| *idx == dep)
                                .unwrap_or(0);
                            let mut path: Vec<String> = stack[start..]
                                .iter()
                                .map(|(idx, _)| self.nodes[*idx].filename.clone())
                                .collect();
                            path.push(self.nodes[dep].filename.clone());
                            return Err(GraphError::Cycle { path });
                        }
                        Mark::Unvisited => {
                            marks[dep] = Mark::Active;
                            stack.push((dep, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}

/// Whether `dependency` no longer blocks `dependent`.
///
/// Agents may start while their chat briefing is waiting on the user.
fn satisfies(dependent: &GraphNode, dependency: &GraphNode) -> bool {
    match dependency.status {
        JobStatus::Completed => true,
        JobStatus::PendingUser => {
            dependency.job_type == JobType::Chat && dependent.job_type.is_agent()
        }
        _ => false,
    }
}

fn mermaid_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(filename: &str, status: JobStatus, deps: &[&str]) -> Job {
        let id = filename.trim_end_matches(".md");
        let mut job = Job::new(filename, id, id, JobType::Shell);
        job.status = status;
        job.depends_on = deps.iter().map(|d| d.to_string()).collect();
        job
    }

    fn filenames(nodes: Vec<&GraphNode>) -> Vec<&str> {
        nodes.into_iter().map(|n| n.filename.as_str()).collect()
    }

    #[test]
    fn ready_set_unlocks_after_completion() {
        let mut jobs = vec![
            job("01-a.md", JobStatus::Pending, &[]),
            job("02-b.md", JobStatus::Pending, &["01-a.md"]),
            job("03-c.md", JobStatus::Pending, &["01-a.md"]),
        ];
        let graph = DependencyGraph::build(&jobs).expect("graph");
        assert_eq!(filenames(graph.ready_set()), vec!["01-a.md"]);

        jobs[0].status = JobStatus::Completed;
        let graph = DependencyGraph::build(&jobs).expect("graph");
        assert_eq!(filenames(graph.ready_set()), vec!["02-b.md", "03-c.md"]);
    }

    #[test]
    fn references_resolve_by_filename_then_id() {
        let jobs = vec![
            job("01-a.md", JobStatus::Completed, &[]),
            job("02-b.md", JobStatus::Pending, &["01-a"]),
        ];
        let graph = DependencyGraph::build(&jobs).expect("graph");
        assert_eq!(filenames(graph.dependencies("02-b.md")), vec!["01-a.md"]);
        assert!(graph.dependencies_met("02-b.md"));
    }

    #[test]
    fn missing_dependency_blocks_without_failing_build() {
        let jobs = vec![job("01-a.md", JobStatus::Pending, &["00-gone.md"])];
        let graph = DependencyGraph::build(&jobs).expect("graph");
        assert!(graph.ready_set().is_empty());
        let unmet = graph.unmet_dependencies("01-a.md");
        assert_eq!(unmet.len(), 1);
        assert_eq!(unmet[0].describe_status(), "missing");
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let jobs = vec![
            job("01-a.md", JobStatus::Pending, &["02-b.md"]),
            job("02-b.md", JobStatus::Pending, &["01-a.md"]),
        ];
        let err = DependencyGraph::build(&jobs).unwrap_err();
        assert_eq!(
            err.to_string(),
            "circular dependency detected: 01-a.md → 02-b.md → 01-a.md"
        );
    }

    #[test]
    fn self_dependency_is_rejected() {
        let jobs = vec![job("01-a.md", JobStatus::Pending, &["01-a.md"])];
        let err = DependencyGraph::build(&jobs).unwrap_err();
        assert!(matches!(err, GraphError::SelfDependency { .. }));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut second = job("02-b.md", JobStatus::Pending, &[]);
        second.id = "01-a".to_string();
        let jobs = vec![job("01-a.md", JobStatus::Pending, &[]), second];
        let err = DependencyGraph::build(&jobs).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateId { .. }));
    }

    #[test]
    fn topological_order_breaks_ties_by_filename() {
        let jobs = vec![
            job("03-c.md", JobStatus::Pending, &["02-b.md"]),
            job("01-a.md", JobStatus::Pending, &[]),
            job("02-b.md", JobStatus::Pending, &[]),
            job("04-d.md", JobStatus::Pending, &["01-a.md"]),
        ];
        let graph = DependencyGraph::build(&jobs).expect("graph");
        assert_eq!(
            filenames(graph.topological_order()),
            vec!["01-a.md", "02-b.md", "03-c.md", "04-d.md"]
        );
        assert_eq!(filenames(graph.closure("03-c.md")), vec!["02-b.md", "03-c.md"]);
    }

    #[test]
    fn agent_may_follow_chat_waiting_on_user() {
        let mut chat = job("01-chat.md", JobStatus::PendingUser, &[]);
        chat.job_type = JobType::Chat;
        let mut agent = job("02-impl.md", JobStatus::Pending, &["01-chat.md"]);
        agent.job_type = JobType::Agent;
        let shell = job("03-check.md", JobStatus::Pending, &["01-chat.md"]);
        let graph = DependencyGraph::build(&[chat, agent, shell]).expect("graph");
        assert_eq!(filenames(graph.ready_set()), vec!["02-impl.md"]);
    }

    #[test]
    fn mermaid_lists_nodes_and_edges() {
        let jobs = vec![
            job("01-a.md", JobStatus::Completed, &[]),
            job("02-b.md", JobStatus::Pending, &["01-a.md"]),
        ];
        let graph = DependencyGraph::build(&jobs).expect("graph");
        let mermaid = graph.to_mermaid();
        assert!(mermaid.starts_with("graph TD\n"));
        assert!(mermaid.contains("01_a[\"01-a\"]:::completed"));
        assert!(mermaid.contains("01_a --> 02_b"));
    }
}
