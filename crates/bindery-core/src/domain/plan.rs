//! Plan - planner input with local keys.
//!
//! Planner は job の集合を `key` で書き、`depends_on` も key で参照します。
//! `Plan::resolve` で ID を割り当て、`NewJob` に変換します。
//!
//! The queue does not check the graph at claim time: a dangling dependency
//! just never becomes `done`. Checking here, once, at enqueue time is the
//! planner's side of that contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::job::{Artifacts, DEFAULT_MAX_ATTEMPTS, NewJob};
use super::step::Step;

/// One job in a plan document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedJob {
    pub key: String,
    pub step: Step,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Keys of other jobs in the same plan.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Ids of jobs enqueued earlier (already in the store).
    #[serde(default)]
    pub depends_on_ids: Vec<JobId>,
    #[serde(default)]
    pub inputs: Artifacts,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// A planner document for one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub book_id: String,
    pub jobs: Vec<PlannedJob>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate job key: {0}")]
    DuplicateKey(String),

    #[error("job {job} depends on unknown key {missing}")]
    UnknownDependency { job: String, missing: String },

    #[error("job {0} depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("job {0}: max_attempts must be at least 1")]
    ZeroAttempts(String),
}

/// Plan resolved into store-ready jobs.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub jobs: Vec<NewJob>,
    pub ids: HashMap<String, JobId>,
}

impl Plan {
    /// Validate the graph and assign ids.
    ///
    /// `next_id` is called once per job, in document order.
    pub fn resolve(self, mut next_id: impl FnMut() -> JobId) -> Result<ResolvedPlan, PlanError> {
        let mut ids = HashMap::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if ids.insert(job.key.clone(), next_id()).is_some() {
                return Err(PlanError::DuplicateKey(job.key.clone()));
            }
        }

        if let Some(job) = self.jobs.iter().find(|job| job.max_attempts == Some(0)) {
            return Err(PlanError::ZeroAttempts(job.key.clone()));
        }

        let mut graph = DependencyGraph::default();
        for job in &self.jobs {
            for dep in &job.depends_on {
                if *dep == job.key {
                    return Err(PlanError::SelfDependency(job.key.clone()));
                }
                if !ids.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        job: job.key.clone(),
                        missing: dep.clone(),
                    });
                }
                graph.add_dependency(&job.key, dep);
            }
        }
        if let Some(cycle) = graph.detect_cycle() {
            return Err(PlanError::Cycle(cycle));
        }

        let book_id = self.book_id;
        let jobs = self
            .jobs
            .into_iter()
            .map(|job| {
                let mut depends_on: Vec<JobId> =
                    job.depends_on.iter().map(|key| ids[key]).collect();
                depends_on.extend(job.depends_on_ids);
                NewJob {
                    id: Some(ids[&job.key]),
                    book_id: book_id.clone(),
                    chapter: job.chapter,
                    section: job.section,
                    step: job.step,
                    priority: job.priority,
                    depends_on,
                    input_artifacts: job.inputs,
                    max_attempts: job.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                }
            })
            .collect();

        Ok(ResolvedPlan { jobs, ids })
    }
}

/// Forward edges only: key -> keys it waits for.
#[derive(Default)]
struct DependencyGraph<'a> {
    edges: HashMap<&'a str, Vec<&'a str>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl<'a> DependencyGraph<'a> {
    fn add_dependency(&mut self, job: &'a str, depends_on: &'a str) {
        self.edges.entry(job).or_default().push(depends_on);
    }

    /// Returns the first cycle found (closed path, first node repeated last).
    ///
    /// Iterative DFS with white/gray/black coloring; O(V + E).
    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut color: HashMap<&str, Color> = HashMap::new();
        let mut starts: Vec<&str> = self.edges.keys().copied().collect();
        starts.sort_unstable();

        for start in starts {
            if color.contains_key(start) {
                continue;
            }
            // (node, index of next edge to explore)
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            color.insert(start, Color::Gray);

            while let Some((node, next)) = stack.last_mut() {
                let deps = self.edges.get(*node).map(Vec::as_slice).unwrap_or(&[]);
                let Some(&dep) = deps.get(*next) else {
                    color.insert(*node, Color::Black);
                    stack.pop();
                    continue;
                };
                *next += 1;
                match color.get(dep) {
                    Some(Color::Gray) => {
                        let pos = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[pos..].iter().map(|(n, _)| n.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        color.insert(dep, Color::Gray);
                        stack.push((dep, 0));
                    }
                }
            }
        }
        None
    }
}
