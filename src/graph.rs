// src/graph.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::prelude::StableDiGraph;
use thiserror::Error;
use tracing::warn;

use crate::handler::Handler;

/// The fixed lifecycle checkpoints, in pipeline order. They partition a
/// dispatch into phases; handlers registered relative to them stay pinned
/// inside one phase gap.
pub static LIFECYCLE_ANCHORS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["check", "prepare", "request", "send"]);

pub fn is_anchor(name: &str) -> bool {
    LIFECYCLE_ANCHORS.iter().any(|a| *a == name)
}

fn anchor_preceding(name: &str) -> Option<&'static str> {
    let pos = LIFECYCLE_ANCHORS.iter().position(|a| *a == name)?;
    if pos == 0 {
        None
    } else {
        Some(LIFECYCLE_ANCHORS[pos - 1])
    }
}

fn anchor_following(name: &str) -> Option<&'static str> {
    let pos = LIFECYCLE_ANCHORS.iter().position(|a| *a == name)?;
    LIFECYCLE_ANCHORS.get(pos + 1).copied()
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("handler `{0}` is already registered")]
    DuplicateHandler(String),
    #[error("dependency cycle among handlers: {}", .members.join(", "))]
    CyclicDependency { members: Vec<String> },
}

/// Named handler nodes plus a name-keyed edge table. Edges may name
/// handlers that are not registered (optional features); those edges are
/// skipped by the ordering pass until the name appears.
pub struct DependencyGraph {
    nodes: HashMap<String, Arc<dyn Handler>>,
    /// from -> set of names that must run after `from`
    edges: HashMap<String, HashSet<String>>,
    /// (target, subject): subject inherits target's anchor edges at the
    /// next build in which target is registered, then the record is
    /// consumed
    pending: Vec<(String, String)>,
    /// registration order, so builds are deterministic
    insertion: Vec<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            pending: Vec::new(),
            insertion: Vec::new(),
        };
        // the synthetic anchor chain, installed exactly once
        for pair in LIFECYCLE_ANCHORS.windows(2) {
            graph.edge(pair[0], pair[1]);
        }
        graph
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), GraphError> {
        let name = name.into();
        if self.nodes.contains_key(&name) {
            return Err(GraphError::DuplicateHandler(name));
        }
        self.insertion.push(name.clone());
        self.nodes.insert(name, handler);
        Ok(())
    }

    /// Delete a node and scrub it from every edge set. Lifecycle anchors
    /// are permanent and removal requests for them are ignored.
    pub fn remove_node(&mut self, name: &str) {
        if is_anchor(name) {
            warn!("refusing to remove lifecycle anchor `{}`", name);
            return;
        }
        self.nodes.remove(name);
        self.insertion.retain(|n| n != name);
        self.edges.remove(name);
        for set in self.edges.values_mut() {
            set.remove(name);
        }
        self.pending.retain(|(_, subject)| subject != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn edge(&mut self, from: &str, to: &str) {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|set| set.contains(to))
    }

    /// Declare that `subject` runs before `target`. Against an anchor the
    /// subject is also pinned after the preceding anchor, so it lands
    /// inside that one phase gap. Against a non-anchor the anchor
    /// position is not yet known and resolution is deferred to build
    /// time.
    pub fn before(&mut self, subject: &str, target: &str) {
        self.edge(subject, target);
        if is_anchor(target) {
            if let Some(prev) = anchor_preceding(target) {
                self.edge(prev, subject);
            }
        } else if !is_anchor(subject) {
            self.pending.push((target.to_string(), subject.to_string()));
        }
    }

    /// Mirror of [`before`](Self::before): `subject` runs after `target`.
    pub fn after(&mut self, subject: &str, target: &str) {
        self.edge(target, subject);
        if is_anchor(target) {
            if let Some(next) = anchor_following(target) {
                self.edge(subject, next);
            }
        } else if !is_anchor(subject) {
            self.pending.push((target.to_string(), subject.to_string()));
        }
    }

    /// Fire the deferred anchor resolutions whose target is registered:
    /// each subject copies the anchor edges its target currently has.
    /// Iterated to a fixpoint so a chain of relative declarations
    /// registered in one batch propagates through its whole depth.
    /// Fired records are consumed; records whose target is still missing
    /// stay for a later build.
    fn resolve_anchors(&mut self) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(target, _)| self.nodes.contains_key(target));
        self.pending = waiting;

        loop {
            let mut new_edges: Vec<(String, String)> = Vec::new();
            for (target, subject) in &ready {
                for anchor in LIFECYCLE_ANCHORS.iter() {
                    if self.has_edge(anchor, target) && !self.has_edge(anchor, subject) {
                        new_edges.push((anchor.to_string(), subject.clone()));
                    }
                    if self.has_edge(target, anchor) && !self.has_edge(subject, anchor) {
                        new_edges.push((subject.clone(), anchor.to_string()));
                    }
                }
            }
            if new_edges.is_empty() {
                break;
            }
            for (from, to) in new_edges {
                self.edge(&from, &to);
            }
        }
    }

    /// Produce the execution order: resolve deferred anchors, then run a
    /// topological sort over the edges whose endpoints are both
    /// registered (dangling names are skipped, never fatal). A cycle
    /// fails the build naming every member.
    pub fn build(&mut self) -> Result<Vec<(String, Arc<dyn Handler>)>, GraphError> {
        self.resolve_anchors();

        let mut graph: StableDiGraph<String, ()> = StableDiGraph::new();
        let mut index_of = HashMap::new();
        for name in &self.insertion {
            let idx = graph.add_node(name.clone());
            index_of.insert(name.clone(), idx);
        }
        for (from, tos) in &self.edges {
            if let Some(&i) = index_of.get(from) {
                for to in tos {
                    if let Some(&j) = index_of.get(to) {
                        graph.add_edge(i, j, ());
                    }
                }
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order
                .into_iter()
                .map(|ix| {
                    let name = graph[ix].clone();
                    let handler = self.nodes[&name].clone();
                    (name, handler)
                })
                .collect()),
            Err(_) => {
                let mut members: Vec<String> = tarjan_scc(&graph)
                    .into_iter()
                    .filter(|scc| {
                        scc.len() > 1 || (scc.len() == 1 && graph.contains_edge(scc[0], scc[0]))
                    })
                    .flatten()
                    .map(|ix| graph[ix].clone())
                    .collect();
                members.sort();
                Err(GraphError::CyclicDependency { members })
            }
        }
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.insertion)
            .field("pending", &self.pending.len())
            .finish()
    }
}
