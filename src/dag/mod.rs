//! Arena-based pipeline graph: tasks as indices, dependencies as index
//! vectors, topological order computed once at construction.

pub mod parse;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::task::TaskType;

pub use parse::{parse_duration, ParseError};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DagError {
    #[error("pipeline has no tasks")]
    Empty,
    #[error("duplicate task id \"{0}\"")]
    DuplicateNode(String),
    #[error("edge references unknown task \"{0}\"")]
    UnknownNode(String),
    #[error("task \"{0}\" depends on itself")]
    SelfEdge(String),
    #[error("pipeline contains a cycle")]
    Cycle,
}

/// One parsed task declaration: identity, type tag and raw options.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskNode {
    pub dot_id: String,
    pub task_type: TaskType,
    pub timeout: Option<Duration>,
    pub options: BTreeMap<String, String>,
}

/// A validated, acyclic pipeline.
///
/// Node order matches declaration order in the source; `parents[i]` holds
/// the declared input order for node `i`, which is the order inputs are
/// presented to the task at execution time.
#[derive(Clone, Debug)]
pub struct Pipeline {
    nodes: Vec<TaskNode>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Pipeline {
    pub fn new(nodes: Vec<TaskNode>, edges: &[(String, String)]) -> Result<Self, DagError> {
        if nodes.is_empty() {
            return Err(DagError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.dot_id.as_str(), i).is_some() {
                return Err(DagError::DuplicateNode(node.dot_id.clone()));
            }
        }

        let mut parents = vec![Vec::new(); nodes.len()];
        let mut children = vec![Vec::new(); nodes.len()];
        for (source, target) in edges {
            let from = *index
                .get(source.as_str())
                .ok_or_else(|| DagError::UnknownNode(source.clone()))?;
            let to = *index
                .get(target.as_str())
                .ok_or_else(|| DagError::UnknownNode(target.clone()))?;
            if from == to {
                return Err(DagError::SelfEdge(source.clone()));
            }
            parents[to].push(from);
            children[from].push(to);
        }

        let order = topological_sort(&parents, &children)?;
        Ok(Self {
            nodes,
            parents,
            children,
            order,
        })
    }

    /// Parse a pipeline from dot-syntax source. See [`parse`].
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        parse::parse(source)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &TaskNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn parents_of(&self, index: usize) -> &[usize] {
        &self.parents[index]
    }

    pub fn children_of(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    /// Cached topological order, stable w.r.t. source order on ties.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Nodes with no successors, ordered by dot id ascending. The run's
    /// final results follow this order.
    pub fn leaves(&self) -> Vec<usize> {
        let mut leaves: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.children[i].is_empty())
            .collect();
        leaves.sort_by(|&a, &b| self.nodes[a].dot_id.cmp(&self.nodes[b].dot_id));
        leaves
    }
}

/// Kahn's algorithm over the index arena. The ready set is kept ordered by
/// node index so ties resolve to source order deterministically.
fn topological_sort(
    parents: &[Vec<usize>],
    children: &[Vec<usize>],
) -> Result<Vec<usize>, DagError> {
    let mut pending: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = pending
        .iter()
        .enumerate()
        .filter(|(_, &count)| count == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(parents.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &child in &children[next] {
            pending[child] -= 1;
            if pending[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() != parents.len() {
        return Err(DagError::Cycle);
    }
    Ok(order)
}
