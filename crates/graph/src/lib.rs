//! Keel graph: builds the operand dependency DAG once at startup.
//!
//! Names are resolved to indices at build time. Nodes are stored in an arena
//! in topological order, grouped into layers: layer 0 holds operands with no
//! dependencies, layer k holds operands whose dependencies all sit in layers
//! below k. Within a layer, declaration order is kept.

#![forbid(unsafe_code)]

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use keel_core::{Operand, StorageCluster};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::debug;

/// Validation failures. Fatal; never retried automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate operand name: {0}")]
    DuplicateOperand(String),
    #[error("operand {operand} requires unknown operand {dependency}")]
    UnknownDependency { operand: String, dependency: String },
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
}

pub type Idx = usize;

pub struct Node<R: Sync + ?Sized> {
    operand: Arc<dyn Operand<R>>,
    deps: SmallVec<[Idx; 4]>,
    dependents: SmallVec<[Idx; 4]>,
    layer: usize,
}

impl<R: Sync + ?Sized> Node<R> {
    pub fn operand(&self) -> &Arc<dyn Operand<R>> {
        &self.operand
    }

    pub fn name(&self) -> &str {
        self.operand.name()
    }

    /// Arena indices of the operands this one requires.
    pub fn deps(&self) -> &[Idx] {
        &self.deps
    }

    /// Arena indices of the operands that require this one.
    pub fn dependents(&self) -> &[Idx] {
        &self.dependents
    }

    pub fn layer(&self) -> usize {
        self.layer
    }
}

/// Immutable, validated dependency graph; safe to share across invocations.
pub struct DependencyGraph<R: Sync + ?Sized = StorageCluster> {
    nodes: Vec<Node<R>>,
    layers: Vec<Range<Idx>>,
}

impl<R: Sync + ?Sized> fmt::Debug for DependencyGraph<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyGraph").field("layers", &self.layer_names()).finish()
    }
}

impl<R: Sync + ?Sized> DependencyGraph<R> {
    pub fn build(operands: Vec<Arc<dyn Operand<R>>>) -> Result<Self, GraphError> {
        let n = operands.len();
        let mut by_name: FxHashMap<&str, Idx> = FxHashMap::default();
        for (i, op) in operands.iter().enumerate() {
            if by_name.insert(op.name(), i).is_some() {
                return Err(GraphError::DuplicateOperand(op.name().to_string()));
            }
        }

        // Dependencies by declaration index, deduplicated.
        let mut deps: Vec<SmallVec<[Idx; 4]>> = Vec::with_capacity(n);
        for op in operands.iter() {
            let mut d = SmallVec::new();
            for req in op.requires() {
                let j = *by_name.get(req.as_str()).ok_or_else(|| GraphError::UnknownDependency {
                    operand: op.name().to_string(),
                    dependency: req.clone(),
                })?;
                if !d.contains(&j) {
                    d.push(j);
                }
            }
            deps.push(d);
        }
        let mut dependents: Vec<SmallVec<[Idx; 4]>> = vec![SmallVec::new(); n];
        for (i, d) in deps.iter().enumerate() {
            for &j in d {
                dependents[j].push(i);
            }
        }

        // Kahn, one round per layer.
        let mut pending: Vec<usize> = deps.iter().map(|d| d.len()).collect();
        let mut placed = vec![false; n];
        let mut order: Vec<Idx> = Vec::with_capacity(n);
        let mut layer_of = vec![0usize; n];
        let mut layers = Vec::new();
        loop {
            let ready: Vec<Idx> = (0..n).filter(|&i| !placed[i] && pending[i] == 0).collect();
            if ready.is_empty() {
                break;
            }
            let start = order.len();
            for &i in &ready {
                placed[i] = true;
                layer_of[i] = layers.len();
                order.push(i);
            }
            for &i in &ready {
                for &k in &dependents[i] {
                    pending[k] -= 1;
                }
            }
            layers.push(start..order.len());
        }

        if order.len() < n {
            let cycle = find_cycle(&deps, &placed);
            let cycle = cycle.into_iter().map(|i| operands[i].name().to_string()).collect();
            return Err(GraphError::CycleDetected { cycle });
        }

        let mut pos = vec![0usize; n];
        for (p, &i) in order.iter().enumerate() {
            pos[i] = p;
        }
        let mut nodes = Vec::with_capacity(n);
        for &i in &order {
            nodes.push(Node {
                operand: Arc::clone(&operands[i]),
                deps: deps[i].iter().map(|&j| pos[j]).collect(),
                dependents: dependents[i].iter().map(|&j| pos[j]).collect(),
                layer: layer_of[i],
            });
        }
        let graph = Self { nodes, layers };
        debug!(operands = n, layers = graph.layers.len(), "dependency graph built");
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn node(&self, idx: Idx) -> Option<&Node<R>> {
        self.nodes.get(idx)
    }

    pub fn nodes(&self) -> &[Node<R>] {
        &self.nodes
    }

    /// Nodes of layer `i`, in declaration order; `None` past the last layer.
    pub fn layer(&self, i: usize) -> Option<&[Node<R>]> {
        self.layers.get(i).map(|r| &self.nodes[r.clone()])
    }

    pub fn layer_names(&self) -> Vec<Vec<&str>> {
        self.layers.iter().map(|r| self.nodes[r.clone()].iter().map(|n| n.name()).collect()).collect()
    }

    /// Lookup by name. For tooling; execution only uses indices.
    pub fn index_of(&self, name: &str) -> Option<Idx> {
        self.nodes.iter().position(|n| n.name() == name)
    }

    /// Graphviz rendering; edges point from dependency to dependent.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph operands {\n");
        for (i, r) in self.layers.iter().enumerate() {
            out.push_str(&format!("  subgraph layer_{} {{ rank=same;", i));
            for n in &self.nodes[r.clone()] {
                out.push_str(&format!(" \"{}\";", n.name()));
            }
            out.push_str(" }\n");
        }
        for n in &self.nodes {
            for &d in n.deps() {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", self.nodes[d].name(), n.name()));
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Every unplaced node still has an unplaced dependency, so walking those
/// edges from any unplaced node must revisit a node.
fn find_cycle(deps: &[SmallVec<[Idx; 4]>], placed: &[bool]) -> Vec<Idx> {
    let Some(start) = placed.iter().position(|p| !p) else { return Vec::new() };
    let mut path: Vec<Idx> = Vec::new();
    let mut seen_at: FxHashMap<Idx, usize> = FxHashMap::default();
    let mut cur = start;
    loop {
        if let Some(&at) = seen_at.get(&cur) {
            let mut cycle = path[at..].to_vec();
            cycle.push(cur);
            return cycle;
        }
        seen_at.insert(cur, path.len());
        path.push(cur);
        match deps[cur].iter().copied().find(|&d| !placed[d]) {
            Some(next) => cur = next,
            None => return path,
        }
    }
}
