//! Id-keyed adjacency-list graph.
//!
//! [`Graph`] is the in-memory structure behind the ontology DAG, the meta
//! graph and the system-graph results. Nodes live in an arena keyed by id, so
//! adding the same id twice keeps a single node. Each node owns a forward and
//! a backward list of `(predicate, neighbor id)` pairs, and statements are
//! de-duplicated on `(start, predicate, end)`.
//!
//! # Usage
//!
//! ```ignore
//! use twingraph::graph::Graph;
//!
//! let mut graph: Graph<&str, &str> = Graph::new();
//! graph.add_node("AHU1", "AirHandlingUnit");
//! graph.add_node("VAV1", "VAV");
//! graph.add_statement("AHU1", "feeds", "VAV1");
//!
//! assert_eq!(graph.follow("AHU1"), &[("feeds", "VAV1".to_string())]);
//! assert_eq!(graph.back("VAV1"), &[("feeds", "AHU1".to_string())]);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

/// A directed, labeled edge between two node ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement<P> {
    pub start: String,
    pub predicate: P,
    pub end: String,
}

/// Adjacency-list graph with arena-by-id node identity.
#[derive(Debug, Clone)]
pub struct Graph<N, P> {
    nodes: BTreeMap<String, N>,
    forward: HashMap<String, Vec<(P, String)>>,
    backward: HashMap<String, Vec<(P, String)>>,
    statements: Vec<Statement<P>>,
    seen: HashSet<(String, P, String)>,
}

impl<N, P> Default for Graph<N, P> {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            forward: HashMap::new(),
            backward: HashMap::new(),
            statements: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl<N, P> Graph<N, P>
where
    P: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node under `id`. Returns `false` (and keeps the existing node)
    /// when the id is already present.
    pub fn add_node(&mut self, id: impl Into<String>, node: N) -> bool {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, node);
        true
    }

    /// Returns the node under `id`, creating it with `make` on first sight.
    pub fn get_or_add_node(&mut self, id: &str, make: impl FnOnce() -> N) -> &mut N {
        self.nodes.entry(id.to_string()).or_insert_with(make)
    }

    pub fn node(&self, id: &str) -> Option<&N> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut N> {
        self.nodes.get_mut(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &N)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records `start --predicate--> end`. Returns `false` for a duplicate.
    pub fn add_statement(&mut self, start: &str, predicate: P, end: &str) -> bool {
        let key = (start.to_string(), predicate.clone(), end.to_string());
        if !self.seen.insert(key) {
            return false;
        }
        self.forward
            .entry(start.to_string())
            .or_default()
            .push((predicate.clone(), end.to_string()));
        self.backward
            .entry(end.to_string())
            .or_default()
            .push((predicate.clone(), start.to_string()));
        self.statements.push(Statement {
            start: start.to_string(),
            predicate,
            end: end.to_string(),
        });
        true
    }

    pub fn contains_statement(&self, start: &str, predicate: &P, end: &str) -> bool {
        self.seen
            .contains(&(start.to_string(), predicate.clone(), end.to_string()))
    }

    /// Outgoing `(predicate, target)` pairs in insertion order.
    pub fn follow(&self, id: &str) -> &[(P, String)] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Incoming `(predicate, source)` pairs in insertion order.
    pub fn back(&self, id: &str) -> &[(P, String)] {
        self.backward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All statements in insertion order.
    pub fn statements(&self) -> &[Statement<P>] {
        &self.statements
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_identity_by_id() {
        let mut graph: Graph<u32, &str> = Graph::new();
        assert!(graph.add_node("a", 1));
        assert!(!graph.add_node("a", 2));
        assert_eq!(graph.node("a"), Some(&1));
        assert_eq!(graph.node_count(), 1);

        *graph.get_or_add_node("a", || 0) += 10;
        *graph.get_or_add_node("b", || 5) += 1;
        assert_eq!(graph.node("a"), Some(&11));
        assert_eq!(graph.node("b"), Some(&6));
    }

    #[test]
    fn test_statements_deduplicated() {
        let mut graph: Graph<(), &str> = Graph::new();
        assert!(graph.add_statement("a", "feeds", "b"));
        assert!(!graph.add_statement("a", "feeds", "b"));
        assert!(graph.add_statement("a", "isPartOf", "b"));

        assert_eq!(graph.statement_count(), 2);
        assert_eq!(graph.follow("a").len(), 2);
        assert_eq!(graph.back("b").len(), 2);
        assert!(graph.contains_statement("a", &"feeds", "b"));
        assert!(!graph.contains_statement("b", &"feeds", "a"));
    }

    #[test]
    fn test_missing_adjacency_is_empty() {
        let graph: Graph<(), String> = Graph::new();
        assert!(graph.follow("nope").is_empty());
        assert!(graph.back("nope").is_empty());
        assert!(graph.is_empty());
    }
}
