//! Component dependency graph: activation order and cycle analysis.
//!
//! An edge `a -> b` means component `a` has a reference satisfied by a service
//! `b` publishes. Only mandatory edges take part in ordering and cycle detection.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

use super::description::ComponentMetadata;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub reference: String,
    pub mandatory: bool,
    pub dynamic: bool,
}

/// A strongly connected group of components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleInfo {
    pub members: Vec<String>,
    /// One concrete loop through the members, first name repeated at the end.
    pub path: Vec<String>,
    /// A member whose mandatory references are all dynamic; activating it
    /// without those references lets the rest of the cycle resolve.
    pub breaker: Option<String>,
}

impl CycleInfo {
    pub fn is_breakable(&self) -> bool {
        self.breaker.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: BTreeMap<String, usize>,
    edges: Vec<Vec<(usize, DependencyEdge)>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph over `components`, linking each reference to every other
    /// component that publishes the referenced interface.
    pub fn from_metadata<'a>(components: impl IntoIterator<Item = &'a ComponentMetadata>) -> Self {
        let components: Vec<&ComponentMetadata> = components.into_iter().collect();
        let mut graph = Self::new();
        for meta in &components {
            graph.add_node(&meta.name);
        }
        for meta in &components {
            for reference in &meta.references {
                for provider in &components {
                    if provider.name != meta.name
                        && provider
                            .provided_interfaces()
                            .iter()
                            .any(|i| *i == reference.interface)
                    {
                        graph.add_edge(DependencyEdge {
                            from: meta.name.clone(),
                            to: provider.name.clone(),
                            reference: reference.name.clone(),
                            mandatory: reference.cardinality.is_mandatory(),
                            dynamic: reference.is_dynamic(),
                        });
                    }
                }
            }
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_owned());
        self.index.insert(name.to_owned(), i);
        self.edges.push(Vec::new());
        i
    }

    pub fn add_edge(&mut self, edge: DependencyEdge) {
        let from = self.add_node(&edge.from);
        let to = self.add_node(&edge.to);
        self.edges[from].push((to, edge));
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter().flatten().map(|(_, e)| e)
    }

    fn mandatory_adjacency(&self) -> Vec<Vec<usize>> {
        self.edges
            .iter()
            .map(|out| {
                let mut targets: Vec<usize> = out
                    .iter()
                    .filter(|(_, e)| e.mandatory)
                    .map(|(to, _)| *to)
                    .collect();
                targets.sort_unstable();
                targets.dedup();
                targets
            })
            .collect()
    }

    /// Providers before consumers; fails on the first mandatory cycle.
    pub fn activation_order(&self) -> Result<Vec<String>, GraphError> {
        let adj = self.mandatory_adjacency();
        if let Some(path) = detect_cycle_with_path(&self.names, &adj, None) {
            return Err(GraphError::CycleDetected { path });
        }
        Ok(self.kahn(&adj))
    }

    /// Like [`activation_order`](Self::activation_order), but members of cycles
    /// are appended in insertion order instead of failing.
    pub fn activation_order_lenient(&self) -> Vec<String> {
        self.kahn(&self.mandatory_adjacency())
    }

    fn kahn(&self, adj: &[Vec<usize>]) -> Vec<String> {
        // Reverse edges so that dependencies come first.
        let mut dependents = vec![Vec::<usize>::new(); self.names.len()];
        let mut indeg = vec![0usize; self.names.len()];
        for (consumer, targets) in adj.iter().enumerate() {
            for &provider in targets {
                dependents[provider].push(consumer);
                indeg[consumer] += 1;
            }
        }

        let mut q: VecDeque<usize> = indeg
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut placed = vec![false; self.names.len()];
        let mut order = Vec::with_capacity(self.names.len());
        while let Some(u) = q.pop_front() {
            placed[u] = true;
            order.push(self.names[u].clone());
            for &w in &dependents[u] {
                indeg[w] -= 1;
                if indeg[w] == 0 {
                    q.push_back(w);
                }
            }
        }
        for (i, name) in self.names.iter().enumerate() {
            if !placed[i] {
                order.push(name.clone());
            }
        }
        order
    }

    /// Every mandatory cycle, as strongly connected components.
    pub fn cycles(&self) -> Vec<CycleInfo> {
        let adj = self.mandatory_adjacency();
        tarjan(&adj)
            .into_iter()
            .filter(|scc| scc.len() > 1 || adj[scc[0]].contains(&scc[0]))
            .map(|mut scc| {
                scc.sort_unstable();
                let members: Vec<String> = scc.iter().map(|&i| self.names[i].clone()).collect();
                let path = detect_cycle_with_path(&self.names, &adj, Some(&scc)).unwrap_or_default();
                let breaker = scc
                    .iter()
                    .copied()
                    .find(|&i| {
                        self.edges[i]
                            .iter()
                            .filter(|(_, e)| e.mandatory)
                            .all(|(_, e)| e.dynamic)
                    })
                    .map(|i| self.names[i].clone());
                CycleInfo {
                    members,
                    path,
                    breaker,
                }
            })
            .collect()
    }
}

/// Detect cycles in the dependency graph using DFS with path tracking.
/// When `within` is given, only those nodes are visited.
fn detect_cycle_with_path(
    names: &[String],
    adj: &[Vec<usize>],
    within: Option<&[usize]>,
) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White, // unvisited
        Gray,  // on current path
        Black, // finished
    }

    fn dfs(
        node: usize,
        names: &[String],
        adj: &[Vec<usize>],
        allowed: &[bool],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &neighbor in &adj[node] {
            if !allowed[neighbor] {
                continue;
            }
            match colors[neighbor] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == neighbor) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&i| names[i].clone()).collect();
                        cycle.push(names[neighbor].clone());
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(neighbor, names, adj, allowed, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let allowed: Vec<bool> = match within {
        Some(nodes) => {
            let mut allowed = vec![false; names.len()];
            for &n in nodes {
                allowed[n] = true;
            }
            allowed
        }
        None => vec![true; names.len()],
    };
    let mut colors = vec![Color::White; names.len()];
    let mut path = Vec::new();

    for i in 0..names.len() {
        if allowed[i] && colors[i] == Color::White {
            if let Some(cycle) = dfs(i, names, adj, &allowed, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Tarjan's strongly connected components.
fn tarjan(adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct State<'a> {
        adj: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        out: Vec<Vec<usize>>,
    }

    fn connect(s: &mut State<'_>, v: usize) {
        s.index[v] = Some(s.next);
        s.low[v] = s.next;
        s.next += 1;
        s.stack.push(v);
        s.on_stack[v] = true;

        for &w in &s.adj[v] {
            match s.index[w] {
                None => {
                    connect(s, w);
                    s.low[v] = s.low[v].min(s.low[w]);
                }
                Some(wi) if s.on_stack[w] => s.low[v] = s.low[v].min(wi),
                Some(_) => {}
            }
        }

        if Some(s.low[v]) == s.index[v] {
            let mut scc = Vec::new();
            while let Some(w) = s.stack.pop() {
                s.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            s.out.push(scc);
        }
    }

    let n = adj.len();
    let mut s = State {
        adj,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        out: Vec::new(),
    };
    for v in 0..n {
        if s.index[v].is_none() {
            connect(&mut s, v);
        }
    }
    s.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::description::{Cardinality, ReferenceMetadata};

    fn component(name: &str, provides: &str, needs: &[&str], dynamic: bool) -> ComponentMetadata {
        let mut meta = ComponentMetadata::new(name).provides(&[provides]);
        for (i, interface) in needs.iter().enumerate() {
            let mut r = ReferenceMetadata::new(format!("r{i}"), *interface);
            if dynamic {
                r = r.dynamic();
            }
            meta = meta.reference(r);
        }
        meta
    }

    #[test]
    fn topo_sort_happy_path() {
        let metas = [
            component("consumer", "C", &["B"], false),
            component("middle", "B", &["A"], false),
            component("base", "A", &[], false),
        ];
        let graph = DependencyGraph::from_metadata(&metas);
        assert_eq!(
            graph.activation_order().unwrap(),
            vec!["base", "middle", "consumer"]
        );
        assert!(graph.cycles().is_empty());
    }

    #[test]
    fn optional_edges_do_not_order() {
        let a = ComponentMetadata::new("a")
            .provides(&["A"])
            .reference(ReferenceMetadata::new("b", "B").cardinality(Cardinality::Optional));
        let b = component("b", "B", &["A"], false);
        let graph = DependencyGraph::from_metadata([&a, &b]);
        assert_eq!(graph.activation_order().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn complex_cycle_detection_with_path() {
        let metas = [
            component("a", "A", &["B"], false),
            component("b", "B", &["C"], false),
            component("c", "C", &["A"], false),
            component("d", "D", &[], false),
        ];
        let graph = DependencyGraph::from_metadata(&metas);
        match graph.activation_order() {
            Err(GraphError::CycleDetected { path }) => {
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
                assert!(path.contains(&"c".to_string()));
                assert!(!path.contains(&"d".to_string()));
                assert_eq!(path.first(), path.last());
                let msg = GraphError::CycleDetected { path }.to_string();
                assert!(msg.contains("cyclic dependency detected"));
                assert!(msg.contains("->"));
            }
            other => panic!("expected CycleDetected, got: {other:?}"),
        }

        let lenient = graph.activation_order_lenient();
        assert_eq!(lenient.len(), 4);
        assert_eq!(lenient[0], "d");
    }

    #[test]
    fn cycles_report_breakability() {
        let static_cycle = [
            component("a", "A", &["B"], false),
            component("b", "B", &["A"], false),
        ];
        let cycles = DependencyGraph::from_metadata(&static_cycle).cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].members, vec!["a", "b"]);
        assert!(!cycles[0].is_breakable());

        let mixed = [
            component("a", "A", &["B"], false),
            component("b", "B", &["C"], true),
            component("c", "C", &["A"], false),
        ];
        let cycles = DependencyGraph::from_metadata(&mixed).cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].breaker.as_deref(), Some("b"));
        assert_eq!(cycles[0].path.len(), 4);
    }
}
