//! Answer-stream reachability: may a chunk from `upstream` be forwarded to
//! `sink` right now, or must it wait until the producer has finished?
//!
//! The static route table answers the easy cases. When several conditional
//! paths rejoin before the producer the table cannot prove a single live
//! path, so the recorded route state is walked instead.

use std::collections::HashSet;

use tracing::debug;

use crate::dag::Graph;
use crate::route::{EdgeState, RouteState};

pub struct ReachabilityChecker<'a> {
    graph: &'a Graph,
    route: &'a RouteState,
}

impl<'a> ReachabilityChecker<'a> {
    pub fn new(graph: &'a Graph, route: &'a RouteState) -> Self {
        Self { graph, route }
    }

    pub fn is_safe_to_stream(&self, sink_id: &str, upstream_id: &str) -> bool {
        if self.static_check(sink_id, upstream_id) {
            return true;
        }
        let safe = self.dynamic_check(sink_id, upstream_id);
        debug!(sink_id, upstream_id, safe, "Static route check inconclusive, used route state");
        safe
    }

    /// Every route to the sink is the same path, it passes through the
    /// producer, and nothing from the producer onwards can branch away.
    pub fn static_check(&self, sink_id: &str, upstream_id: &str) -> bool {
        let Some(table) = self.graph.routes(sink_id) else {
            return false;
        };
        if table.truncated {
            return false;
        }
        let Some(first) = table.routes.first() else {
            return false;
        };

        let first_set: HashSet<&str> = first.iter().map(String::as_str).collect();
        let single_path = table
            .routes
            .iter()
            .all(|r| r.len() == first.len() && r.iter().all(|n| first_set.contains(n.as_str())));
        if !single_path {
            return false;
        }

        let Some(position) = first.iter().position(|n| n == upstream_id) else {
            return false;
        };
        !first[position..].iter().any(|n| self.graph.is_branching(n))
    }

    /// Check the realized run: forward from the producer nothing else can
    /// still feed the sink, and backwards the producer sits on a concretely
    /// taken path back to the root.
    pub fn dynamic_check(&self, sink_id: &str, upstream_id: &str) -> bool {
        if self.graph.is_branching(upstream_id) {
            return false;
        }

        // Forward: nodes between the producer and the sink.
        let downstream = collect(upstream_id, |id| {
            self.graph.outgoing(id).iter().map(|&i| self.graph.edge(i).target.as_str()).collect()
        });
        if !downstream.contains(sink_id) {
            return false;
        }
        let upstream_of_sink = collect(sink_id, |id| {
            self.graph.incoming(id).iter().map(|&i| self.graph.edge(i).source.as_str()).collect()
        });
        let between: HashSet<&str> = downstream
            .intersection(&upstream_of_sink)
            .copied()
            .filter(|id| *id != upstream_id && *id != sink_id)
            .collect();

        if between.iter().any(|id| self.graph.is_branching(id)) {
            return false;
        }
        for node_id in between.iter().copied().chain(std::iter::once(sink_id)) {
            for &index in self.graph.incoming(node_id) {
                let source = self.graph.edge(index).source.as_str();
                let inside = source == upstream_id || between.contains(source);
                if !inside && self.route.edge_state(index) == EdgeState::Unknown {
                    return false;
                }
            }
        }

        // Backward: follow edges that finished predecessors actually took.
        let root = self.graph.root_id();
        let mut visited: HashSet<&str> = HashSet::from([upstream_id]);
        let mut stack: Vec<&str> = vec![upstream_id];
        let mut reached_root = false;

        while let Some(node_id) = stack.pop() {
            if node_id == root {
                reached_root = true;
                continue;
            }
            let mut realized = false;
            for &index in self.graph.incoming(node_id) {
                let edge = self.graph.edge(index);
                match self.route.finished(&edge.source) {
                    Some(attempt) if attempt.activated(edge) => {
                        realized = true;
                        if visited.insert(edge.source.as_str()) {
                            stack.push(edge.source.as_str());
                        }
                    }
                    Some(_) => {}
                    None if self.route.edge_state(index) == EdgeState::Skipped => {}
                    // A predecessor that has not finished could still feed this path.
                    None => return false,
                }
            }
            if !realized {
                return false;
            }
        }
        reached_root
    }
}

/// Every node reachable from `from` through `next`, `from` included.
fn collect<'g>(from: &'g str, next: impl Fn(&'g str) -> Vec<&'g str>) -> HashSet<&'g str> {
    let mut seen: HashSet<&str> = HashSet::from([from]);
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
        for n in next(id) {
            if seen.insert(n) {
                stack.push(n);
            }
        }
    }
    seen
}
