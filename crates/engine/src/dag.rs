//! DAG validation: run this before executing a workflow.
//!
//! Rules enforced:
//! 1. The graph has at least one node and node IDs are unique. IDs may not
//!    shadow a reserved variable scope (`sys`, `env`, `conversation`).
//! 2. Every node's `data` parses and passes its own configuration checks.
//! 3. Every edge references nodes of the same (sub-)graph.
//! 4. Each graph has exactly one start node: `start` at the top level,
//!    `iteration-start` / `loop-start` inside a container.
//! 5. The directed graph is acyclic (topological sort must succeed).
//! 6. Every node is reachable from its graph's start node.
//!
//! Returns the compiled [`Graph`] with its indexes and answer route tables.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use nodes::config::{ErrorStrategy, NodeData, NodeKind};
use nodes::template::Template;
use nodes::variables::is_reserved_scope;
use nodes::{BuiltinNode, Selector};

use crate::models::{EdgeConfig, GraphConfig, NodeConfig};
use crate::EngineError;

/// Upper bound on enumerated root→answer routes per sink.
pub const MAX_ROUTES: usize = 256;

/// Joins a container child's id and pass index in re-keyed scopes.
pub const CONTAINER_INDEX_SEPARATOR: char = '#';

// ---------------------------------------------------------------------------
// Compiled graph
// ---------------------------------------------------------------------------

/// A validated node with its parsed configuration.
pub struct GraphNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub data: NodeData,
    /// Leaf implementation; `None` for containers.
    pub executable: Option<Arc<BuiltinNode>>,
}

impl GraphNode {
    pub fn node_type(&self) -> &'static str {
        self.data.kind.type_name()
    }

    pub fn title(&self) -> &str {
        if self.data.title.is_empty() {
            &self.id
        } else {
            &self.data.title
        }
    }

    /// Whether this node can route execution down one of several handles.
    pub fn is_branching(&self) -> bool {
        matches!(self.data.kind, NodeKind::IfElse(_) | NodeKind::QuestionClassifier(_))
            || self.data.error_strategy == ErrorStrategy::FailBranch
    }

    pub fn input_selectors(&self) -> Vec<Selector> {
        match (&self.executable, &self.data.kind) {
            (Some(node), _) => nodes::ExecutableNode::input_selectors(node.as_ref()),
            (None, NodeKind::Iteration(d)) => vec![d.iterator_selector.clone()],
            (None, NodeKind::Loop(d)) => d
                .loop_variables
                .iter()
                .filter_map(|v| v.value_selector())
                .chain(d.break_conditions.iter().map(|c| c.variable_selector.clone()))
                .collect(),
            (None, _) => Vec::new(),
        }
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("type", &self.node_type())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub source_handle: String,
    pub target: String,
}

/// All root→sink paths of one answer node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    pub routes: Vec<Vec<String>>,
    /// Set when enumeration stopped at [`MAX_ROUTES`].
    pub truncated: bool,
}

/// An immutable, validated graph (or container sub-graph).
#[derive(Debug)]
pub struct Graph {
    root_id: String,
    nodes: HashMap<String, Arc<GraphNode>>,
    edges: Vec<GraphEdge>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    topo_order: Vec<String>,
    /// Answer node id → selectors its template reads.
    answer_inputs: HashMap<String, Vec<Selector>>,
    routes: HashMap<String, RouteTable>,
    subgraphs: HashMap<String, Arc<Graph>>,
}

impl Graph {
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn node(&self, id: &str) -> Option<&Arc<GraphNode>> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn edge(&self, index: usize) -> &GraphEdge {
        &self.edges[index]
    }

    /// Indexes (into [`Graph::edges`]) of the edges leaving `node_id`.
    pub fn outgoing(&self, node_id: &str) -> &[usize] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, node_id: &str) -> &[usize] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn topo_order(&self) -> &[String] {
        &self.topo_order
    }

    pub fn is_branching(&self, node_id: &str) -> bool {
        self.nodes.get(node_id).is_some_and(|n| n.is_branching())
    }

    pub fn routes(&self, sink_id: &str) -> Option<&RouteTable> {
        self.routes.get(sink_id)
    }

    pub fn subgraph(&self, container_id: &str) -> Option<&Arc<Graph>> {
        self.subgraphs.get(container_id)
    }

    /// Answer nodes whose template reads the variable behind `selector`.
    pub fn sinks_reading(&self, selector: &Selector) -> Vec<&str> {
        let key = selector.key();
        let mut sinks: Vec<&str> = self
            .answer_inputs
            .iter()
            .filter(|(_, inputs)| inputs.iter().any(|s| s.key() == key))
            .map(|(id, _)| id.as_str())
            .collect();
        sinks.sort_unstable();
        sinks
    }

    /// Ids of every node in this graph and all nested sub-graphs.
    pub fn all_node_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&Graph> = vec![self];
        while let Some(graph) = stack.pop() {
            out.extend(graph.topo_order.iter().cloned());
            stack.extend(graph.subgraphs.values().map(Arc::as_ref));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the workflow graph and compile it.
///
/// # Errors
/// - [`EngineError::EmptyGraph`] if there are no nodes.
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::InvalidNodeConfig`] if a node's `data` does not parse or is invalid.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::MissingStartNode`] / [`EngineError::MultipleStartNodes`].
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
/// - [`EngineError::UnreachableNode`] if a node cannot be reached from the start node.
pub fn validate_dag(config: &GraphConfig) -> Result<Arc<Graph>, EngineError> {
    if config.nodes.is_empty() {
        return Err(EngineError::EmptyGraph);
    }

    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique and parse every node
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &config.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    let mut parsed: HashMap<String, Arc<GraphNode>> = HashMap::with_capacity(config.nodes.len());
    for node in &config.nodes {
        parsed.insert(node.id.clone(), Arc::new(parse_node(node)?));
    }

    for node in parsed.values() {
        if let Some(parent) = &node.parent_id {
            let is_container = parsed.get(parent).is_some_and(|p| p.data.kind.is_container());
            if !is_container {
                return Err(EngineError::InvalidNodeConfig {
                    node_id: node.id.clone(),
                    message: format!("parent '{parent}' is not an iteration or loop node"),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &config.edges {
        let Some(source) = parsed.get(&edge.source) else {
            return Err(EngineError::UnknownNodeReference { node_id: edge.source.clone(), side: "source" });
        };
        let Some(target) = parsed.get(&edge.target) else {
            return Err(EngineError::UnknownNodeReference { node_id: edge.target.clone(), side: "target" });
        };
        if source.parent_id != target.parent_id {
            return Err(EngineError::UnknownNodeReference { node_id: edge.target.clone(), side: "target" });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Compile each graph level, innermost first
    // -----------------------------------------------------------------------
    let mut levels: HashMap<Option<String>, Vec<Arc<GraphNode>>> = HashMap::new();
    for node in parsed.values() {
        levels.entry(node.parent_id.clone()).or_default().push(node.clone());
    }

    let mut compiled: HashMap<String, Arc<Graph>> = HashMap::new();
    let mut pending: Vec<String> = Vec::new();
    // Depth-first order over containers so children compile before parents.
    let mut stack: Vec<(String, bool)> = parsed
        .values()
        .filter(|n| n.parent_id.is_none() && n.data.kind.is_container())
        .map(|n| (n.id.clone(), false))
        .collect();
    while let Some((container_id, expanded)) = stack.pop() {
        if expanded {
            pending.push(container_id);
            continue;
        }
        stack.push((container_id.clone(), true));
        for child in levels.get(&Some(container_id)).into_iter().flatten() {
            if child.data.kind.is_container() {
                stack.push((child.id.clone(), false));
            }
        }
    }

    for container_id in pending {
        let members = levels.remove(&Some(container_id.clone())).unwrap_or_default();
        let graph = compile_level(&container_id, members, &config.edges, &mut compiled)?;
        compiled.insert(container_id, Arc::new(graph));
    }

    let top = levels.remove(&None).unwrap_or_default();
    let graph = compile_level("workflow", top, &config.edges, &mut compiled)?;
    Ok(Arc::new(graph))
}

fn parse_node(node: &NodeConfig) -> Result<GraphNode, EngineError> {
    let invalid = |message: String| EngineError::InvalidNodeConfig { node_id: node.id.clone(), message };

    if is_reserved_scope(&node.id) {
        return Err(invalid(format!("'{}' is a reserved variable scope", node.id)));
    }
    // `#` separates a node id from its pass index inside containers.
    if node.id.is_empty() || node.id.contains(CONTAINER_INDEX_SEPARATOR) {
        return Err(invalid(format!("node ids must be non-empty and must not contain '{CONTAINER_INDEX_SEPARATOR}'")));
    }

    let data: NodeData = serde_json::from_value(node.data.clone()).map_err(|e| invalid(e.to_string()))?;
    data.kind.validate().map_err(invalid)?;
    let executable = BuiltinNode::from_kind(&node.id, &data.kind).map(Arc::new);

    Ok(GraphNode { id: node.id.clone(), parent_id: node.parent_id.clone(), data, executable })
}

/// Compile one graph level (top-level or a container body).
fn compile_level(
    label: &str,
    members: Vec<Arc<GraphNode>>,
    all_edges: &[EdgeConfig],
    compiled: &mut HashMap<String, Arc<Graph>>,
) -> Result<Graph, EngineError> {
    let nodes: HashMap<String, Arc<GraphNode>> = members.into_iter().map(|n| (n.id.clone(), n)).collect();

    let is_top = label == "workflow";
    let roots: Vec<&String> = nodes
        .values()
        .filter(|n| match &n.data.kind {
            NodeKind::Start(_) => is_top,
            NodeKind::IterationStart {} | NodeKind::LoopStart {} => !is_top,
            _ => false,
        })
        .map(|n| &n.id)
        .collect();
    let root_id = match roots.as_slice() {
        [] => return Err(EngineError::MissingStartNode { graph: label.to_string() }),
        [root] => (*root).clone(),
        _ => return Err(EngineError::MultipleStartNodes { graph: label.to_string() }),
    };

    let edges: Vec<GraphEdge> = all_edges
        .iter()
        .filter(|e| nodes.contains_key(&e.source))
        .map(|e| GraphEdge {
            id: if e.id.is_empty() {
                format!("{}-{}-{}", e.source, e.source_handle, e.target)
            } else {
                e.id.clone()
            },
            source: e.source.clone(),
            source_handle: e.source_handle.clone(),
            target: e.target.clone(),
        })
        .collect();

    let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
    let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, edge) in edges.iter().enumerate() {
        outgoing.entry(edge.source.clone()).or_default().push(index);
        incoming.entry(edge.target.clone()).or_default().push(index);
    }

    // Topological sort (Kahn's algorithm), seeded in a stable order.
    let mut in_degree: HashMap<&str, usize> = nodes.keys().map(|id| (id.as_str(), 0)).collect();
    for edge in &edges {
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }
    let mut seeds: Vec<&str> = in_degree.iter().filter(|(_, &d)| d == 0).map(|(&id, _)| id).collect();
    seeds.sort_unstable();
    let mut queue: VecDeque<&str> = seeds.into();

    let mut topo_order: Vec<String> = Vec::with_capacity(nodes.len());
    while let Some(node_id) = queue.pop_front() {
        topo_order.push(node_id.to_owned());
        for &index in outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[]) {
            let target = edges[index].target.as_str();
            if let Some(deg) = in_degree.get_mut(target) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if topo_order.len() != nodes.len() {
        return Err(EngineError::CycleDetected);
    }

    // Reachability from the root.
    let mut reached: HashSet<&str> = HashSet::from([root_id.as_str()]);
    let mut stack: Vec<&str> = vec![root_id.as_str()];
    while let Some(node_id) = stack.pop() {
        for &index in outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[]) {
            let target = edges[index].target.as_str();
            if reached.insert(target) {
                stack.push(target);
            }
        }
    }
    if let Some(orphan) = topo_order.iter().find(|id| !reached.contains(id.as_str())) {
        return Err(EngineError::UnreachableNode(orphan.clone()));
    }

    let mut answer_inputs = HashMap::new();
    for node in nodes.values() {
        if let NodeKind::Answer(data) = &node.data.kind {
            answer_inputs.insert(node.id.clone(), Template::parse(&data.answer).selectors());
        }
    }

    let routes = answer_inputs
        .keys()
        .map(|sink| (sink.clone(), enumerate_routes(&root_id, sink, &edges, &outgoing)))
        .collect();

    let subgraphs = nodes
        .values()
        .filter(|n| n.data.kind.is_container())
        .filter_map(|n| compiled.remove(&n.id).map(|g| (n.id.clone(), g)))
        .collect();

    Ok(Graph { root_id, nodes, edges, outgoing, incoming, topo_order, answer_inputs, routes, subgraphs })
}

/// Enumerate root→sink paths depth-first with an explicit stack.
fn enumerate_routes(
    root_id: &str,
    sink_id: &str,
    edges: &[GraphEdge],
    outgoing: &HashMap<String, Vec<usize>>,
) -> RouteTable {
    let mut table = RouteTable::default();
    let mut stack: Vec<Vec<String>> = vec![vec![root_id.to_string()]];

    while let Some(path) = stack.pop() {
        let Some(last) = path.last() else { continue };
        if last == sink_id {
            if table.routes.len() == MAX_ROUTES {
                table.truncated = true;
                break;
            }
            table.routes.push(path);
            continue;
        }
        let mut targets: Vec<&str> = outgoing
            .get(last.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(|&i| edges[i].target.as_str())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        for target in targets.into_iter().rev() {
            let mut next = path.clone();
            next.push(target.to_string());
            stack.push(next);
        }
    }
    table
}

/// Does `edge` belong to the decision `handle`? `None` activates nothing.
pub fn edge_matches(edge: &GraphEdge, handle: Option<&str>) -> bool {
    handle == Some(edge.source_handle.as_str())
}
