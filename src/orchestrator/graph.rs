//! Execution Graph
//!
//! Nodes and edges are plain immutable values, loaded once and validated
//! eagerly. Guards are pure predicates over a session snapshot. Routing out
//! of a node walks its edges in declared order: the first edge whose guards
//! match wins, then the first declared default target, then a dead end.
//! Validation guarantees every reachable non-terminal node has a total
//! routing rule, so a dead end at runtime means the graph changed under a
//! live session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::session::Session;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plugins::CapabilityRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Tool,
    Terminal,
    HumanInputWait,
}

/// Explicit routing policy for nodes without a default edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_no_match: Option<NoMatchPolicy>,
}

impl Node {
    pub fn agent(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::bound(name, NodeKind::Agent, Some(capability.into()))
    }

    pub fn tool(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::bound(name, NodeKind::Tool, Some(capability.into()))
    }

    pub fn terminal(name: impl Into<String>) -> Self {
        Self::bound(name, NodeKind::Terminal, None)
    }

    pub fn human_input(name: impl Into<String>) -> Self {
        Self::bound(name, NodeKind::HumanInputWait, None)
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn fail_on_no_match(mut self) -> Self {
        self.on_no_match = Some(NoMatchPolicy::Fail);
        self
    }

    fn bound(name: impl Into<String>, kind: NodeKind, capability: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            capability,
            on_no_match: None,
        }
    }
}

/// Routing predicate over a session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    Always,
    Equals { var: String, value: Value },
    /// An absent variable is not equal to anything.
    NotEquals { var: String, value: Value },
    Exists { var: String },
    Missing { var: String },
    Truthy { var: String },
    /// An absent variable is falsy.
    Falsy { var: String },
    /// Case-insensitive match against the latest user turn.
    InputContains { text: String },
    All(Vec<Guard>),
    Any(Vec<Guard>),
    Not(Box<Guard>),
}

impl Guard {
    pub fn equals(var: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            var: var.into(),
            value: value.into(),
        }
    }

    pub fn truthy(var: impl Into<String>) -> Self {
        Self::Truthy { var: var.into() }
    }

    pub fn falsy(var: impl Into<String>) -> Self {
        Self::Falsy { var: var.into() }
    }

    pub fn evaluate(&self, session: &Session) -> bool {
        match self {
            Guard::Always => true,
            Guard::Equals { var, value } => session.variable(var) == Some(value),
            Guard::NotEquals { var, value } => session.variable(var) != Some(value),
            Guard::Exists { var } => session.variable(var).is_some(),
            Guard::Missing { var } => session.variable(var).is_none(),
            Guard::Truthy { var } => session.variable(var).is_some_and(is_truthy),
            Guard::Falsy { var } => !session.variable(var).is_some_and(is_truthy),
            Guard::InputContains { text } => session
                .latest_user_input()
                .is_some_and(|input| input.to_lowercase().contains(&text.to_lowercase())),
            Guard::All(guards) => guards.iter().all(|guard| guard.evaluate(session)),
            Guard::Any(guards) => guards.iter().any(|guard| guard.evaluate(session)),
            Guard::Not(guard) => !guard.evaluate(session),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Evaluated in order; any match takes the edge. Empty means unconditional.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<Guard>,
    /// Taken when no edge out of `from` matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guards: Vec::new(),
            default: None,
        }
    }

    pub fn when(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn otherwise(mut self, target: impl Into<String>) -> Self {
        self.default = Some(target.into());
        self
    }

    pub fn is_unconditional(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.is_unconditional() || self.guards.iter().any(|guard| guard.evaluate(session))
    }
}

/// Serialized form of a graph, as written in YAML/JSON graph files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub entry: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphDefinition {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            ..Self::default()
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn build(self) -> OrchestratorResult<Graph> {
        Graph::from_definition(self)
    }
}

/// A validated, immutable execution graph.
#[derive(Debug, Clone)]
pub struct Graph {
    entry: String,
    nodes: HashMap<String, Node>,
    outgoing: HashMap<String, Vec<Edge>>,
}

impl Graph {
    pub fn builder(entry: impl Into<String>) -> GraphDefinition {
        GraphDefinition::new(entry)
    }

    /// Load a graph file; `.yaml`/`.yml` are parsed as YAML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::InvalidGraph(format!("cannot read {}: {}", path.display(), e))
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let definition: GraphDefinition = if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| OrchestratorError::InvalidGraph(format!("{}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| OrchestratorError::InvalidGraph(format!("{}: {}", path.display(), e)))?
        };
        Self::from_definition(definition)
    }

    pub fn from_definition(definition: GraphDefinition) -> OrchestratorResult<Self> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidGraph(msg));

        let mut nodes = HashMap::new();
        for node in definition.nodes {
            if node.name.trim().is_empty() {
                return invalid("node names must not be empty".into());
            }
            match (node.kind, &node.capability) {
                (NodeKind::Agent | NodeKind::Tool, None) => {
                    return invalid(format!("node '{}' must name a capability", node.name));
                }
                (NodeKind::Terminal, Some(_)) => {
                    return invalid(format!("terminal node '{}' cannot invoke a capability", node.name));
                }
                _ => {}
            }
            if let Some(previous) = nodes.insert(node.name.clone(), node) {
                return invalid(format!("duplicate node '{}'", previous.name));
            }
        }

        if !nodes.contains_key(&definition.entry) {
            return invalid(format!("entry node '{}' is not defined", definition.entry));
        }

        let mut outgoing: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in definition.edges {
            for endpoint in std::iter::once(&edge.from)
                .chain(std::iter::once(&edge.to))
                .chain(edge.default.iter())
            {
                if !nodes.contains_key(endpoint) {
                    return invalid(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, endpoint
                    ));
                }
            }
            if nodes[&edge.from].kind == NodeKind::Terminal {
                return invalid(format!("terminal node '{}' cannot have outgoing edges", edge.from));
            }
            outgoing.entry(edge.from.clone()).or_default().push(edge);
        }

        let graph = Self {
            entry: definition.entry,
            nodes,
            outgoing,
        };

        let reachable = graph.reachable();
        for name in &reachable {
            let node = &graph.nodes[name];
            if node.kind == NodeKind::Terminal {
                continue;
            }
            let edges = graph.edges_from(name);
            if edges.is_empty() {
                return invalid(format!("node '{}' has no outgoing edges and is not terminal", name));
            }
            let total = edges.iter().any(|e| e.is_unconditional() || e.default.is_some())
                || node.on_no_match == Some(NoMatchPolicy::Fail);
            if !total {
                return invalid(format!(
                    "node '{}' needs an unconditional edge, a default target, or on_no_match: fail",
                    name
                ));
            }
        }

        let mut unreachable: Vec<&String> = graph.nodes.keys().filter(|n| !reachable.contains(*n)).collect();
        if !unreachable.is_empty() {
            unreachable.sort();
            warn!("Graph has nodes unreachable from '{}': {:?}", graph.entry, unreachable);
        }

        Ok(graph)
    }

    fn reachable(&self) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.entry.clone()]);
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            for edge in self.edges_from(&name) {
                queue.push_back(edge.to.clone());
                if let Some(default) = &edge.default {
                    queue.push_back(default.clone());
                }
            }
        }
        seen
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn edges_from(&self, name: &str) -> &[Edge] {
        self.outgoing.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Capability names referenced by any node, sorted and deduplicated.
    pub fn capability_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.values().filter_map(|n| n.capability.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Pick the next node for `from` given the post-mutation state.
    pub fn route(&self, from: &str, session: &Session) -> OrchestratorResult<String> {
        let edges = self.edges_from(from);
        if let Some(edge) = edges.iter().find(|edge| edge.matches(session)) {
            return Ok(edge.to.clone());
        }
        edges
            .iter()
            .find_map(|edge| edge.default.clone())
            .ok_or_else(|| OrchestratorError::RoutingDeadEnd { node: from.to_string() })
    }

    /// Fails unless every capability the graph names is registered.
    pub async fn check_capabilities(&self, registry: &CapabilityRegistry) -> OrchestratorResult<()> {
        let known = registry.names().await;
        let missing: Vec<String> = self
            .capability_names()
            .into_iter()
            .filter(|name| !known.contains(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidGraph(format!(
                "graph references unregistered capabilities: {}",
                missing.join(", ")
            )))
        }
    }
}
