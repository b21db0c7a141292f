use serde::{Deserialize, Serialize};

/// Node/edge model for the decision graph the evaluator emits as a side
/// channel of the real pipeline, so a caller can reconstruct why an action
/// landed in its bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Metric,
    Gate,
    Guard,
    Mutation,
    Action,
    Result,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub condition: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionGraph {
    pub run_id: String,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl DecisionGraph {
    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(move |node| node.kind == kind)
    }
}

/// Collects nodes and edges while the pipeline runs. Node ids are assigned
/// sequentially, which also preserves the exact stage order executed.
pub struct GraphRecorder {
    graph: DecisionGraph,
    next: usize,
}

impl GraphRecorder {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            graph: DecisionGraph { run_id: run_id.into(), nodes: Vec::new(), edges: Vec::new() },
            next: 0,
        }
    }

    pub fn node(&mut self, kind: NodeKind, label: impl Into<String>) -> String {
        let id = format!("n{}", self.next);
        self.next += 1;
        self.graph.nodes.push(GraphNode { id: id.clone(), kind, label: label.into() });
        id
    }

    pub fn edge(&mut self, from: &str, to: &str, condition: Option<&str>) {
        self.graph.edges.push(GraphEdge {
            from: from.to_string(),
            to: to.to_string(),
            condition: condition.map(str::to_string),
        });
    }

    pub fn finish(self) -> DecisionGraph {
        self.graph
    }
}
