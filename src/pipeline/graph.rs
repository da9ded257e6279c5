/// Serialized node graph and its flattening into a [`Pipeline`]
///
/// The editor saves a general node graph, but only simple chains are
/// executable: one `Input` node, then each node wired to at most one
/// successor. [`build_pipeline`] walks the chain once and either returns a
/// complete pipeline or an error; nothing is built on failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::steps::parameter::{ParameterError, ParameterValue};
use crate::steps::StepRegistry;

use super::Pipeline;

/// Kind of the single source node
pub const INPUT_KIND: &str = "Input";
/// Optional terminal node; the chain stops there
pub const OUTPUT_KIND: &str = "Output";
/// The only socket a step node exposes
pub const DATA_SOCKET: &str = "transients";

#[derive(Error, Debug)]
pub enum PipelineBuildError {
    #[error("Graph has no {INPUT_KIND} node")]
    MissingInput,
    #[error("Graph has {0} {INPUT_KIND} nodes, expected one")]
    MultipleInputs(usize),
    #[error("Node {0} has more than one outbound wire")]
    MultipleOutbound(String),
    #[error("Node {0} has more than one inbound wire")]
    MultipleInbound(String),
    #[error("Wiring loops back to node {0}")]
    Cycle(String),
    #[error("Wire references unknown node {0}")]
    UnknownNode(String),
    #[error("Node id {0} is used twice")]
    DuplicateNode(String),
    #[error("Node {node} has unknown kind {kind}")]
    UnknownKind { node: String, kind: String },
    #[error("Wire {node}.{socket} is not a data socket")]
    InvalidSocket { node: String, socket: String },
    #[error("Node {node}: {source}")]
    Parameter {
        node: String,
        #[source]
        source: ParameterError,
    },
    #[error("Cannot read graph: {0}")]
    Read(String),
}

/// One node of the saved graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: String,
    /// Editor position, carried through unchanged
    #[serde(default)]
    pub position: [f64; 2],
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

/// Directed connection between two node sockets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wire {
    pub src: String,
    pub src_socket: String,
    pub dst: String,
    pub dst_socket: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub wires: Vec<Wire>,
}

impl PipelineGraph {
    pub fn load(path: &Path) -> Result<Self, PipelineBuildError> {
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineBuildError::Read(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| PipelineBuildError::Read(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Chain graph of an existing pipeline, nodes laid out left to right
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        let mut graph = PipelineGraph::default();
        graph.nodes.push(GraphNode {
            id: "input".to_string(),
            kind: INPUT_KIND.to_string(),
            position: [0.0, 0.0],
            parameters: BTreeMap::new(),
        });
        let mut previous = "input".to_string();
        for (i, step) in pipeline.iter().enumerate() {
            let id = format!("step{}", i + 1);
            graph.nodes.push(GraphNode {
                id: id.clone(),
                kind: step.kind().to_string(),
                position: [200.0 * (i + 1) as f64, 0.0],
                parameters: step
                    .parameters()
                    .iter()
                    .map(|p| (p.idname.clone(), p.value().clone()))
                    .collect(),
            });
            graph.wires.push(Wire {
                src: previous,
                src_socket: DATA_SOCKET.to_string(),
                dst: id.clone(),
                dst_socket: DATA_SOCKET.to_string(),
            });
            previous = id;
        }
        graph
    }

    fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Validate the serial-chain shape and build the steps in wiring order
pub fn build_pipeline(
    graph: &PipelineGraph,
    registry: &StepRegistry,
) -> Result<Pipeline, PipelineBuildError> {
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(PipelineBuildError::DuplicateNode(node.id.clone()));
        }
    }

    let mut outbound: HashMap<&str, &str> = HashMap::new();
    let mut inbound: HashSet<&str> = HashSet::new();
    for wire in &graph.wires {
        for (node, socket) in [(&wire.src, &wire.src_socket), (&wire.dst, &wire.dst_socket)] {
            if !seen.contains(node.as_str()) {
                return Err(PipelineBuildError::UnknownNode(node.clone()));
            }
            if socket != DATA_SOCKET {
                return Err(PipelineBuildError::InvalidSocket {
                    node: node.clone(),
                    socket: socket.clone(),
                });
            }
        }
        if outbound.insert(&wire.src, &wire.dst).is_some() {
            return Err(PipelineBuildError::MultipleOutbound(wire.src.clone()));
        }
        if !inbound.insert(&wire.dst) {
            return Err(PipelineBuildError::MultipleInbound(wire.dst.clone()));
        }
    }

    let inputs: Vec<&GraphNode> = graph.nodes.iter().filter(|n| n.kind == INPUT_KIND).collect();
    let input = match inputs.as_slice() {
        [] => return Err(PipelineBuildError::MissingInput),
        [one] => *one,
        many => return Err(PipelineBuildError::MultipleInputs(many.len())),
    };

    let mut chain: Vec<&GraphNode> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::from([input.id.as_str()]);
    let mut current = input.id.as_str();
    while let Some(&next) = outbound.get(current) {
        if !visited.insert(next) {
            return Err(PipelineBuildError::Cycle(next.to_string()));
        }
        let node = graph
            .node(next)
            .ok_or_else(|| PipelineBuildError::UnknownNode(next.to_string()))?;
        if node.kind == OUTPUT_KIND {
            break;
        }
        chain.push(node);
        current = next;
    }

    let stray = graph.nodes.len() - visited.len();
    if stray > 0 {
        log::warn!("{} node(s) are not connected to the input chain and are ignored", stray);
    }

    let mut pipeline = Pipeline::new();
    for node in chain {
        let mut step = registry
            .create(&node.kind)
            .ok_or_else(|| PipelineBuildError::UnknownKind {
                node: node.id.clone(),
                kind: node.kind.clone(),
            })?;
        for (name, value) in &node.parameters {
            step.set_parameter(name, value.clone())
                .map_err(|source| PipelineBuildError::Parameter {
                    node: node.id.clone(),
                    source,
                })?;
        }
        pipeline.push(step);
    }

    log::info!("Built pipeline: {}", pipeline.describe());
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepKind;

    fn node(id: &str, kind: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            kind: kind.to_string(),
            position: [0.0, 0.0],
            parameters: BTreeMap::new(),
        }
    }

    fn wire(src: &str, dst: &str) -> Wire {
        Wire {
            src: src.to_string(),
            src_socket: DATA_SOCKET.to_string(),
            dst: dst.to_string(),
            dst_socket: DATA_SOCKET.to_string(),
        }
    }

    fn chain_graph() -> PipelineGraph {
        let mut zp = node("b", "ZeroPadding");
        zp.parameters
            .insert("factor".to_string(), ParameterValue::Integer(2));
        PipelineGraph {
            // deliberately out of order; wiring decides the sequence
            nodes: vec![
                node("c", "Average"),
                zp,
                node("in", INPUT_KIND),
                node("a", "RemoveBadAverages"),
                node("out", OUTPUT_KIND),
            ],
            wires: vec![wire("a", "b"), wire("in", "a"), wire("b", "c"), wire("c", "out")],
        }
    }

    #[test]
    fn test_build_follows_wiring() {
        let pipeline = build_pipeline(&chain_graph(), &StepRegistry::with_builtin()).unwrap();
        assert_eq!(
            pipeline.kinds(),
            vec![StepKind::RemoveBadAverages, StepKind::ZeroPadding, StepKind::Average]
        );
        assert_eq!(
            pipeline.step(1).unwrap().parameters().get_int("factor").unwrap(),
            2
        );
    }

    #[test]
    fn test_fan_out_is_rejected() {
        let mut graph = chain_graph();
        graph.nodes.push(node("d", "Average"));
        graph.wires.push(wire("a", "d"));
        let err = build_pipeline(&graph, &StepRegistry::with_builtin()).unwrap_err();
        assert!(matches!(err, PipelineBuildError::MultipleOutbound(ref id) if id == "a"));
    }

    #[test]
    fn test_input_errors() {
        let registry = StepRegistry::with_builtin();
        let graph = PipelineGraph {
            nodes: vec![node("a", "Average")],
            wires: Vec::new(),
        };
        assert!(matches!(
            build_pipeline(&graph, &registry),
            Err(PipelineBuildError::MissingInput)
        ));

        let graph = PipelineGraph {
            nodes: vec![node("x", INPUT_KIND), node("y", INPUT_KIND)],
            wires: Vec::new(),
        };
        assert!(matches!(
            build_pipeline(&graph, &registry),
            Err(PipelineBuildError::MultipleInputs(2))
        ));
    }

    #[test]
    fn test_cycle_and_unknowns() {
        let registry = StepRegistry::with_builtin();
        let graph = PipelineGraph {
            nodes: vec![node("in", INPUT_KIND), node("a", "Average"), node("b", "Average")],
            wires: vec![wire("in", "a"), wire("a", "b"), wire("b", "a")],
        };
        // "a" has two inbound wires before the walk ever loops
        assert!(matches!(
            build_pipeline(&graph, &registry),
            Err(PipelineBuildError::MultipleInbound(_))
        ));

        let graph = PipelineGraph {
            nodes: vec![node("in", INPUT_KIND), node("a", "Average")],
            wires: vec![wire("in", "a"), wire("a", "in")],
        };
        assert!(matches!(
            build_pipeline(&graph, &registry),
            Err(PipelineBuildError::Cycle(ref id)) if id == "in"
        ));

        let graph = PipelineGraph {
            nodes: vec![node("in", INPUT_KIND), node("a", "Sharpen")],
            wires: vec![wire("in", "a")],
        };
        assert!(matches!(
            build_pipeline(&graph, &registry),
            Err(PipelineBuildError::UnknownKind { .. })
        ));

        let graph = PipelineGraph {
            nodes: vec![node("in", INPUT_KIND)],
            wires: vec![wire("in", "ghost")],
        };
        assert!(matches!(
            build_pipeline(&graph, &registry),
            Err(PipelineBuildError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_bad_parameter_fails_build() {
        let mut graph = chain_graph();
        graph.nodes[1]
            .parameters
            .insert("factor".to_string(), ParameterValue::Integer(99));
        assert!(matches!(
            build_pipeline(&graph, &StepRegistry::with_builtin()),
            Err(PipelineBuildError::Parameter { .. })
        ));
    }

    #[test]
    fn test_graph_save_load_rebuild() {
        let pipeline = build_pipeline(&chain_graph(), &StepRegistry::with_builtin()).unwrap();
        let graph = PipelineGraph::from_pipeline(&pipeline);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        graph.save(&path).unwrap();
        let loaded = PipelineGraph::load(&path).unwrap();
        assert_eq!(loaded, graph);
        let rebuilt = build_pipeline(&loaded, &StepRegistry::with_builtin()).unwrap();
        assert_eq!(rebuilt.kinds(), pipeline.kinds());
    }
}
