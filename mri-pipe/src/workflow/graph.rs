//! Workflow graph
//!
//! A [`Workflow`] is an append-only list of named nodes plus the edges
//! between their ports. Nodes are referenced through the [`NodeId`] handle
//! returned by [`Workflow::add_node`]; an edge may only run from an earlier
//! node to a later one, so every workflow is acyclic by construction.
//!
//! Iteration axes (`condition`, `subject`, `scan_type`, …) are declared once
//! on the node that introduces them and reach downstream nodes through the
//! edges alone.

use super::adapter::EdgeAdapter;
use super::interfaces::Interface;
use crate::error::GraphError;
use crate::execution::ExecutionConfig;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

type GraphResult<T> = std::result::Result<T, GraphError>;

/// Handle of a node within one workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Named processing step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub name: String,
    #[serde(flatten)]
    pub interface: Interface,
    pub command: &'static str,
    pub params: BTreeMap<String, Value>,
}

/// Producer output → consumer input
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub from: NodeId,
    pub output: String,
    pub to: NodeId,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<EdgeAdapter>,
}

/// Iteration axis declared on a node input
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Iterable {
    pub node: NodeId,
    pub field: String,
    pub values: Vec<String>,
}

/// Directed acyclic graph of processing steps
#[derive(Debug, Clone, Default, Serialize)]
pub struct Workflow {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    iterables: Vec<Iterable>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn iterables(&self) -> &[Iterable] {
        &self.iterables
    }

    pub fn node(&self, id: NodeId) -> GraphResult<&Node> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut Node> {
        self.nodes.get_mut(id.0).ok_or(GraphError::UnknownNode(id.0))
    }

    /// Look a node up by name
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    /// Add a node with the interface's default parameters
    pub fn add_node(&mut self, name: impl Into<String>, interface: Interface) -> GraphResult<NodeId> {
        let name = name.into();
        if self.find(&name).is_some() {
            return Err(GraphError::DuplicateNode(name));
        }

        let params = interface
            .default_params()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        self.nodes.push(Node {
            name,
            command: interface.command(),
            interface,
            params,
        });
        Ok(NodeId(self.nodes.len() - 1))
    }

    /// Set (or override) one parameter
    pub fn set_param(
        &mut self,
        id: NodeId,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> GraphResult<()> {
        self.node_mut(id)?.params.insert(key.into(), value.into());
        Ok(())
    }

    /// Connect one output to one input
    pub fn connect(&mut self, from: NodeId, output: &str, to: NodeId, input: &str) -> GraphResult<()> {
        self.connect_edge(from, output, to, input, None)
    }

    /// Connect with a value adapter on the edge
    pub fn connect_with(
        &mut self,
        from: NodeId,
        output: &str,
        to: NodeId,
        input: &str,
        adapter: EdgeAdapter,
    ) -> GraphResult<()> {
        self.connect_edge(from, output, to, input, Some(adapter))
    }

    /// Connect several (output, input) pairs between the same two nodes
    pub fn connect_all(&mut self, from: NodeId, to: NodeId, ports: &[(&str, &str)]) -> GraphResult<()> {
        for (output, input) in ports {
            self.connect(from, output, to, input)?;
        }
        Ok(())
    }

    fn connect_edge(
        &mut self,
        from: NodeId,
        output: &str,
        to: NodeId,
        input: &str,
        adapter: Option<EdgeAdapter>,
    ) -> GraphResult<()> {
        let producer = self.node(from)?;
        let consumer = self.node(to)?;

        if from.0 >= to.0 {
            return Err(GraphError::OutOfOrderEdge {
                from: producer.name.clone(),
                to: consumer.name.clone(),
            });
        }
        if !producer.interface.has_output(output) {
            return Err(GraphError::UnknownOutput {
                node: producer.name.clone(),
                port: output.to_string(),
            });
        }
        if !consumer.interface.has_input(input) {
            return Err(GraphError::UnknownInput {
                node: consumer.name.clone(),
                port: input.to_string(),
            });
        }
        if self.edges.iter().any(|e| e.to == to && e.input == input) {
            return Err(GraphError::InputAlreadyConnected {
                node: consumer.name.clone(),
                port: input.to_string(),
            });
        }

        self.edges.push(Edge {
            from,
            output: output.to_string(),
            to,
            input: input.to_string(),
            adapter,
        });
        Ok(())
    }

    /// Declare an iteration axis on a node input
    pub fn set_iterables<I, S>(&mut self, id: NodeId, field: &str, values: I) -> GraphResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = self.node(id)?;
        let duplicate = self.iterables.iter().any(|i| i.node == id && i.field == field);
        if !node.interface.has_input(field) || duplicate {
            return Err(GraphError::InvalidIterable {
                node: node.name.clone(),
                field: field.to_string(),
            });
        }

        self.iterables.push(Iterable {
            node: id,
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        });
        Ok(())
    }

    /// Copy the execution output type into every FSL/AFNI node
    pub fn apply_execution(&mut self, execution: &ExecutionConfig) {
        for node in &mut self.nodes {
            if node.interface.uses_output_type() {
                node.params.insert(
                    "output_type".to_string(),
                    Value::from(execution.output_type.as_str()),
                );
            }
        }
    }

    /// Edges ending at `id`
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// True if the input is fed by an edge, a parameter or an iterable
    pub fn is_input_satisfied(&self, id: NodeId, port: &str) -> bool {
        self.incoming(id).any(|e| e.input == port)
            || self.nodes[id.0].params.contains_key(port)
            || self.iterables.iter().any(|i| i.node == id && i.field == port)
    }

    /// Check required inputs and acyclicity
    pub fn validate(&self) -> GraphResult<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            for port in node.interface.inputs().iter().filter(|p| p.required) {
                if !self.is_input_satisfied(NodeId(index), &port.name) {
                    return Err(GraphError::UnconnectedInput {
                        node: node.name.clone(),
                        port: port.name.clone(),
                    });
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm; ties resolved by declaration order
    pub fn topological_order(&self) -> GraphResult<Vec<NodeId>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        for edge in &self.edges {
            if successors[edge.from.0].insert(edge.to.0) {
                in_degree[edge.to.0] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(index) = ready.pop_front() {
            order.push(NodeId(index));
            for next in &successors[index] {
                in_degree[*next] -= 1;
                if in_degree[*next] == 0 {
                    ready.push_back(*next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(GraphError::Cycle(self.name.clone()));
        }
        Ok(order)
    }

    /// Indices into [`Workflow::iterables`] that reach each node, per node
    pub fn iteration_axes(&self) -> GraphResult<Vec<Vec<usize>>> {
        let mut axes: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); self.nodes.len()];
        for id in self.topological_order()? {
            let mut own: BTreeSet<usize> = self
                .iterables
                .iter()
                .enumerate()
                .filter(|(_, it)| it.node == id)
                .map(|(i, _)| i)
                .collect();
            for edge in self.incoming(id) {
                own.extend(axes[edge.from.0].iter().copied());
            }
            axes[id.0] = own;
        }
        Ok(axes.into_iter().map(|s| s.into_iter().collect()).collect())
    }
}
