//! Iteration expansion
//!
//! Turns a template [`Workflow`] into concrete node instances, one per
//! combination of the iteration axes that reach each node. Source nodes are
//! resolved per combination through a [`SourceResolver`]; when one fails,
//! only the instances downstream of it are dropped and the failure is
//! recorded with its iteration tuple.

use super::adapter::EdgeAdapter;
use super::graph::{Iterable, Node, NodeId, Workflow};
use super::interfaces::Interface;
use crate::error::Result;
use mri_common::bids::apply_substitutions;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Iteration field → value
///
/// A field iterated on by several nodes is keyed `node.field`.
pub type Bindings = BTreeMap<String, String>;

/// Resolves source nodes for one iteration tuple
pub trait SourceResolver {
    /// Output values of `node` given its known input values
    fn resolve(&self, node: &Node, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>>;
}

/// One node for one iteration tuple
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInstance {
    pub node: NodeId,
    pub name: String,
    /// Iteration label such as `_condition_ofM_subject_4008/_scan_type_EPI`
    pub label: String,
    pub bindings: Bindings,
    /// Input values known at planning time
    pub inputs: BTreeMap<String, Value>,
    /// Output values known at planning time
    pub outputs: BTreeMap<String, Value>,
}

impl NodeInstance {
    /// Engine work directory of the instance, relative to the workflow
    pub fn work_path(&self) -> String {
        if self.label.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.label, self.name)
        }
    }
}

/// Edge between two instances (indices into `ExpandedWorkflow::instances`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceEdge {
    pub from: usize,
    pub output: String,
    pub to: usize,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<EdgeAdapter>,
}

/// Source resolution failure of one branch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchFailure {
    pub node: String,
    pub bindings: Bindings,
    pub error: String,
}

impl fmt::Display for BranchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tuple: Vec<String> = self
            .bindings
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{} [{}]: {}", self.node, tuple.join(", "), self.error)
    }
}

/// Fully instantiated workflow
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExpandedWorkflow {
    pub workflow: String,
    pub instances: Vec<NodeInstance>,
    pub edges: Vec<InstanceEdge>,
    pub failures: Vec<BranchFailure>,
    /// Instances dropped because an upstream instance failed
    pub pruned: usize,
}

impl ExpandedWorkflow {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Instances of one template node
    pub fn instances_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a NodeInstance> + 'a {
        self.instances.iter().filter(move |i| i.name == name)
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Live(usize),
    Dead,
}

impl Workflow {
    /// Instantiate every node for every iteration tuple that reaches it
    pub fn expand(&self, resolver: &dyn SourceResolver) -> Result<ExpandedWorkflow> {
        self.validate()?;
        let order = self.topological_order()?;
        let axes = self.iteration_axes()?;
        let iterables = self.iterables();
        let axis_keys: Vec<String> = iterables
            .iter()
            .map(|it| {
                if iterables.iter().filter(|o| o.field == it.field).count() > 1 {
                    format!("{}.{}", self.nodes()[it.node.index()].name, it.field)
                } else {
                    it.field.clone()
                }
            })
            .collect();

        let mut expanded = ExpandedWorkflow {
            workflow: self.name().to_string(),
            ..Default::default()
        };
        let mut slots: Vec<BTreeMap<Vec<(usize, usize)>, Slot>> = vec![BTreeMap::new(); self.nodes().len()];

        for id in order {
            let node = self.node(id)?;
            let node_axes = &axes[id.index()];
            let lengths: Vec<usize> = node_axes.iter().map(|a| iterables[*a].values.len()).collect();

            for combination in combinations(&lengths) {
                let tuple: Vec<(usize, usize)> = node_axes.iter().copied().zip(combination).collect();
                let bindings: Bindings = tuple
                    .iter()
                    .map(|(axis, value)| (axis_keys[*axis].clone(), iterables[*axis].values[*value].clone()))
                    .collect();
                let label = iteration_label(&tuple, iterables);

                let mut inputs = BTreeMap::new();
                let mut pending_edges = Vec::new();
                let mut upstream_dead = false;

                for edge in self.incoming(id) {
                    let from_axes = &axes[edge.from.index()];
                    let key: Vec<(usize, usize)> = tuple
                        .iter()
                        .filter(|(axis, _)| from_axes.contains(axis))
                        .copied()
                        .collect();

                    let Some(Slot::Live(from)) = slots[edge.from.index()].get(&key).copied() else {
                        upstream_dead = true;
                        break;
                    };

                    if let Some(value) = expanded.instances[from].outputs.get(&edge.output) {
                        let value = match &edge.adapter {
                            Some(adapter) => adapter.apply(value),
                            None => Some(value.clone()),
                        };
                        if let Some(value) = value {
                            inputs.insert(edge.input.clone(), value);
                        }
                    }
                    pending_edges.push((from, edge));
                }

                if upstream_dead {
                    slots[id.index()].insert(tuple, Slot::Dead);
                    expanded.pruned += 1;
                    continue;
                }

                for (axis, value) in &tuple {
                    let iterable = &iterables[*axis];
                    if iterable.node == id {
                        inputs.insert(
                            iterable.field.clone(),
                            Value::String(iterable.values[*value].clone()),
                        );
                    }
                }

                let outputs = match &node.interface {
                    Interface::Identity { fields } => fields
                        .iter()
                        .filter_map(|f| inputs.get(f).map(|v| (f.clone(), v.clone())))
                        .collect(),
                    interface if interface.is_source() => match resolver.resolve(node, &inputs) {
                        Ok(outputs) => outputs,
                        Err(e) => {
                            tracing::warn!(
                                node = %node.name,
                                tuple = ?bindings,
                                error = %e,
                                "Branch failed, downstream nodes skipped"
                            );
                            expanded.failures.push(BranchFailure {
                                node: node.name.clone(),
                                bindings,
                                error: e.to_string(),
                            });
                            slots[id.index()].insert(tuple, Slot::Dead);
                            continue;
                        }
                    },
                    Interface::DataSink => {
                        sink_destinations(node, pending_edges.iter().map(|(_, e)| e.input.as_str()), &label)
                    }
                    _ => BTreeMap::new(),
                };

                let index = expanded.instances.len();
                for (from, edge) in pending_edges {
                    expanded.edges.push(InstanceEdge {
                        from,
                        output: edge.output.clone(),
                        to: index,
                        input: edge.input.clone(),
                        adapter: edge.adapter.clone(),
                    });
                }
                expanded.instances.push(NodeInstance {
                    node: id,
                    name: node.name.clone(),
                    label,
                    bindings,
                    inputs,
                    outputs,
                });
                slots[id.index()].insert(tuple, Slot::Live(index));
            }
        }

        tracing::info!(
            workflow = %expanded.workflow,
            instances = expanded.instances.len(),
            failed = expanded.failures.len(),
            pruned = expanded.pruned,
            "Workflow expanded"
        );

        Ok(expanded)
    }
}

/// `_field_value` segments; one path component per iterating node
fn iteration_label(tuple: &[(usize, usize)], iterables: &[Iterable]) -> String {
    let mut components: Vec<String> = Vec::new();
    let mut last_node = None;
    for (axis, value) in tuple {
        let iterable = &iterables[*axis];
        let segment = format!("_{}_{}", iterable.field, iterable.values[*value]);
        match components.last_mut() {
            Some(component) if last_node == Some(iterable.node) => component.push_str(&segment),
            _ => components.push(segment),
        }
        last_node = Some(iterable.node);
    }
    components.join("/")
}

/// Result directory per sink input: `<base>/<input>/<label>` after substitutions
///
/// Inputs named `@…` are stored directly below the base directory.
fn sink_destinations<'a>(
    node: &Node,
    ports: impl Iterator<Item = &'a str>,
    label: &str,
) -> BTreeMap<String, Value> {
    let base = node
        .params
        .get("base_directory")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let substitutions: Vec<(String, String)> = node
        .params
        .get("substitutions")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    ports
        .map(|port| {
            let mut path = PathBuf::from(base);
            if !port.starts_with('@') {
                path.push(port);
            }
            if !label.is_empty() {
                path.push(label);
            }
            let destination = apply_substitutions(&path.to_string_lossy(), &substitutions);
            (port.to_string(), Value::String(destination))
        })
        .collect()
}

/// Every index combination, first axis outermost
fn combinations(lengths: &[usize]) -> Vec<Vec<usize>> {
    lengths.iter().fold(vec![Vec::new()], |acc, &len| {
        acc.into_iter()
            .flat_map(|prefix| {
                (0..len).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use serde_json::json;

    struct FailingSubject(&'static str);

    impl SourceResolver for FailingSubject {
        fn resolve(&self, _node: &Node, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
            let subject = inputs["subject"].as_str().unwrap_or_default();
            if subject == self.0 {
                return Err(PipelineError::scan_not_found("c", subject, "EPI"));
            }
            Ok(BTreeMap::from([(
                "scan_path".to_string(),
                json!(format!("/data/{}", subject)),
            )]))
        }
    }

    fn workflow() -> Workflow {
        let mut wf = Workflow::new("test");
        let info = wf.add_node("infosource", Interface::identity(["condition", "subject"])).unwrap();
        wf.set_iterables(info, "condition", ["c"]).unwrap();
        wf.set_iterables(info, "subject", ["1", "2"]).unwrap();
        let source = wf.add_node("get_scan", Interface::ScanSource).unwrap();
        wf.set_iterables(source, "scan_type", ["EPI"]).unwrap();
        wf.connect_all(info, source, &[("condition", "condition"), ("subject", "subject")])
            .unwrap();
        let convert = wf.add_node("bru2nii", Interface::Bru2Nii).unwrap();
        wf.connect(source, "scan_path", convert, "input_dir").unwrap();
        wf
    }

    #[test]
    fn test_combinations() {
        assert_eq!(combinations(&[]), vec![Vec::<usize>::new()]);
        assert_eq!(
            combinations(&[2, 2]),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert!(combinations(&[2, 0]).is_empty());
    }

    #[test]
    fn test_one_instance_per_tuple() {
        let expanded = workflow().expand(&FailingSubject("none")).unwrap();
        assert_eq!(expanded.instances_of("infosource").count(), 2);
        assert_eq!(expanded.instances_of("bru2nii").count(), 2);

        let convert = expanded.instances_of("bru2nii").next().unwrap();
        assert_eq!(convert.label, "_condition_c_subject_1/_scan_type_EPI");
        assert_eq!(convert.inputs["input_dir"], json!("/data/1"));
        assert!(expanded.is_complete());
    }

    #[test]
    fn test_failure_prunes_only_its_branch() {
        let expanded = workflow().expand(&FailingSubject("2")).unwrap();
        assert_eq!(expanded.failures.len(), 1);
        assert_eq!(expanded.failures[0].bindings["subject"], "2");
        assert_eq!(expanded.pruned, 1);

        let converted: Vec<_> = expanded
            .instances_of("bru2nii")
            .map(|i| i.bindings["subject"].clone())
            .collect();
        assert_eq!(converted, vec!["1"]);
    }
}
