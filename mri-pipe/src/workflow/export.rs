//! Plan export
//!
//! Writes what the execution engine consumes: the template graph
//! (`graph.json`), the expanded plan with the execution settings
//! (`plan.json`) and a GraphViz rendering (`graph.dot`).

use super::expand::ExpandedWorkflow;
use super::graph::Workflow;
use crate::error::Result;
use crate::execution::ExecutionConfig;
use chrono::Utc;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Expanded plan as handed to the engine
#[derive(Debug, Serialize)]
pub struct Plan<'a> {
    pub workflow: &'a str,
    pub generated_at: String,
    pub generator: String,
    pub execution: &'a ExecutionConfig,
    pub plugin_args: serde_json::Value,
    pub graph: &'a Workflow,
    pub expanded: &'a ExpandedWorkflow,
}

impl<'a> Plan<'a> {
    pub fn new(workflow: &'a Workflow, expanded: &'a ExpandedWorkflow, execution: &'a ExecutionConfig) -> Self {
        Self {
            workflow: workflow.name(),
            generated_at: Utc::now().to_rfc3339(),
            generator: format!("mri-pipe {} ({})", env!("CARGO_PKG_VERSION"), env!("MRI_PIPE_COMMIT")),
            execution,
            plugin_args: execution.plugin_args(),
            graph: workflow,
            expanded,
        }
    }
}

/// Files written by [`write_plan`]
#[derive(Debug, Clone)]
pub struct PlanFiles {
    pub graph_json: PathBuf,
    pub plan_json: PathBuf,
    pub graph_dot: PathBuf,
}

/// Write `graph.json`, `plan.json` and `graph.dot` into `dir`
pub fn write_plan(
    dir: &Path,
    workflow: &Workflow,
    expanded: &ExpandedWorkflow,
    execution: &ExecutionConfig,
) -> Result<PlanFiles> {
    std::fs::create_dir_all(dir)?;

    let files = PlanFiles {
        graph_json: dir.join("graph.json"),
        plan_json: dir.join("plan.json"),
        graph_dot: dir.join("graph.dot"),
    };

    std::fs::write(&files.graph_json, serde_json::to_string_pretty(workflow)?)?;
    let plan = Plan::new(workflow, expanded, execution);
    std::fs::write(&files.plan_json, serde_json::to_string_pretty(&plan)?)?;
    std::fs::write(&files.graph_dot, to_dot(workflow))?;

    tracing::info!(dir = %dir.display(), "Plan written");
    Ok(files)
}

/// GraphViz rendering of the template graph
///
/// Nodes carrying iterables are drawn as double octagons and list their
/// axes; edge labels name the connected ports.
pub fn to_dot(workflow: &Workflow) -> String {
    let mut dot = String::new();
    let _ = writeln!(dot, "digraph \"{}\" {{", escape(workflow.name()));
    let _ = writeln!(dot, "  rankdir=TB;");
    let _ = writeln!(dot, "  node [shape=box];");

    for (index, node) in workflow.nodes().iter().enumerate() {
        let axes: Vec<&str> = workflow
            .iterables()
            .iter()
            .filter(|i| i.node.index() == index)
            .map(|i| i.field.as_str())
            .collect();
        if axes.is_empty() {
            let _ = writeln!(
                dot,
                "  n{} [label=\"{}\\n({})\"];",
                index,
                escape(&node.name),
                escape(node.command)
            );
        } else {
            let _ = writeln!(
                dot,
                "  n{} [label=\"{}\\n[{}]\", shape=doubleoctagon];",
                index,
                escape(&node.name),
                escape(&axes.join(", "))
            );
        }
    }

    for edge in workflow.edges() {
        let _ = writeln!(
            dot,
            "  n{} -> n{} [label=\"{} -> {}\"];",
            edge.from.index(),
            edge.to.index(),
            escape(&edge.output),
            escape(&edge.input)
        );
    }

    dot.push_str("}\n");
    dot
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
