//! Pipeline assembly
//!
//! Each pipeline is a named variant that builds one [`Workflow`] from a
//! prepared [`DataSelection`] and an explicit [`ExecutionConfig`].

pub mod diagnostic;
pub mod level1;
pub mod level2;
pub mod preprocessing;

use crate::catalog::{ScanCatalog, ScanCategory, ScanClassification};
use crate::error::{PipelineError, Result};
use crate::execution::ExecutionConfig;
use crate::resolver::{resolve, TieBreak};
use crate::selection::{resolve_defaults, select, IterationAxes, Selection, SelectionCriteria};
use crate::workflow::{Interface, Node, SourceResolver, Workflow};
use serde_json::Value;
use std::collections::BTreeMap;

/// Structural scan types requested by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StructuralScans {
    /// Every scan type classified as structural
    #[default]
    Classified,
    /// Exactly these (an empty list behaves like `Classified`)
    Types(Vec<String>),
    /// No structural branch
    Disabled,
}

/// Functional and structural scan types requested by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanTypeRequest {
    /// Empty means every scan type classified as functional
    pub functional: Vec<String>,
    pub structural: StructuralScans,
}

impl ScanTypeRequest {
    /// Fill empty lists from the classification table
    pub fn resolve(&self, classification: &ScanClassification) -> Result<(Vec<String>, Vec<String>)> {
        let functional = if self.functional.is_empty() {
            classification.scan_types(ScanCategory::Functional)
        } else {
            self.functional.clone()
        };
        if functional.is_empty() {
            return Err(PipelineError::Configuration(
                "No functional scan types given and none classified as functional".to_string(),
            ));
        }

        let structural = match &self.structural {
            StructuralScans::Types(types) if !types.is_empty() => types.clone(),
            StructuralScans::Types(_) | StructuralScans::Classified => {
                classification.scan_types(ScanCategory::Structural)
            }
            StructuralScans::Disabled => Vec::new(),
        };

        Ok((functional, structural))
    }
}

/// Catalog, selection and iteration axes for one pipeline run
#[derive(Debug, Clone)]
pub struct DataSelection {
    pub catalog: ScanCatalog,
    pub criteria: SelectionCriteria,
    pub selection: Selection,
    pub axes: IterationAxes,
    pub functional_scan_types: Vec<String>,
    pub structural_scan_types: Vec<String>,
}

impl DataSelection {
    /// Resolve scan types, filter the catalog and infer default axes
    ///
    /// The criteria's scan types are replaced by the union of the functional
    /// and structural scan types.
    pub fn prepare(
        catalog: ScanCatalog,
        mut criteria: SelectionCriteria,
        scan_types: &ScanTypeRequest,
        classification: &ScanClassification,
    ) -> Result<Self> {
        let (functional, structural) = scan_types.resolve(classification)?;

        criteria.scan_types = functional.iter().chain(structural.iter()).cloned().collect();
        let selection = select(&catalog, &criteria);
        let axes = resolve_defaults(&selection, &criteria);

        if selection.is_empty() {
            tracing::warn!(
                root = %catalog.root().display(),
                "Selection is empty, the workflow will have no branches"
            );
        }
        tracing::info!(
            selected = selection.len(),
            conditions = ?axes.conditions,
            subjects = ?axes.subjects,
            functional = ?functional,
            structural = ?structural,
            "Data selection prepared"
        );

        Ok(Self {
            catalog,
            criteria,
            selection,
            axes,
            functional_scan_types: functional,
            structural_scan_types: structural,
        })
    }

    pub fn has_structural(&self) -> bool {
        !self.structural_scan_types.is_empty()
    }

    /// Source resolver over this selection
    pub fn resolver(&self, tie_break: TieBreak) -> CatalogResolver<'_> {
        CatalogResolver {
            selection: &self.selection,
            tie_break,
        }
    }
}

/// Resolves scan source nodes against a selection
pub struct CatalogResolver<'a> {
    selection: &'a Selection,
    tie_break: TieBreak,
}

impl SourceResolver for CatalogResolver<'_> {
    fn resolve(&self, node: &Node, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        if node.interface != Interface::ScanSource {
            return Err(PipelineError::Configuration(format!(
                "Node {} cannot be resolved from the scan catalog",
                node.name
            )));
        }

        let condition = string_input(node, inputs, "condition")?;
        let subject = string_input(node, inputs, "subject")?;
        let scan_type = string_input(node, inputs, "scan_type")?;

        let path = resolve(self.selection, condition, subject, scan_type, self.tie_break)?;
        tracing::debug!(
            node = %node.name,
            condition,
            subject,
            scan_type,
            path = %path.display(),
            "Scan resolved"
        );

        Ok(BTreeMap::from([
            (
                "scan_path".to_string(),
                Value::String(path.to_string_lossy().into_owned()),
            ),
            ("scan_type".to_string(), Value::String(scan_type.to_string())),
        ]))
    }
}

/// String input value known at planning time
pub(crate) fn string_input<'a>(
    node: &Node,
    inputs: &'a BTreeMap<String, Value>,
    port: &str,
) -> Result<&'a str> {
    inputs.get(port).and_then(Value::as_str).ok_or_else(|| {
        PipelineError::Configuration(format!(
            "Node {} needs a planning-time value for {}",
            node.name, port
        ))
    })
}

/// Sink substitutions that strip the condition/subject iteration prefixes
pub fn condition_subject_substitutions() -> Value {
    serde_json::json!([["_condition_", ""], ["_subject_", "."]])
}

/// Finish a workflow: copy execution settings into node parameters and validate
pub(crate) fn finalize(mut workflow: Workflow, execution: &ExecutionConfig) -> Result<Workflow> {
    workflow.apply_execution(execution);
    workflow.validate()?;
    tracing::info!(
        workflow = %workflow.name(),
        nodes = workflow.nodes().len(),
        edges = workflow.edges().len(),
        "Workflow assembled"
    );
    Ok(workflow)
}
