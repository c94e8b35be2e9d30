//! First-level (per scan) GLM pipeline
//!
//! Registration preprocessing followed by model specification, FEAT design,
//! GLM fit and cluster thresholding. Copes and their variances are sunk to
//! `<workflow_base>/<name>/results/{cope,varcb}/<condition>.<subject>/_scan_type_<t>`,
//! the layout the second-level aggregator reads. At most one structural scan
//! type is allowed, and its label segment is stripped from result paths.

use super::preprocessing::{
    add_preprocessing, PreprocessingNodes, PreprocessingOptions, Smoothing, STRUCTURAL_SCAN_TYPE_FIELD,
};
use super::{condition_subject_substitutions, finalize, DataSelection};
use crate::error::{PipelineError, Result};
use crate::execution::ExecutionConfig;
use crate::workflow::{EdgeAdapter, Interface, StimulusSchedule, Workflow};
use serde_json::json;
use std::path::PathBuf;

/// Default pipeline (and result directory) name
pub const DEFAULT_LEVEL1_NAME: &str = "level1";

/// First-level settings
#[derive(Debug, Clone, PartialEq)]
pub struct Level1Options {
    /// Pipeline name; results go to `<workflow_base>/<name>/results`
    pub name: String,
    pub template: PathBuf,
    pub smoothing: Smoothing,
    pub tr: f64,
    pub actual_size: bool,
    pub schedule: StimulusSchedule,
    /// High-pass cutoff (s) of the model specification
    pub high_pass_cutoff: f64,
    /// Cluster z threshold
    pub cluster_threshold: f64,
}

impl Level1Options {
    pub fn new(template: impl Into<PathBuf>) -> Self {
        Self {
            name: DEFAULT_LEVEL1_NAME.to_string(),
            template: template.into(),
            smoothing: Smoothing::None,
            tr: 1.0,
            actual_size: false,
            schedule: StimulusSchedule::default(),
            high_pass_cutoff: 180.0,
            cluster_threshold: 0.95,
        }
    }
}

/// Contrast weighting every stimulus block equally
pub fn all_stimulus_contrast(schedule: &StimulusSchedule) -> serde_json::Value {
    let weights = vec![1; schedule.names.len()];
    json!([["allStim", "T", schedule.names, weights]])
}

/// Condition/subject prefixes, plus the structural segment when one is iterated
pub fn result_substitutions(data: &DataSelection) -> serde_json::Value {
    let mut substitutions = Vec::new();
    if let Some(structural) = data.structural_scan_types.first() {
        substitutions.push(json!([format!("/_{}_{}", STRUCTURAL_SCAN_TYPE_FIELD, structural), ""]));
    }
    if let serde_json::Value::Array(pairs) = condition_subject_substitutions() {
        substitutions.extend(pairs);
    }
    serde_json::Value::Array(substitutions)
}

/// Build the first-level workflow
pub fn build_level1(
    data: &DataSelection,
    options: &Level1Options,
    execution: &ExecutionConfig,
) -> Result<(Workflow, PreprocessingNodes)> {
    if options.schedule.names.is_empty() {
        return Err(PipelineError::Configuration(
            "Stimulus schedule has no blocks".to_string(),
        ));
    }
    if data.structural_scan_types.len() > 1 {
        return Err(PipelineError::Configuration(format!(
            "First-level analysis takes one structural scan type, got {} ({}); pass --structural-scan-type or --no-structural",
            data.structural_scan_types.len(),
            data.structural_scan_types.join(", ")
        )));
    }

    let mut workflow = Workflow::new(options.name.clone());

    let preprocessing = PreprocessingOptions::registration(options.template.clone(), options.smoothing)
        .with_tr(options.tr)
        .with_actual_size(options.actual_size);
    let nodes = add_preprocessing(&mut workflow, data, &preprocessing)?;
    let Some(timing) = nodes.timing else {
        return Err(PipelineError::Configuration(
            "First-level analysis needs the timing node".to_string(),
        ));
    };
    let (series, series_port) = nodes.analysis_output();

    let specify_model = workflow.add_node("specify_model", Interface::SpecifyModel)?;
    workflow.set_param(specify_model, "time_repetition", options.tr)?;
    workflow.set_param(specify_model, "high_pass_filter_cutoff", options.high_pass_cutoff)?;
    workflow.connect_with(
        timing,
        "total_delay_s",
        specify_model,
        "subject_info",
        EdgeAdapter::subject_info(options.schedule.clone()),
    )?;
    workflow.connect(series, series_port, specify_model, "functional_runs")?;

    let level1design = workflow.add_node("level1design", Interface::Level1Design)?;
    workflow.set_param(level1design, "interscan_interval", options.tr)?;
    workflow.set_param(level1design, "contrasts", all_stimulus_contrast(&options.schedule))?;
    workflow.connect(specify_model, "session_info", level1design, "session_info")?;

    let modelgen = workflow.add_node("modelgen", Interface::FeatModel)?;
    workflow.connect_all(
        level1design,
        modelgen,
        &[("fsf_files", "fsf_file"), ("ev_files", "ev_files")],
    )?;

    let glm = workflow.add_node("glm", Interface::Glm)?;
    workflow.connect(series, series_port, glm, "in_file")?;
    workflow.connect_all(
        modelgen,
        glm,
        &[("design_file", "design"), ("con_file", "contrasts")],
    )?;

    let cluster = workflow.add_node("cluster", Interface::Cluster)?;
    workflow.set_param(cluster, "threshold", options.cluster_threshold)?;
    workflow.connect_all(glm, cluster, &[("out_t", "in_file"), ("out_cope", "cope_file")])?;

    let datasink = workflow.add_node("datasink", Interface::DataSink)?;
    let results = execution.base_dir.join(&options.name).join("results");
    workflow.set_param(datasink, "base_directory", results.to_string_lossy().into_owned())?;
    workflow.set_param(datasink, "substitutions", result_substitutions(data))?;
    workflow.connect_all(glm, datasink, &[("out_cope", "cope"), ("out_varcb", "varcb")])?;
    workflow.connect_all(
        cluster,
        datasink,
        &[
            ("localmax_vol_file", "localmax_vol_file"),
            ("max_file", "max_file"),
            ("mean_file", "mean_file"),
            ("pval_file", "pval_file"),
            ("size_file", "size_file"),
            ("threshold_file", "threshold_file"),
        ],
    )?;

    Ok((finalize(workflow, execution)?, nodes))
}
