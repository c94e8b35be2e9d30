//! Diagnostic pipeline
//!
//! Lite preprocessing followed by MELODIC, for a quick look at freshly
//! acquired measurements. Reports land in `<workflow_base>/DIAGNOSTIC`, the
//! plan in `<workflow_base>/DIAGNOSTIC_work`.

use super::preprocessing::{add_preprocessing, PreprocessingNodes, PreprocessingOptions};
use super::{condition_subject_substitutions, finalize, DataSelection};
use crate::bruker::is_measurement_dir;
use crate::error::Result;
use crate::execution::ExecutionConfig;
use crate::workflow::{Interface, Workflow};
use std::path::{Path, PathBuf};

/// Result directory name below the workflow base
pub const DIAGNOSTIC_DIR: &str = "DIAGNOSTIC";
/// Workflow name, also the plan directory below the workflow base
pub const DIAGNOSTIC_WORK: &str = "DIAGNOSTIC_work";

/// Measurements root after single-measurement detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRoot {
    pub root: PathBuf,
    /// Set when the given path was itself a measurement directory
    pub measurement: Option<String>,
}

/// Treat `path` as a measurements root, or as one measurement if it carries the marker files
pub fn detect_root(path: &Path) -> DiagnosticRoot {
    if !is_measurement_dir(path) {
        return DiagnosticRoot {
            root: path.to_path_buf(),
            measurement: None,
        };
    }

    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let measurement = name.to_string_lossy().into_owned();
            tracing::info!(
                measurement = %measurement,
                root = %parent.display(),
                "Single measurement directory detected"
            );
            DiagnosticRoot {
                root: parent.to_path_buf(),
                measurement: Some(measurement),
            }
        }
        _ => DiagnosticRoot {
            root: path,
            measurement: None,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticOptions {
    pub realign: bool,
    /// Repetition time (s) for realignment and MELODIC
    pub tr: f64,
}

impl Default for DiagnosticOptions {
    fn default() -> Self {
        Self {
            realign: false,
            tr: 1.0,
        }
    }
}

/// Build the diagnostic workflow
pub fn build_diagnostic(
    data: &DataSelection,
    options: &DiagnosticOptions,
    execution: &ExecutionConfig,
) -> Result<(Workflow, PreprocessingNodes)> {
    let mut workflow = Workflow::new(DIAGNOSTIC_WORK);

    let preprocessing = PreprocessingOptions::lite(options.realign).with_tr(options.tr);
    let nodes = add_preprocessing(&mut workflow, data, &preprocessing)?;
    let (series, series_port) = nodes.functional_output;

    let melodic = workflow.add_node("melodic", Interface::Melodic)?;
    workflow.set_param(melodic, "tr_sec", options.tr)?;
    workflow.connect(series, series_port, melodic, "in_files")?;

    let datasink = workflow.add_node("datasink", Interface::DataSink)?;
    let results = execution.base_dir.join(DIAGNOSTIC_DIR);
    workflow.set_param(datasink, "base_directory", results.to_string_lossy().into_owned())?;
    workflow.set_param(datasink, "substitutions", condition_subject_substitutions())?;
    workflow.connect(melodic, "report_dir", datasink, "MELODIC_reports")?;
    if let Some((structural, port)) = nodes.structural_image {
        workflow.connect(structural, port, datasink, "structural")?;
    }

    Ok((finalize(workflow, execution)?, nodes))
}

/// Plan directory of the diagnostic workflow
pub fn plan_dir(execution: &ExecutionConfig) -> PathBuf {
    execution.base_dir.join(DIAGNOSTIC_WORK)
}
