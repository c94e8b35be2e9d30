//! Bruker preprocessing pipelines
//!
//! Two variants:
//!
//! - `Lite`: scan source → conversion (→ realignment), optional structural
//!   conversion. Used by the diagnostic command.
//! - `Registration`: the full functional chain from conversion to temporal
//!   filtering in template space. With structural scan types a structural
//!   branch computes the transform that warps the realigned functional data.
//!
//! Conversion keeps the acquired voxel size; unless `actual_size` is set a
//! voxel resize node scales it ×10 before anything else reads the image.
//! The structural scan type is iterated by its own `structural_info` node,
//! so its label segment (`_structural_scan_type_…`) never collides with the
//! functional `_scan_type_…` one.

use super::{finalize, DataSelection};
use crate::error::{PipelineError, Result};
use crate::execution::ExecutionConfig;
use crate::workflow::{Interface, NodeId, Workflow};
use std::path::PathBuf;

/// Iteration field of the structural scan type
pub const STRUCTURAL_SCAN_TYPE_FIELD: &str = "structural_scan_type";

/// In-plane smoothing after registration
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Smoothing {
    #[default]
    None,
    /// AFNI BlurToFWHM to the given in-plane FWHM (mm)
    BlurXy { fwhm: f64 },
}

/// Which preprocessing graph to build
#[derive(Debug, Clone, PartialEq)]
pub enum PreprocessingVariant {
    Lite { realign: bool },
    Registration { template: PathBuf, smoothing: Smoothing },
}

/// Preprocessing settings shared by every variant
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingOptions {
    pub variant: PreprocessingVariant,
    /// Repetition time (s) handed to the realigner
    pub tr: f64,
    /// Keep the acquired voxel size instead of resizing it ×10
    pub actual_size: bool,
}

impl PreprocessingOptions {
    pub fn lite(realign: bool) -> Self {
        Self {
            variant: PreprocessingVariant::Lite { realign },
            tr: 1.0,
            actual_size: false,
        }
    }

    pub fn registration(template: impl Into<PathBuf>, smoothing: Smoothing) -> Self {
        Self {
            variant: PreprocessingVariant::Registration {
                template: template.into(),
                smoothing,
            },
            tr: 1.0,
            actual_size: false,
        }
    }

    pub fn with_tr(mut self, tr: f64) -> Self {
        self.tr = tr;
        self
    }

    pub fn with_actual_size(mut self, actual_size: bool) -> Self {
        self.actual_size = actual_size;
        self
    }
}

/// Node handles other pipelines attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessingNodes {
    pub infosource: NodeId,
    pub functional_source: NodeId,
    pub functional_conversion: NodeId,
    pub realigner: Option<NodeId>,
    pub timing: Option<NodeId>,
    pub structural_conversion: Option<NodeId>,
    /// Structural image after the optional voxel resize (node, output port)
    pub structural_image: Option<(NodeId, &'static str)>,
    /// Final functional time series (node, output port)
    pub functional_output: (NodeId, &'static str),
    /// Functional time series warped with the structural transform
    pub structural_output: Option<(NodeId, &'static str)>,
}

impl PreprocessingNodes {
    /// Time series downstream statistics should use
    pub fn analysis_output(&self) -> (NodeId, &'static str) {
        self.structural_output.unwrap_or(self.functional_output)
    }
}

/// Build a standalone preprocessing workflow
pub fn build_preprocessing(
    data: &DataSelection,
    options: &PreprocessingOptions,
    execution: &ExecutionConfig,
) -> Result<(Workflow, PreprocessingNodes)> {
    let name = match options.variant {
        PreprocessingVariant::Lite { .. } => "preprocessing_lite",
        PreprocessingVariant::Registration { .. } => "preprocessing",
    };
    let mut workflow = Workflow::new(name);
    let nodes = add_preprocessing(&mut workflow, data, options)?;
    Ok((finalize(workflow, execution)?, nodes))
}

/// Add the preprocessing nodes to an existing workflow
pub fn add_preprocessing(
    workflow: &mut Workflow,
    data: &DataSelection,
    options: &PreprocessingOptions,
) -> Result<PreprocessingNodes> {
    if data.functional_scan_types.is_empty() {
        return Err(PipelineError::Configuration(
            "Preprocessing needs at least one functional scan type".to_string(),
        ));
    }

    let infosource = workflow.add_node("infosource", Interface::identity(["condition", "subject"]))?;
    workflow.set_iterables(infosource, "condition", data.axes.conditions.iter().cloned())?;
    workflow.set_iterables(infosource, "subject", data.axes.subjects.iter().cloned())?;

    let functional_source = workflow.add_node("get_functional_scan", Interface::ScanSource)?;
    workflow.set_iterables(functional_source, "scan_type", data.functional_scan_types.iter().cloned())?;
    connect_condition_subject(workflow, infosource, functional_source)?;

    let structural_source = if data.has_structural() {
        Some(add_structural_source(workflow, infosource, &data.structural_scan_types)?)
    } else {
        None
    };

    let (functional_conversion, functional_image) = add_conversion(workflow, "functional", functional_source, options)?;
    let structural = match structural_source {
        Some(source) => {
            let (conversion, image) = add_conversion(workflow, "structural", source, options)?;
            workflow.set_param(conversion, "force_conversion", true)?;
            Some((conversion, image))
        }
        None => None,
    };
    let structural_conversion = structural.map(|(conversion, _)| conversion);
    let structural_image = structural.map(|(_, image)| image);

    match &options.variant {
        PreprocessingVariant::Lite { realign } => {
            let realigner = if *realign {
                let realigner = add_realigner(workflow, options.tr)?;
                workflow.connect(functional_image.0, functional_image.1, realigner, "in_file")?;
                Some(realigner)
            } else {
                None
            };

            Ok(PreprocessingNodes {
                infosource,
                functional_source,
                functional_conversion,
                realigner,
                timing: None,
                structural_conversion,
                structural_image,
                functional_output: match realigner {
                    Some(realigner) => (realigner, "out_file"),
                    None => functional_image,
                },
                structural_output: None,
            })
        }
        PreprocessingVariant::Registration {
            template,
            smoothing,
        } => {
            let template = template.to_string_lossy().into_owned();

            let timing = workflow.add_node("timing_metadata", Interface::BrukerTiming)?;
            workflow.connect(functional_source, "scan_path", timing, "scan_directory")?;

            let realigner = add_realigner(workflow, options.tr)?;
            workflow.connect(functional_image.0, functional_image.1, realigner, "in_file")?;

            let temporal_mean = workflow.add_node("temporal_mean", Interface::MeanImage)?;
            workflow.connect(realigner, "out_file", temporal_mean, "in_file")?;

            let brain = add_bias_cutoff_bet(workflow, "functional", 30)?;
            workflow.connect(temporal_mean, "out_file", brain.0, "in_files")?;

            let (registration, warp) = add_registration_warp(workflow, "functional", &template)?;
            workflow.connect(brain.1, "out_file", registration, "moving_image")?;
            workflow.connect(realigner, "out_file", warp, "input_image")?;

            let smoothed = match smoothing {
                Smoothing::None => (warp, "output_image"),
                Smoothing::BlurXy { fwhm } => {
                    let blur = workflow.add_node("blur", Interface::BlurToFwhm)?;
                    workflow.set_param(blur, "fwhmxy", *fwhm)?;
                    workflow.connect(warp, "output_image", blur, "in_file")?;
                    (blur, "out_file")
                }
            };

            let functional_bandpass = workflow.add_node("functional_bandpass", Interface::TemporalFilter)?;
            workflow.connect(smoothed.0, smoothed.1, functional_bandpass, "in_file")?;

            let structural_output = match structural_image {
                Some((image, image_port)) => {
                    let brain = add_bias_cutoff_bet(workflow, "structural", 45)?;
                    workflow.connect(image, image_port, brain.0, "in_files")?;

                    let (registration, warp) = add_registration_warp(workflow, "structural", &template)?;
                    workflow.connect(brain.1, "out_file", registration, "moving_image")?;
                    workflow.connect(realigner, "out_file", warp, "input_image")?;

                    let structural_bandpass = workflow.add_node("structural_bandpass", Interface::TemporalFilter)?;
                    workflow.connect(warp, "output_image", structural_bandpass, "in_file")?;

                    Some((structural_bandpass, "out_file"))
                }
                None => None,
            };

            Ok(PreprocessingNodes {
                infosource,
                functional_source,
                functional_conversion,
                realigner: Some(realigner),
                timing: Some(timing),
                structural_conversion,
                structural_image,
                functional_output: (functional_bandpass, "out_file"),
                structural_output,
            })
        }
    }
}

fn connect_condition_subject(workflow: &mut Workflow, infosource: NodeId, source: NodeId) -> Result<()> {
    workflow.connect_all(
        infosource,
        source,
        &[("condition", "condition"), ("subject", "subject")],
    )?;
    Ok(())
}

/// `structural_info` iterates the structural scan types into `get_structural_scan`
fn add_structural_source(workflow: &mut Workflow, infosource: NodeId, scan_types: &[String]) -> Result<NodeId> {
    let info = workflow.add_node("structural_info", Interface::identity([STRUCTURAL_SCAN_TYPE_FIELD]))?;
    workflow.set_iterables(info, STRUCTURAL_SCAN_TYPE_FIELD, scan_types.iter().cloned())?;

    let source = workflow.add_node("get_structural_scan", Interface::ScanSource)?;
    workflow.connect(info, STRUCTURAL_SCAN_TYPE_FIELD, source, "scan_type")?;
    connect_condition_subject(workflow, infosource, source)?;
    Ok(source)
}

fn add_realigner(workflow: &mut Workflow, tr: f64) -> Result<NodeId> {
    let realigner = workflow.add_node("realigner", Interface::SpaceTimeRealigner)?;
    workflow.set_param(realigner, "tr", tr)?;
    Ok(realigner)
}

/// Bru2Nii at the acquired size, then the ×10 voxel resize unless
/// `actual_size`; returns (conversion, image output)
fn add_conversion(
    workflow: &mut Workflow,
    prefix: &str,
    source: NodeId,
    options: &PreprocessingOptions,
) -> Result<(NodeId, (NodeId, &'static str))> {
    let conversion = workflow.add_node(format!("{}_bru2nii", prefix), Interface::Bru2Nii)?;
    workflow.set_param(conversion, "actual_size", true)?;
    workflow.connect(source, "scan_path", conversion, "input_dir")?;
    if options.actual_size {
        return Ok((conversion, (conversion, "nii_file")));
    }

    let resize = workflow.add_node(format!("{}_voxel_resize", prefix), Interface::VoxelResize)?;
    workflow.connect(conversion, "nii_file", resize, "nifti_file")?;
    Ok((conversion, (resize, "resized_file")))
}

/// FAST bias correction → percentile cutoff → BET; returns (FAST, BET)
fn add_bias_cutoff_bet(workflow: &mut Workflow, prefix: &str, threshold_percent: u32) -> Result<(NodeId, NodeId)> {
    let fast = workflow.add_node(format!("{}_FAST", prefix), Interface::Fast)?;

    let cutoff = workflow.add_node(format!("{}_cutoff", prefix), Interface::ImageMaths)?;
    workflow.set_param(cutoff, "op_string", format!("-thrP {}", threshold_percent))?;
    workflow.connect(fast, "restored_image", cutoff, "in_file")?;

    let bet = workflow.add_node(format!("{}_BET", prefix), Interface::Bet)?;
    workflow.connect(cutoff, "out_file", bet, "in_file")?;

    Ok((fast, bet))
}

/// ANTs registration to the template plus the matching warp; returns (registration, warp)
fn add_registration_warp(workflow: &mut Workflow, prefix: &str, template: &str) -> Result<(NodeId, NodeId)> {
    let registration = workflow.add_node(format!("{}_registration", prefix), Interface::AntsRegistration)?;
    workflow.set_param(registration, "fixed_image", template)?;

    let warp = workflow.add_node(format!("{}_warp", prefix), Interface::AntsApplyTransforms)?;
    workflow.set_param(warp, "reference_image", template)?;
    workflow.connect(registration, "composite_transform", warp, "transforms")?;

    Ok((registration, warp))
}
