//! Catalogue of node interfaces
//!
//! Each [`Interface`] names one external tool (or in-engine helper) and
//! declares its input ports, output ports and default parameters. The
//! tools themselves run inside the execution engine; this module only
//! describes them.

use serde::Serialize;
use serde_json::{json, Value};

/// Tool family of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolkit {
    /// Provided by the execution engine itself
    Engine,
    /// Resolved at planning time by this crate
    Planner,
    /// Commands of this binary
    MriPipe,
    Bruker,
    Nipy,
    Fsl,
    Afni,
    Ants,
}

/// One input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Port {
    pub name: String,
    pub required: bool,
}

type PortTable = (&'static [(&'static str, bool)], &'static [&'static str]);

const SCAN_SOURCE: PortTable = (
    &[("condition", true), ("subject", true), ("scan_type", true)],
    &["scan_path", "scan_type"],
);
const LEVEL2_SOURCE: PortTable = (&[("group", true)], &["copes", "varcbs"]);
const BRU2NII: PortTable = (&[("input_dir", true)], &["nii_file"]);
const BRUKER_TIMING: PortTable = (
    &[("scan_directory", true)],
    &["total_delay_s", "repetition_time_s", "dummy_scans"],
);
const REALIGNER: PortTable = (&[("in_file", true)], &["out_file", "par_file"]);
const IN_OUT: PortTable = (&[("in_file", true)], &["out_file"]);
const FAST: PortTable = (&[("in_files", true)], &["restored_image", "bias_field"]);
const BET: PortTable = (&[("in_file", true)], &["out_file", "mask_file"]);
const ANTS_REGISTRATION: PortTable = (
    &[("moving_image", true), ("fixed_image", true)],
    &["composite_transform", "inverse_composite_transform", "warped_image"],
);
const ANTS_APPLY: PortTable = (
    &[("input_image", true), ("transforms", true), ("reference_image", true)],
    &["output_image"],
);
const SPECIFY_MODEL: PortTable = (
    &[("subject_info", true), ("functional_runs", true)],
    &["session_info"],
);
const LEVEL1_DESIGN: PortTable = (&[("session_info", true)], &["fsf_files", "ev_files"]);
const FEAT_MODEL: PortTable = (
    &[("fsf_file", true), ("ev_files", true)],
    &["design_file", "con_file"],
);
const GLM: PortTable = (
    &[("in_file", true), ("design", true), ("contrasts", false)],
    &["out_cope", "out_varcb", "out_file", "out_t", "out_p"],
);
const CLUSTER: PortTable = (
    &[("in_file", true), ("cope_file", false)],
    &[
        "index_file",
        "localmax_vol_file",
        "max_file",
        "mean_file",
        "pval_file",
        "size_file",
        "threshold_file",
    ],
);
const MERGE: PortTable = (&[("in_files", true), ("merged_file", false)], &["merged_file"]);
const L2MODEL: PortTable = (&[("num_copes", true)], &["design_mat", "design_con", "design_grp"]);
const FLAMEO: PortTable = (
    &[
        ("cope_file", true),
        ("var_cope_file", true),
        ("design_file", true),
        ("cov_split_file", true),
        ("t_con_file", true),
        ("mask_file", true),
    ],
    &["copes", "var_copes", "tstats", "zstats", "fstats"],
);
const MELODIC: PortTable = (&[("in_files", true)], &["out_dir", "report_dir"]);
const VOXEL_RESIZE: PortTable = (&[("nifti_file", true)], &["resized_file"]);
const DATA_SINK: PortTable = (&[], &[]);

/// External processing step wrapped by a workflow node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "interface", rename_all = "snake_case")]
pub enum Interface {
    /// Passes its fields through; carries iterables
    Identity { fields: Vec<String> },
    /// Scan directory for one (condition, subject, scan type)
    ScanSource,
    /// First-level cope and varcb files of one aggregation group
    Level2Source,
    /// Bruker to NIfTI conversion
    Bru2Nii,
    /// Acquisition delay and repetition time of a scan
    BrukerTiming,
    /// Simultaneous slice timing and motion correction
    SpaceTimeRealigner,
    MeanImage,
    /// Bias field correction
    Fast,
    ImageMaths,
    /// Brain extraction
    Bet,
    AntsRegistration,
    AntsApplyTransforms,
    BlurToFwhm,
    TemporalFilter,
    SpecifyModel,
    Level1Design,
    FeatModel,
    Glm,
    Cluster,
    Merge,
    L2Model,
    Flameo,
    Melodic,
    /// Copies results into the output tree; accepts any input name
    DataSink,
    VoxelResize,
}

impl Interface {
    /// Identity interface over the given fields
    pub fn identity<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Identity {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    fn ports(&self) -> PortTable {
        match self {
            Self::Identity { .. } | Self::DataSink => DATA_SINK,
            Self::ScanSource => SCAN_SOURCE,
            Self::Level2Source => LEVEL2_SOURCE,
            Self::Bru2Nii => BRU2NII,
            Self::BrukerTiming => BRUKER_TIMING,
            Self::SpaceTimeRealigner => REALIGNER,
            Self::MeanImage | Self::ImageMaths | Self::BlurToFwhm | Self::TemporalFilter => IN_OUT,
            Self::Fast => FAST,
            Self::Bet => BET,
            Self::AntsRegistration => ANTS_REGISTRATION,
            Self::AntsApplyTransforms => ANTS_APPLY,
            Self::SpecifyModel => SPECIFY_MODEL,
            Self::Level1Design => LEVEL1_DESIGN,
            Self::FeatModel => FEAT_MODEL,
            Self::Glm => GLM,
            Self::Cluster => CLUSTER,
            Self::Merge => MERGE,
            Self::L2Model => L2MODEL,
            Self::Flameo => FLAMEO,
            Self::Melodic => MELODIC,
            Self::VoxelResize => VOXEL_RESIZE,
        }
    }

    /// Declared input ports
    pub fn inputs(&self) -> Vec<Port> {
        if let Self::Identity { fields } = self {
            return fields
                .iter()
                .map(|f| Port {
                    name: f.clone(),
                    required: false,
                })
                .collect();
        }
        self.ports()
            .0
            .iter()
            .map(|(name, required)| Port {
                name: name.to_string(),
                required: *required,
            })
            .collect()
    }

    /// Declared output ports
    pub fn outputs(&self) -> Vec<String> {
        if let Self::Identity { fields } = self {
            return fields.clone();
        }
        self.ports().1.iter().map(|s| s.to_string()).collect()
    }

    pub fn has_input(&self, port: &str) -> bool {
        matches!(self, Self::DataSink) || self.inputs().iter().any(|p| p.name == port)
    }

    pub fn has_output(&self, port: &str) -> bool {
        self.outputs().iter().any(|p| p == port)
    }

    /// Resolved per iteration tuple at planning time
    pub fn is_source(&self) -> bool {
        matches!(self, Self::ScanSource | Self::Level2Source)
    }

    pub fn toolkit(&self) -> Toolkit {
        match self {
            Self::Identity { .. } | Self::DataSink | Self::SpecifyModel => Toolkit::Engine,
            Self::ScanSource | Self::Level2Source => Toolkit::Planner,
            Self::BrukerTiming | Self::VoxelResize => Toolkit::MriPipe,
            Self::Bru2Nii => Toolkit::Bruker,
            Self::SpaceTimeRealigner => Toolkit::Nipy,
            Self::BlurToFwhm => Toolkit::Afni,
            Self::AntsRegistration | Self::AntsApplyTransforms => Toolkit::Ants,
            Self::MeanImage
            | Self::Fast
            | Self::ImageMaths
            | Self::Bet
            | Self::TemporalFilter
            | Self::Level1Design
            | Self::FeatModel
            | Self::Glm
            | Self::Cluster
            | Self::Merge
            | Self::L2Model
            | Self::Flameo
            | Self::Melodic => Toolkit::Fsl,
        }
    }

    /// FSL and AFNI tools take the image output type as a parameter
    pub fn uses_output_type(&self) -> bool {
        matches!(self.toolkit(), Toolkit::Fsl | Toolkit::Afni)
    }

    /// Executable (or engine helper) the node runs
    pub fn command(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "IdentityInterface",
            Self::ScanSource => "scan_source",
            Self::Level2Source => "level2_source",
            Self::Bru2Nii => "Bru2",
            Self::BrukerTiming => "mri-pipe scan-info",
            Self::SpaceTimeRealigner => "SpaceTimeRealigner",
            Self::MeanImage => "fslmaths -Tmean",
            Self::Fast => "fast",
            Self::ImageMaths => "fslmaths",
            Self::Bet => "bet",
            Self::AntsRegistration => "antsRegistration",
            Self::AntsApplyTransforms => "antsApplyTransforms",
            Self::BlurToFwhm => "3dBlurToFWHM",
            Self::TemporalFilter => "fslmaths -bptf",
            Self::SpecifyModel => "SpecifyModel",
            Self::Level1Design => "Level1Design",
            Self::FeatModel => "feat_model",
            Self::Glm => "fsl_glm",
            Self::Cluster => "cluster",
            Self::Merge => "fslmerge",
            Self::L2Model => "L2Model",
            Self::Flameo => "flameo",
            Self::Melodic => "melodic",
            Self::DataSink => "DataSink",
            Self::VoxelResize => "mri-pipe resize-voxels",
        }
    }

    /// Parameters every node of this interface starts with
    pub fn default_params(&self) -> Vec<(&'static str, Value)> {
        match self {
            Self::Bru2Nii => vec![("actual_size", json!(false))],
            Self::SpaceTimeRealigner => vec![
                ("slice_times", json!("asc_alt_2")),
                ("tr", json!(1.0)),
                // 3 = coronal slices
                ("slice_info", json!(3)),
            ],
            Self::Fast => vec![
                ("segments", json!(false)),
                ("output_biascorrected", json!(true)),
                ("bias_iters", json!(8)),
            ],
            Self::Bet => vec![("mask", json!(true)), ("frac", json!(0.5))],
            Self::AntsRegistration => vec![
                ("dimension", json!(3)),
                ("transforms", json!(["Rigid", "Affine", "SyN"])),
                ("metric", json!(["MI", "MI", "CC"])),
                ("write_composite_transform", json!(true)),
                ("collapse_output_transforms", json!(true)),
            ],
            Self::AntsApplyTransforms => vec![
                ("dimension", json!(3)),
                ("input_image_type", json!(3)),
                ("interpolation", json!("Linear")),
            ],
            Self::TemporalFilter => vec![
                ("highpass_sigma", json!(180)),
                ("lowpass_sigma", json!(1)),
            ],
            Self::SpecifyModel => vec![
                ("input_units", json!("secs")),
                ("time_repetition", json!(1.0)),
                ("high_pass_filter_cutoff", json!(180)),
            ],
            Self::Level1Design => vec![
                ("interscan_interval", json!(1.0)),
                ("bases", json!({ "dgamma": { "derivs": false } })),
                ("model_serial_correlations", json!(true)),
            ],
            Self::Glm => vec![
                ("out_cope", json!("cope.nii.gz")),
                ("out_varcb_name", json!("varcb.nii.gz")),
                ("out_file", json!("betas.nii.gz")),
                ("out_t_name", json!("t_stat.nii.gz")),
                ("out_p_name", json!("p_stat.nii.gz")),
            ],
            Self::Cluster => vec![
                ("threshold", json!(0.95)),
                ("out_max_file", json!("out_max_file")),
                ("out_mean_file", json!("out_mean_file")),
                ("out_size_file", json!("out_size_file")),
            ],
            Self::Merge => vec![("dimension", json!("t"))],
            Self::Flameo => vec![("run_mode", json!("ols"))],
            Self::Melodic => vec![
                ("tr_sec", json!(1.0)),
                ("report", json!(true)),
                ("dim", json!(8)),
            ],
            Self::VoxelResize => vec![("resize_factors", json!([10, 10, 10]))],
            _ => Vec::new(),
        }
    }
}
