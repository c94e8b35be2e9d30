//! Error types for mri-pipe
//!
//! Classification and filtering problems are recovered where they happen
//! (record dropped, warning logged). Resolution and aggregation failures
//! carry the offending tuple or group key so that a failed branch can be
//! diagnosed from the message alone.

use thiserror::Error;

/// Workflow graph construction errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A node with this name already exists in the workflow
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// Node handle does not belong to this workflow
    #[error("Unknown node id: {0}")]
    UnknownNode(usize),

    /// Output port not declared by the producing interface
    #[error("Node {node} has no output {port}")]
    UnknownOutput { node: String, port: String },

    /// Input port not declared by the consuming interface
    #[error("Node {node} has no input {port}")]
    UnknownInput { node: String, port: String },

    /// Input port already has a producer
    #[error("Input {node}.{port} is already connected")]
    InputAlreadyConnected { node: String, port: String },

    /// Producer declared after consumer (would allow cycles)
    #[error("Edge {from} -> {to} does not follow declaration order")]
    OutOfOrderEdge { from: String, to: String },

    /// Graph contains a cycle
    #[error("Workflow {0} contains a cycle")]
    Cycle(String),

    /// Required input neither connected nor set as a parameter
    #[error("Required input {node}.{port} is not connected")]
    UnconnectedInput { node: String, port: String },

    /// Iterable on a field the node does not accept, or declared twice
    #[error("Node {node} cannot iterate over {field}")]
    InvalidIterable { node: String, field: String },
}

/// Main error type for mri-pipe
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Measurement directory is missing required metadata
    #[error("Catalog incomplete for measurement {measurement}: {reason}")]
    CatalogIncomplete { measurement: String, reason: String },

    /// No scan matches the selection tuple
    #[error("Scan not found for condition={condition}, subject={subject}, scan_type={scan_type}")]
    ScanNotFound {
        condition: String,
        subject: String,
        scan_type: String,
    },

    /// Several scans match the selection tuple (strict tie-break only)
    #[error("Ambiguous scan for condition={condition}, subject={subject}, scan_type={scan_type}: {matches} matches")]
    AmbiguousScan {
        condition: String,
        subject: String,
        scan_type: String,
        matches: usize,
    },

    /// Aggregation group resolved to zero input files
    #[error("No input files to merge for group {group}")]
    EmptyMergeInput { group: String },

    /// Unrecognised option value supplied by the caller
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed parameter file
    #[error("Parameter file {path}: {reason}")]
    Parameters { path: String, reason: String },

    /// Workflow graph construction error
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// mri-common error
    #[error("Common error: {0}")]
    Common(#[from] mri_common::Error),

    /// Classification table errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Plan serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// NIfTI read/write errors
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),
}

impl PipelineError {
    /// Build a `ScanNotFound` from a selection tuple
    pub fn scan_not_found(condition: &str, subject: &str, scan_type: &str) -> Self {
        Self::ScanNotFound {
            condition: condition.to_string(),
            subject: subject.to_string(),
            scan_type: scan_type.to_string(),
        }
    }
}

/// Convenience Result type using mri-pipe PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;
