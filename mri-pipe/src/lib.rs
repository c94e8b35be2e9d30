//! # MRI Pipe
//!
//! Plans processing of Bruker MRI measurements:
//! - Scan catalog over a measurements root, selection and path resolution
//! - Workflow graphs for preprocessing, first- and second-level statistics
//! - Iteration expansion and plan export for the external execution engine
//! - Custom node commands (scan metadata, voxel resize)

pub mod bids_find;
pub mod bruker;
pub mod catalog;
pub mod error;
pub mod execution;
pub mod pipelines;
pub mod resolver;
pub mod selection;
pub mod voxel_resize;
pub mod workflow;

pub use error::{PipelineError, Result};
