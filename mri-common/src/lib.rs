//! # MRI Pipe Common Library
//!
//! Shared code for the pipeline planner crates:
//! - Error type and result alias
//! - TOML configuration loading and measurements root resolution
//! - BIDS-style path templating

pub mod bids;
pub mod config;
pub mod error;

pub use error::{Error, Result};
