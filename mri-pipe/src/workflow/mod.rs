//! Workflow graph construction, expansion and export

pub mod adapter;
pub mod expand;
pub mod export;
pub mod graph;
pub mod interfaces;

pub use adapter::{EdgeAdapter, StimulusSchedule, SubjectInfo};
pub use expand::{BranchFailure, Bindings, ExpandedWorkflow, NodeInstance, SourceResolver};
pub use export::{to_dot, write_plan, PlanFiles};
pub use graph::{Node, NodeId, Workflow};
pub use interfaces::Interface;
