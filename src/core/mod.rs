//! Core domain model: steps, values, guards, graphs, manifests

pub mod graph;
pub mod guard;
pub mod manifest;
pub mod step;
pub mod value;

pub use graph::{BuildError, GraphBuilder, PipelineGraph, PipelineParameter};
pub use guard::{Guard, GuardOp};
pub use manifest::PipelineManifest;
pub use step::{
    ParamBinding, PlacementConstraints, ResourceRequest, RetryPolicy, StepBuilder, StepDescriptor,
};
pub use value::OutputValue;
