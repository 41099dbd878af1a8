//! Compilation of validated graphs into executable workflow documents

pub mod compiler;
pub mod workflow;

pub use compiler::{compile, node_id, CompileError};
pub use workflow::{
    CompiledInput, CompiledNode, CompiledParam, CompiledWorkflow, VolumeSpec, WORKSPACE_MOUNT,
    WORKSPACE_VOLUME,
};
