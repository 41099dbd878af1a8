//! conveyor - declarative pipeline compiler and DAG scheduler for
//! containerized batch workloads

pub mod channel;
pub mod cli;
pub mod compile;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use channel::{ChannelError, OutputChannel};
pub use compile::{compile, CompileError, CompiledWorkflow};
pub use core::{
    BuildError, GraphBuilder, Guard, GuardOp, OutputValue, PipelineGraph, PipelineManifest,
    StepBuilder, StepDescriptor,
};
pub use execution::{
    LocalProcessSubstrate, NodePhase, RunEngine, RunEvent, RunInstance, RunStatus, Runner,
    SkipReason, Substrate,
};
