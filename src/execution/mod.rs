//! Workflow execution: state machine, engine, runner, substrates

pub mod engine;
pub mod local;
pub mod runner;
pub mod state;
pub mod substrate;

pub use engine::{EngineError, EventHandler, RunEngine, RunEvent};
pub use local::LocalProcessSubstrate;
pub use runner::Runner;
pub use state::{NodeExecution, NodePhase, RunInstance, RunStatus, SkipReason};
pub use substrate::{NodeSpec, SubmitHandle, Substrate, SubstrateError, SubstrateStatus};
