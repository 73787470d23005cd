//! `engine` crate: graph documents, validation, and the execution engine.
//!
//! [`WorkflowExecutor`] is the entry point; [`GraphEngine`] is the control
//! loop it builds for each run.

mod container;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph_engine;
pub mod inputs;
pub mod models;
pub mod persistence;
pub mod pool;
pub mod reachability;
pub mod responder;
pub mod route;
pub mod snapshot;

pub use dag::{validate_dag, Graph};
pub use error::EngineError;
pub use events::{EngineLayer, EventBus, EventSubscriber, GraphEvent};
pub use executor::{ExecutionResult, ExecutorConfig, PreparedRun, RunRequest, WorkflowExecutor};
pub use graph_engine::{EngineHandle, GraphEngine, RunOutcome, RunStatus};
pub use models::{EdgeConfig, GraphConfig, NodeConfig, Workflow};
pub use persistence::{PersistenceLayer, TraceTask};
pub use pool::{SystemVariables, VariablePool};
pub use responder::{AnswerStreamResponder, StreamOutput};
pub use snapshot::PauseSnapshot;

#[cfg(test)]
mod executor_tests;
