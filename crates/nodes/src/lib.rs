//! `nodes` crate: the `ExecutableNode` trait and built-in node implementations.
//!
//! Also home of the value model ([`variables`]) every node reads and writes,
//! and of the collaborator traits nodes call out to ([`services`]).
//! The engine crate dispatches execution through [`BuiltinNode`].

pub mod builtin;
pub mod condition;
pub mod config;
pub mod error;
pub mod mock;
pub mod node;
pub mod services;
pub mod template;
pub mod traits;
pub mod variables;

pub use config::{ErrorStrategy, NodeData, NodeKind, RetryConfig};
pub use error::NodeError;
pub use node::BuiltinNode;
pub use services::NodeServices;
pub use traits::{ExecutableNode, ExecutionContext, NodeOutcome, NodeRunResult, StreamChunk, StreamSink};
pub use variables::{NodeInputs, Segment, Selector};
