//! Workflow orchestration runtime
//!
//! This crate holds the in-memory workflow registry, the dispatcher that
//! publishes eligible tasks, and the completion handler that advances
//! workflows as workers report back.

mod completion;
mod dispatcher;
mod registry;
mod runtime;

pub use completion::{CompletionHandler, Transition};
pub use dispatcher::Dispatcher;
pub use registry::{AdvanceResult, Advanced, NoOpReason, WorkflowGuard, WorkflowRegistry};
pub use runtime::{env_parse, RuntimeConfig, WorkflowRuntime};
