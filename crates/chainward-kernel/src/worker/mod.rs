//! Worker core: runs one phase of a chain against a context.

pub mod executor;
pub mod stage;

pub use executor::{ExecutionResult, Executor, PolicyFailure, PolicyResult};
pub use stage::{RequestStage, ResponseStage, Stage};
