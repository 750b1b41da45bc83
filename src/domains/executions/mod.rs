pub mod model;

pub use model::{ChainExecution, Execution, ExecutionSource, ExecutionStatus, StepExecution};
