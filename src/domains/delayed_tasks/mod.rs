pub mod model;

pub use model::{DelayedTask, DelayedTaskStatus};
