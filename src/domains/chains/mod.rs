pub mod model;

pub use model::{ChainStatus, ChainStep, StepCondition, TaskChain, TriggerType};
