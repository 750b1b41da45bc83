pub mod model;

pub use model::{OverlapQueueEntry, TaskKind};
