pub mod model;

pub use model::{CronTask, HttpMethod, OverlapPolicy, Protocol, ProtocolParams};
