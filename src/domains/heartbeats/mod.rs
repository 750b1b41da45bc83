pub mod model;

pub use model::{Heartbeat, HeartbeatPing, HeartbeatStatus, PingIngestOutcome, MAX_HEARTBEAT_HISTORY};
