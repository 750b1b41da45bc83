pub mod model;

pub use model::{
    ConcurrencyPolicy, EndPingOutcome, MonitorEventKind, ProcessMonitor, ProcessMonitorEvent,
    ProcessMonitorStatus, ScheduleType, StartPingOutcome, MAX_MONITOR_EVENTS,
};
