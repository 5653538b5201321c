use thiserror::Error;

/// Errors surfaced to the host through [`MonitorHandle`] calls.
///
/// Internal engine faults never escalate this far: feed failures, stale
/// timers, and corrupt persisted state are logged and absorbed (the engine
/// degrades to IDLE or "no monitoring"). The only thing a handle call can
/// report is that the monitor task itself is gone.
///
/// [`MonitorHandle`]: crate::monitor::MonitorHandle
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor task has shut down")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, MonitorError>;
