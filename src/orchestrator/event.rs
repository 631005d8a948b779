//! Session events

use super::instance::InstanceState;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the session event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast sender for session events
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Something observable happened to an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The instance changed state
    StateChanged {
        from: InstanceState,
        to: InstanceState,
    },
    /// A restart was scheduled after `delay`
    RestartScheduled { attempt: u32, delay: Duration },
    /// The instance failed
    Failed { kind: &'static str, message: String },
}

/// An event on one instance
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// When it happened
    pub at: DateTime<Utc>,
    /// Service name
    pub service: String,
    /// What happened
    pub kind: EventKind,
}

impl SessionEvent {
    pub(crate) fn new(service: &str, kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            service: service.to_string(),
            kind,
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EventKind::StateChanged { from, to } => {
                write!(f, "{}: {} -> {}", self.service, from, to)
            }
            EventKind::RestartScheduled { attempt, delay } => {
                write!(f, "{}: restart #{} in {:?}", self.service, attempt, delay)
            }
            EventKind::Failed { kind, message } => {
                write!(f, "{}: {}: {}", self.service, kind, message)
            }
        }
    }
}
