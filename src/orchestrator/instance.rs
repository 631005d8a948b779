//! Service instances and their state machine

use super::event::{EventKind, EventSender, SessionEvent};
use crate::container::ContainerHandle;
use crate::error::{BerthError, InstanceFailure, Result};
use crate::service::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Waiting for dependencies
    Pending,
    /// Image is being built or pulled
    Building,
    /// Container is being started
    Starting,
    /// Container runs; readiness is being probed
    WaitingReady,
    /// Ready for dependents
    Ready,
    /// Gave up; terminal
    Failed,
    /// Waiting out the restart backoff
    Restarting,
    /// Stopped on request or exited cleanly; terminal
    Stopped,
}

impl InstanceState {
    /// Failed and Stopped never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::Stopped)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (*self, next),
            (Pending, Building)
                | (Building, Starting)
                | (Starting, WaitingReady)
                | (WaitingReady, Ready)
                | (Starting | WaitingReady | Ready, Restarting)
                | (Restarting, Starting)
                | (_, Failed)
                | (_, Stopped)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Building => write!(f, "building"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::WaitingReady => write!(f, "waiting-ready"),
            InstanceState::Ready => write!(f, "ready"),
            InstanceState::Failed => write!(f, "failed"),
            InstanceState::Restarting => write!(f, "restarting"),
            InstanceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Runtime view of one declared service
///
/// The state is written only by the instance's own task; everyone else reads
/// it or subscribes to changes.
pub struct ServiceInstance {
    spec: Arc<ServiceSpec>,
    state: watch::Sender<InstanceState>,
    ever_ready: AtomicBool,
    restarts: AtomicU32,
    container: Mutex<Option<ContainerHandle>>,
    failure: Mutex<Option<InstanceFailure>>,
    stop: CancellationToken,
    events: EventSender,
}

impl ServiceInstance {
    pub(crate) fn new(spec: Arc<ServiceSpec>, stop: CancellationToken, events: EventSender) -> Self {
        let (state, _) = watch::channel(InstanceState::Pending);
        Self {
            spec,
            state,
            ever_ready: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            container: Mutex::new(None),
            failure: Mutex::new(None),
            stop,
            events,
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Service specification
    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    /// Current state
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    /// Whether the instance reached Ready at least once
    pub fn has_been_ready(&self) -> bool {
        self.ever_ready.load(Ordering::SeqCst)
    }

    /// Restarts performed so far
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Current container, if one is running
    pub fn container(&self) -> Option<ContainerHandle> {
        self.container.lock().ok().and_then(|c| c.clone())
    }

    /// Most recent error message
    pub fn last_error(&self) -> Option<String> {
        self.failure().map(|f| f.message)
    }

    /// Most recent error, with its kind
    pub fn failure(&self) -> Option<InstanceFailure> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// Token that stops this instance when cancelled
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Ask the instance's task to stop its container and finish
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Wait until the instance has been Ready once or reached a terminal state
    pub async fn wait_settled(&self) -> InstanceState {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|s| s.is_terminal() || self.has_been_ready())
            .await
            .map(|s| *s);
        settled.unwrap_or_else(|_| self.state())
    }

    /// Wait until the instance is Ready or reached a terminal state
    pub async fn wait_ready(&self) -> InstanceState {
        let mut rx = self.subscribe();
        let state = rx
            .wait_for(|s| *s == InstanceState::Ready || s.is_terminal())
            .await
            .map(|s| *s);
        state.unwrap_or_else(|_| self.state())
    }

    /// Wait until the instance reached a terminal state
    pub async fn wait_terminal(&self) -> InstanceState {
        let mut rx = self.subscribe();
        let terminal = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        terminal.unwrap_or_else(|_| self.state())
    }

    pub(crate) fn transition(&self, next: InstanceState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(BerthError::InvalidTransition {
                service: self.name().to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        if next == InstanceState::Ready {
            self.ever_ready.store(true, Ordering::SeqCst);
        }
        self.state.send_replace(next);

        tracing::debug!("{}: {} -> {}", self.name(), current, next);
        self.emit(EventKind::StateChanged {
            from: current,
            to: next,
        });
        Ok(())
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        // No subscribers is fine
        let _ = self.events.send(SessionEvent::new(self.name(), kind));
    }

    pub(crate) fn set_container(&self, handle: ContainerHandle) {
        if let Ok(mut container) = self.container.lock() {
            *container = Some(handle);
        }
    }

    pub(crate) fn take_container(&self) -> Option<ContainerHandle> {
        self.container.lock().ok().and_then(|mut c| c.take())
    }

    pub(crate) fn record_error(&self, error: &BerthError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(InstanceFailure::new(self.name(), error));
        }
    }

    pub(crate) fn record_restart(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::SeqCst) + 1
    }
}
