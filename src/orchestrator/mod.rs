//! Service orchestration
//!
//! Resolves launch order, probes readiness, sequences launches and
//! supervises restarts for one session.

pub mod event;
pub mod instance;
pub mod probe;
pub mod resolver;
pub mod sequencer;
pub mod snapshot;
pub mod supervisor;

pub use event::{EventKind, SessionEvent};
pub use instance::{InstanceState, ServiceInstance};
pub use probe::{Connector, ProbeReport, ReadinessProber, TcpConnector};
pub use resolver::DependencyResolver;
pub use sequencer::{Session, SessionConfig, DEFAULT_STOP_GRACE};
pub use snapshot::{ServiceSnapshot, SessionSnapshot};
pub use supervisor::{Backoff, ExitCause, RestartDecision, RestartSupervisor};
