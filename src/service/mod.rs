//! Service declarations
//!
//! This module holds the immutable data model of a project: services,
//! networks and volumes, and the registry they are loaded into.

pub mod registry;
pub mod spec;

pub use registry::{RegistryBuilder, ServiceRegistry};
pub use spec::{
    BuildSpec, Endpoint, ImageSource, Network, ReadinessCheck, RestartPolicy, ServiceSpec, Volume,
    DEFAULT_NETWORK, DEFAULT_READINESS_INTERVAL, DEFAULT_READINESS_TIMEOUT,
};
