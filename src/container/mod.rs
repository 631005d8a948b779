//! Container runtime capability
//!
//! The orchestrator never runs containers itself. It drives an external
//! runtime through [`ContainerRuntime`], which the Docker CLI implements and
//! tests replace with a scripted fake.

pub mod config;
pub mod docker;

pub use config::{ContainerHandle, ContainerStatus, ExitStatus, LaunchRequest};
pub use docker::DockerCli;

use crate::error::Result;
use crate::service::{ImageSource, Network, Volume};
use async_trait::async_trait;
use std::time::Duration;

/// Operations the orchestrator needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build or pull the image for `service`, returning the reference to run
    async fn prepare_image(&self, service: &str, source: &ImageSource) -> Result<String>;

    /// Create a network unless it already exists
    async fn create_network(&self, project: &str, network: &Network) -> Result<()>;

    /// Remove a network
    async fn remove_network(&self, project: &str, network: &Network) -> Result<()>;

    /// Create a volume unless it already exists
    async fn create_volume(&self, project: &str, volume: &Volume) -> Result<()>;

    /// Remove a volume
    async fn remove_volume(&self, project: &str, volume: &Volume) -> Result<()>;

    /// Start a container, replacing any leftover container with the same name
    async fn start(&self, request: &LaunchRequest) -> Result<ContainerHandle>;

    /// Stop and remove a container
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    /// Wait for a container to exit
    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus>;

    /// Current status of a container
    async fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus>;
}
