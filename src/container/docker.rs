//! Docker CLI runtime
//!
//! Drives the `docker` binary. Every operation is one or two CLI calls; the
//! argument vectors are built by plain functions so they can be checked
//! without a daemon.

use super::config::{ContainerHandle, ContainerStatus, ExitStatus, LaunchRequest, PROJECT_LABEL};
use super::ContainerRuntime;
use crate::error::{BerthError, Result};
use crate::service::{BuildSpec, ImageSource, Network, Volume};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Default Docker binary
pub const DEFAULT_DOCKER_BIN: &str = "docker";

/// Container runtime backed by the Docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DEFAULT_DOCKER_BIN)
    }
}

impl DockerCli {
    /// Create a runtime using `binary`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run docker and return trimmed stdout
    async fn docker(&self, args: &[String]) -> Result<String> {
        tracing::debug!("{} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BerthError::Runtime(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(BerthError::Runtime(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Run docker, reporting only whether it succeeded
    async fn docker_ok(&self, args: &[String]) -> bool {
        self.docker(args).await.is_ok()
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Arguments for `docker build`
pub fn build_args(build: &BuildSpec) -> Vec<String> {
    let mut args = strings(&["build", "-t"]);
    args.push(build.tag.clone());

    if let Some(dockerfile) = &build.dockerfile {
        args.push("-f".to_string());
        args.push(build.context.join(dockerfile).display().to_string());
    }
    for (key, value) in &build.args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(target) = &build.target {
        args.push("--target".to_string());
        args.push(target.clone());
    }

    args.push(build.context.display().to_string());
    args
}

/// Arguments for `docker run`
///
/// Only the primary network is attached here; the rest are connected after
/// the container exists.
pub fn run_args(request: &LaunchRequest) -> Vec<String> {
    let mut args = strings(&["run", "-d", "--name"]);
    args.push(request.name.clone());

    for (key, value) in &request.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(network) = request.networks.first() {
        args.push("--network".to_string());
        args.push(network.clone());
        for alias in &request.aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
    }

    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for mount in &request.mounts {
        args.push("-v".to_string());
        args.push(mount.clone());
    }
    for port in &request.ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    if let Some(dir) = &request.working_dir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }

    // docker takes a single entrypoint binary; its arguments lead the command
    let mut trailing = Vec::new();
    if let Some((first, rest)) = request.entrypoint.as_ref().and_then(|e| e.split_first()) {
        args.push("--entrypoint".to_string());
        args.push(first.clone());
        trailing.extend(rest.iter().cloned());
    }

    args.push(request.image.clone());
    trailing.extend(request.command.iter().flatten().cloned());
    args.extend(trailing);
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn prepare_image(&self, service: &str, source: &ImageSource) -> Result<String> {
        match source {
            ImageSource::Image(image) => {
                let inspect = strings(&["image", "inspect", image.as_str()]);
                if !self.docker_ok(&inspect).await {
                    tracing::info!("Pulling image {} for service {}", image, service);
                    self.docker(&strings(&["pull", image.as_str()]))
                        .await
                        .map_err(|e| {
                            BerthError::launch(service, format!("image {} unavailable: {}", image, e))
                        })?;
                }
            }
            ImageSource::Build(build) => {
                tracing::info!("Building image {} for service {}", build.tag, service);
                self.docker(&build_args(build))
                    .await
                    .map_err(|e| BerthError::launch(service, format!("build failed: {}", e)))?;
            }
        }
        Ok(source.reference().to_string())
    }

    async fn create_network(&self, project: &str, network: &Network) -> Result<()> {
        let name = network.runtime_name(project);
        if self.docker_ok(&strings(&["network", "inspect", name.as_str()])).await {
            return Ok(());
        }
        if network.external {
            return Err(BerthError::Runtime(format!(
                "external network {} does not exist",
                name
            )));
        }

        let mut args = strings(&["network", "create", "--label"]);
        args.push(format!("{}={}", PROJECT_LABEL, project));
        if let Some(driver) = &network.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        args.push(name);
        self.docker(&args).await.map(|_| ())
    }

    async fn remove_network(&self, project: &str, network: &Network) -> Result<()> {
        if network.external {
            return Ok(());
        }
        self.docker(&strings(&["network", "rm", network.runtime_name(project).as_str()]))
            .await
            .map(|_| ())
    }

    async fn create_volume(&self, project: &str, volume: &Volume) -> Result<()> {
        let name = volume.runtime_name(project);
        if self.docker_ok(&strings(&["volume", "inspect", name.as_str()])).await {
            return Ok(());
        }
        if volume.external {
            return Err(BerthError::Runtime(format!(
                "external volume {} does not exist",
                name
            )));
        }

        let mut args = strings(&["volume", "create", "--label"]);
        args.push(format!("{}={}", PROJECT_LABEL, project));
        if let Some(driver) = &volume.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        if let Some(path) = &volume.mount_path {
            std::fs::create_dir_all(path)?;
            args.extend(strings(&["--opt", "type=none", "--opt", "o=bind", "--opt"]));
            args.push(format!("device={}", path.display()));
        }
        args.push(name);
        self.docker(&args).await.map(|_| ())
    }

    async fn remove_volume(&self, project: &str, volume: &Volume) -> Result<()> {
        if volume.external {
            return Ok(());
        }
        self.docker(&strings(&["volume", "rm", volume.runtime_name(project).as_str()]))
            .await
            .map(|_| ())
    }

    async fn start(&self, request: &LaunchRequest) -> Result<ContainerHandle> {
        // Leftovers from an earlier session would block the name
        let _ = self.docker(&strings(&["rm", "-f", request.name.as_str()])).await;

        let id = self
            .docker(&run_args(request))
            .await
            .map_err(|e| BerthError::launch(&request.service, e.to_string()))?;

        for network in request.networks.iter().skip(1) {
            let mut args = strings(&["network", "connect"]);
            for alias in &request.aliases {
                args.push("--alias".to_string());
                args.push(alias.clone());
            }
            args.push(network.clone());
            args.push(id.clone());
            if let Err(e) = self.docker(&args).await {
                // Nothing tracks the container yet, so it must not outlive the failure
                if let Err(rm) = self.docker(&strings(&["rm", "-f", id.as_str()])).await {
                    tracing::warn!("Failed to remove container {}: {}", id, rm);
                }
                return Err(BerthError::launch(&request.service, e.to_string()));
            }
        }

        Ok(ContainerHandle {
            id,
            name: request.name.clone(),
        })
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        let seconds = grace.as_secs().to_string();
        if let Err(e) = self
            .docker(&strings(&["stop", "-t", seconds.as_str(), handle.id.as_str()]))
            .await
        {
            tracing::debug!("docker stop {}: {}", handle.name, e);
        }
        self.docker(&strings(&["rm", "-f", handle.id.as_str()]))
            .await
            .map(|_| ())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus> {
        let output = self.docker(&strings(&["wait", handle.id.as_str()])).await?;
        let code = output.lines().last().unwrap_or_default().trim().parse().map_err(|_| {
            BerthError::Runtime(format!("unexpected docker wait output: {}", output))
        })?;
        Ok(ExitStatus { code })
    }

    async fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        let args = strings(&["inspect", "-f", "{{.State.Status}}", handle.id.as_str()]);
        match self.docker(&args).await {
            Ok(status) => Ok(ContainerStatus::from_runtime(&status)),
            Err(_) => Ok(ContainerStatus::Missing),
        }
    }
}
