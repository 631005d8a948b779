//! Container launch configuration

use crate::service::{ServiceRegistry, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the project name
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label carrying the service name
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Container status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container is being restarted by the runtime
    Restarting,
    /// Container has exited
    Exited,
    /// Container is being removed
    Removing,
    /// Container is in an error state
    Dead,
    /// Runtime does not know the container
    Missing,
}

impl ContainerStatus {
    /// Parse the runtime's status string
    pub fn from_runtime(s: &str) -> Self {
        match s.trim() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Missing,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Dead => write!(f, "dead"),
            ContainerStatus::Missing => write!(f, "missing"),
        }
    }
}

/// Reference to a started container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Runtime container ID
    pub id: String,
    /// Container name
    pub name: String,
}

impl ContainerHandle {
    /// Refer to a container by name only
    pub fn named(name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
        }
    }
}

/// How a container exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code of the main process
    pub code: i64,
}

impl ExitStatus {
    /// Whether the container exited cleanly
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Everything the runtime needs to start one service container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Service name
    pub service: String,
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Entry point
    pub entrypoint: Option<Vec<String>>,
    /// Command to run
    pub command: Option<Vec<String>>,
    /// Environment variables, passed through verbatim
    pub env: Vec<(String, String)>,
    /// Runtime network names; the first is the primary network
    pub networks: Vec<String>,
    /// Network aliases (the service name)
    pub aliases: Vec<String>,
    /// Volume mounts, with named volumes mapped to runtime names
    pub mounts: Vec<String>,
    /// Published ports
    pub ports: Vec<String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Build the launch request for `spec` within `registry`'s project
    pub fn for_service(registry: &ServiceRegistry, spec: &ServiceSpec, image: &str) -> Self {
        let project = registry.project();

        let networks = spec
            .networks
            .iter()
            .map(|name| match registry.network(name) {
                Some(network) => network.runtime_name(project),
                None => format!("{}_{}", project, name),
            })
            .collect();

        let mounts = spec
            .mounts
            .iter()
            .map(|mount| match mount.split_once(':') {
                Some((source, rest)) => match registry.volume(source) {
                    Some(volume) => format!("{}:{}", volume.runtime_name(project), rest),
                    None => mount.clone(),
                },
                None => mount.clone(),
            })
            .collect();

        let mut labels = BTreeMap::new();
        labels.insert(PROJECT_LABEL.to_string(), project.to_string());
        labels.insert(SERVICE_LABEL.to_string(), spec.name.clone());

        Self {
            service: spec.name.clone(),
            name: spec.container_name(project),
            image: image.to_string(),
            entrypoint: spec.entrypoint.clone(),
            command: spec.command.clone(),
            env: spec.environment.clone(),
            networks,
            aliases: vec![spec.name.clone()],
            mounts,
            ports: spec.ports.clone(),
            working_dir: spec.working_dir.clone(),
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ImageSource, Network, RegistryBuilder, Volume};

    #[test]
    fn test_launch_request_maps_project_resources() {
        let mut builder = RegistryBuilder::new("dev");
        builder.register_network(Network::new("backend")).unwrap();
        let mut shared = Network::new("shared");
        shared.external = true;
        builder.register_network(shared).unwrap();
        builder.register_volume(Volume::new("pgdata")).unwrap();

        let mut db = ServiceSpec::new("db", ImageSource::Image("postgres:16".to_string()))
            .network("backend")
            .network("shared")
            .env("POSTGRES_PASSWORD", "secret")
            .env("PGDATA", "/var/lib/postgresql/data/pg");
        db.mounts = vec![
            "pgdata:/var/lib/postgresql/data".to_string(),
            "./init:/docker-entrypoint-initdb.d:ro".to_string(),
        ];
        builder.register(db).unwrap();
        let registry = builder.load().unwrap();

        let spec = registry.resolve("db").unwrap();
        let request = LaunchRequest::for_service(&registry, spec, "postgres:16");

        assert_eq!(request.name, "dev-db-1");
        assert_eq!(request.networks, vec!["dev_backend", "shared"]);
        assert_eq!(
            request.mounts,
            vec![
                "dev_pgdata:/var/lib/postgresql/data",
                "./init:/docker-entrypoint-initdb.d:ro"
            ]
        );
        assert_eq!(
            request.env,
            vec![
                ("POSTGRES_PASSWORD".to_string(), "secret".to_string()),
                ("PGDATA".to_string(), "/var/lib/postgresql/data/pg".to_string()),
            ]
        );
        assert_eq!(request.labels.get(SERVICE_LABEL).unwrap(), "db");
    }

    #[test]
    fn test_status_from_runtime() {
        assert_eq!(ContainerStatus::from_runtime("running\n"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_runtime("exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::from_runtime(""), ContainerStatus::Missing);
    }
}
