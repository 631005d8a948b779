//! Service registry
//!
//! Services, networks and volumes are registered on a [`RegistryBuilder`].
//! [`RegistryBuilder::load`] validates the whole set and produces an
//! immutable [`ServiceRegistry`] that is shared read-only for the rest of the
//! session.

use super::spec::{Endpoint, Network, ServiceSpec, Volume, DEFAULT_NETWORK};
use crate::error::ConfigError;
use crate::orchestrator::resolver::DependencyResolver;
use indexmap::IndexMap;
use std::sync::Arc;

/// Collects declarations during the load phase
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    project: String,
    services: IndexMap<String, ServiceSpec>,
    networks: IndexMap<String, Network>,
    volumes: IndexMap<String, Volume>,
}

impl RegistryBuilder {
    /// Create a builder for a project
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            ..Default::default()
        }
    }

    /// Register a service
    pub fn register(&mut self, spec: ServiceSpec) -> Result<(), ConfigError> {
        if self.services.contains_key(&spec.name) {
            return Err(ConfigError::DuplicateName(spec.name));
        }
        self.services.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Register a network
    pub fn register_network(&mut self, network: Network) -> Result<(), ConfigError> {
        if self.networks.contains_key(&network.name) {
            return Err(ConfigError::DuplicateName(network.name));
        }
        self.networks.insert(network.name.clone(), network);
        Ok(())
    }

    /// Register a volume
    pub fn register_volume(&mut self, volume: Volume) -> Result<(), ConfigError> {
        if self.volumes.contains_key(&volume.name) {
            return Err(ConfigError::DuplicateName(volume.name));
        }
        self.volumes.insert(volume.name.clone(), volume);
        Ok(())
    }

    /// Validate everything registered and freeze it
    pub fn load(mut self) -> Result<ServiceRegistry, ConfigError> {
        for spec in self.services.values_mut() {
            if spec.networks.is_empty() {
                spec.networks.insert(DEFAULT_NETWORK.to_string());
            }
        }

        for spec in self.services.values() {
            for dependency in &spec.depends_on {
                if !self.services.contains_key(dependency) {
                    return Err(ConfigError::DanglingDependency {
                        service: spec.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }

            if let Some(check) = &spec.readiness {
                check
                    .endpoint
                    .parse::<Endpoint>()
                    .map_err(|reason| ConfigError::InvalidEndpoint {
                        endpoint: check.endpoint.clone(),
                        reason,
                    })?;
                if check.interval.is_zero() {
                    return Err(ConfigError::InvalidDuration(format!(
                        "readiness interval of service '{}' must be greater than zero",
                        spec.name
                    )));
                }
            }

            for volume in spec.named_volumes() {
                if !self.volumes.contains_key(volume) {
                    return Err(ConfigError::UnknownVolume {
                        service: spec.name.clone(),
                        volume: volume.to_string(),
                    });
                }
            }
        }

        let order = DependencyResolver::resolve(self.services.values())?;

        for spec in self.services.values() {
            for network in &spec.networks {
                let entry = self.networks.entry(network.clone()).or_insert_with(|| {
                    if network != DEFAULT_NETWORK {
                        tracing::warn!(
                            "Service '{}' references undefined network '{}' (will be created)",
                            spec.name,
                            network
                        );
                    }
                    Network::new(network)
                });
                entry.members.insert(spec.name.clone());
            }
        }

        Ok(ServiceRegistry {
            project: self.project,
            services: self
                .services
                .into_iter()
                .map(|(name, spec)| (name, Arc::new(spec)))
                .collect(),
            networks: self.networks,
            volumes: self.volumes,
            order,
        })
    }
}

/// Immutable catalog of a project's declarations
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    project: String,
    services: IndexMap<String, Arc<ServiceSpec>>,
    networks: IndexMap<String, Network>,
    volumes: IndexMap<String, Volume>,
    order: Vec<String>,
}

impl ServiceRegistry {
    /// Project name
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Look up a service by name
    pub fn resolve(&self, name: &str) -> Result<&Arc<ServiceSpec>, ConfigError> {
        self.services
            .get(name)
            .ok_or_else(|| ConfigError::UnknownService(name.to_string()))
    }

    /// Services in declaration order
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.services.values()
    }

    /// Services in dependency order
    pub fn launch_order(&self) -> &[String] {
        &self.order
    }

    /// Networks, including implicit ones
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// Volumes
    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    /// Look up a network by name
    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    /// Look up a volume by name
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.get(name)
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are declared
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::spec::{ImageSource, ReadinessCheck};
    use std::time::Duration;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec::new(name, ImageSource::Image(format!("{}:latest", name)))
    }

    #[test]
    fn test_register_duplicate() {
        let mut builder = RegistryBuilder::new("dev");
        builder.register(spec("db")).unwrap();
        let err = builder.register(spec("db")).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateName("db".to_string()));
    }

    #[test]
    fn test_resolve_unknown() {
        let mut builder = RegistryBuilder::new("dev");
        builder.register(spec("db")).unwrap();
        let registry = builder.load().unwrap();

        assert_eq!(registry.resolve("db").unwrap().name, "db");
        assert_eq!(
            registry.resolve("cache").unwrap_err(),
            ConfigError::UnknownService("cache".to_string())
        );
    }

    #[test]
    fn test_dangling_dependency() {
        let mut builder = RegistryBuilder::new("dev");
        builder.register(spec("x").depends_on("y")).unwrap();

        let err = builder.load().unwrap_err();
        assert_eq!(
            err,
            ConfigError::DanglingDependency {
                service: "x".to_string(),
                dependency: "y".to_string(),
            }
        );
        assert!(err.to_string().contains("'y'"));
    }

    #[test]
    fn test_network_membership_is_derived() {
        let mut builder = RegistryBuilder::new("dev");
        builder.register_network(Network::new("backend")).unwrap();
        builder.register(spec("db").network("backend")).unwrap();
        builder
            .register(spec("api").network("backend").network("frontend"))
            .unwrap();
        builder.register(spec("tools")).unwrap();
        let registry = builder.load().unwrap();

        let backend = registry.network("backend").unwrap();
        assert_eq!(backend.members.iter().collect::<Vec<_>>(), vec!["api", "db"]);

        let frontend = registry.network("frontend").unwrap();
        assert_eq!(frontend.members.len(), 1);

        let default = registry.network(DEFAULT_NETWORK).unwrap();
        assert!(default.members.contains("tools"));
    }

    #[test]
    fn test_unknown_volume() {
        let mut builder = RegistryBuilder::new("dev");
        let mut db = spec("db");
        db.mounts.push("pgdata:/var/lib/postgresql/data".to_string());
        builder.register(db).unwrap();

        assert!(matches!(
            builder.load(),
            Err(ConfigError::UnknownVolume { .. })
        ));
    }

    #[test]
    fn test_invalid_endpoint() {
        let mut builder = RegistryBuilder::new("dev");
        builder
            .register(spec("db").readiness(ReadinessCheck {
                endpoint: "db-without-port".to_string(),
                timeout: Duration::from_secs(5),
                interval: Duration::from_secs(1),
            }))
            .unwrap();

        assert!(matches!(
            builder.load(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_zero_readiness_interval() {
        let mut builder = RegistryBuilder::new("dev");
        builder
            .register(spec("db").readiness(ReadinessCheck {
                endpoint: "db:5432".to_string(),
                timeout: Duration::from_secs(5),
                interval: Duration::ZERO,
            }))
            .unwrap();

        match builder.load() {
            Err(ConfigError::InvalidDuration(message)) => assert!(message.contains("'db'")),
            _ => panic!("expected a zero readiness interval to be rejected"),
        }
    }

    #[test]
    fn test_launch_order() {
        let mut builder = RegistryBuilder::new("dev");
        builder.register(spec("web").depends_on("api")).unwrap();
        builder.register(spec("api").depends_on("db")).unwrap();
        builder.register(spec("db")).unwrap();
        let registry = builder.load().unwrap();

        assert_eq!(registry.launch_order(), ["db", "api", "web"]);
    }
}
