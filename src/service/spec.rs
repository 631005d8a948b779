//! Service, network and volume specifications

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Name of the network services join when they declare none
pub const DEFAULT_NETWORK: &str = "default";

/// Default readiness timeout
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between readiness attempts
pub const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(1);

/// Restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    Never,
    /// Restart on non-zero exit, start failure or readiness timeout
    OnFailure,
    /// Restart on any unexpected exit
    Always,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "no"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // "on-failure:5" carries a retry limit in compose; the limit is read separately
        let base = s.split(':').next().unwrap_or(s).trim();
        match base {
            "" | "no" | "never" | "none" => Ok(RestartPolicy::Never),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "always" | "unless-stopped" | "any" => Ok(RestartPolicy::Always),
            other => Err(other.to_string()),
        }
    }
}

/// Build instructions for a service image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Context directory
    pub context: PathBuf,
    /// Dockerfile path, relative to the context
    pub dockerfile: Option<PathBuf>,
    /// Build arguments
    pub args: Vec<(String, String)>,
    /// Target stage
    pub target: Option<String>,
    /// Tag given to the built image
    pub tag: String,
}

/// Where a service's image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    /// Pull (or reuse) an image reference
    Image(String),
    /// Build from a context directory
    Build(BuildSpec),
}

impl ImageSource {
    /// The image reference containers are started from
    pub fn reference(&self) -> &str {
        match self {
            ImageSource::Image(image) => image,
            ImageSource::Build(build) => &build.tag,
        }
    }
}

/// TCP readiness check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    /// `host:port` to connect to
    pub endpoint: String,
    /// Give up after this long
    pub timeout: Duration,
    /// Time between attempts
    pub interval: Duration,
}

/// A parsed `host:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.strip_prefix("tcp://").unwrap_or(s);
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| "expected host:port".to_string())?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err("missing host".to_string());
        }

        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port '{}'", port))?;
        if port == 0 {
            return Err("port must be non-zero".to_string());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Declared service. Immutable once loaded into a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name
    pub name: String,
    /// Image or build reference
    pub image: ImageSource,
    /// Environment bindings, in declaration order
    pub environment: Vec<(String, String)>,
    /// Networks this service joins
    pub networks: BTreeSet<String>,
    /// Services that must be ready first, in declaration order
    pub depends_on: Vec<String>,
    /// Restart policy
    pub restart: RestartPolicy,
    /// Upper bound on restart attempts, unbounded when absent
    pub max_restarts: Option<u32>,
    /// Entrypoint vector
    pub entrypoint: Option<Vec<String>>,
    /// Command vector
    pub command: Option<Vec<String>>,
    /// Readiness check gating dependents
    pub readiness: Option<ReadinessCheck>,
    /// Volume mounts, short syntax (`source:target[:mode]`)
    pub mounts: Vec<String>,
    /// Published ports, short syntax
    pub ports: Vec<String>,
    /// Working directory inside the container
    pub working_dir: Option<String>,
    /// Explicit container name
    pub container_name: Option<String>,
}

impl ServiceSpec {
    /// Create a spec with an image and defaults for everything else
    pub fn new(name: &str, image: ImageSource) -> Self {
        Self {
            name: name.to_string(),
            image,
            environment: Vec::new(),
            networks: BTreeSet::new(),
            depends_on: Vec::new(),
            restart: RestartPolicy::Never,
            max_restarts: None,
            entrypoint: None,
            command: None,
            readiness: None,
            mounts: Vec::new(),
            ports: Vec::new(),
            working_dir: None,
            container_name: None,
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.push(service.to_string());
        self
    }

    /// Set the restart policy
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Add an environment binding
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.push((key.to_string(), value.to_string()));
        self
    }

    /// Join a network
    pub fn network(mut self, network: &str) -> Self {
        self.networks.insert(network.to_string());
        self
    }

    /// Set the readiness check
    pub fn readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness = Some(check);
        self
    }

    /// Container name for this service within a project
    pub fn container_name(&self, project: &str) -> String {
        self.container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", project, self.name))
    }

    /// Named volumes referenced by the mounts (sources that are not paths)
    pub fn named_volumes(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().filter_map(|mount| {
            let source = mount.split(':').next()?;
            let is_path = source.starts_with('/')
                || source.starts_with('.')
                || source.starts_with('~');
            if mount.contains(':') && !is_path && !source.is_empty() {
                Some(source)
            } else {
                None
            }
        })
    }
}

/// Declared network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Unique network name
    pub name: String,
    /// Driver (bridge when absent)
    pub driver: Option<String>,
    /// Managed outside this project; never created or removed
    pub external: bool,
    /// Member services, derived from the service declarations
    pub members: BTreeSet<String>,
}

impl Network {
    /// Create a new network with no members
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            driver: None,
            external: false,
            members: BTreeSet::new(),
        }
    }

    /// Name of the network as created in the runtime
    pub fn runtime_name(&self, project: &str) -> String {
        if self.external {
            self.name.clone()
        } else {
            format!("{}_{}", project, self.name)
        }
    }
}

/// Declared volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume name
    pub name: String,
    /// Host directory backing the volume, for bind-backed volumes
    pub mount_path: Option<PathBuf>,
    /// Driver (local when absent)
    pub driver: Option<String>,
    /// Managed outside this project; never created or removed
    pub external: bool,
}

impl Volume {
    /// Create a new volume managed by the runtime
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mount_path: None,
            driver: None,
            external: false,
        }
    }

    /// Name of the volume as created in the runtime
    pub fn runtime_name(&self, project: &str) -> String {
        if self.external {
            self.name.clone()
        } else {
            format!("{}_{}", project, self.name)
        }
    }
}
