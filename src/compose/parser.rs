//! Compose file parser
//!
//! Reads one or more compose files, merges them in order, interpolates
//! variables and loads the result into a [`ServiceRegistry`].

use super::config::{
    BuildConfig, CommandConfig, ComposeConfig, DurationConfig, EnvironmentConfig, PortConfig,
    ScalarValue, ServiceConfig, VolumeMount,
};
use crate::error::ConfigError;
use crate::service::{
    BuildSpec, ImageSource, Network, ReadinessCheck, RegistryBuilder, RestartPolicy,
    ServiceRegistry, ServiceSpec, Volume, DEFAULT_READINESS_INTERVAL, DEFAULT_READINESS_TIMEOUT,
};
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A compose project loaded from disk
#[derive(Debug, Clone)]
pub struct LoadedProject {
    /// Validated registry
    pub registry: ServiceRegistry,
    /// Files the project was read from, in merge order
    pub files: Vec<PathBuf>,
    /// Digest of the file contents
    pub digest: String,
}

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> ConfigResult<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Merge two compose configurations
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => merge_service(existing, service),
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        for (name, network) in overlay.networks {
            result.networks.insert(name, network);
        }
        for (name, volume) in overlay.volumes {
            result.volumes.insert(name, volume);
        }

        result
    }

    /// Interpolate `${VAR}`, `$VAR`, `${VAR:-default}` and `${VAR-default}`
    pub fn interpolate(
        config: &mut ComposeConfig,
        env: &HashMap<String, String>,
    ) -> ConfigResult<()> {
        let pattern = interpolation_pattern()?;
        let expand = |s: &mut String| *s = interpolate_string(&pattern, s, env);

        for service in config.services.values_mut() {
            if let Some(image) = service.image.as_mut() {
                expand(image);
            }

            match service.environment.as_mut() {
                Some(EnvironmentConfig::Array(items)) => items.iter_mut().for_each(expand),
                Some(EnvironmentConfig::Map(map)) => {
                    for value in map.values_mut().flatten() {
                        if let ScalarValue::String(s) = value {
                            expand(s);
                        }
                    }
                }
                None => {}
            }

            if let Some(ports) = service.ports.as_mut() {
                for port in ports {
                    if let PortConfig::Short(ScalarValue::String(s)) = port {
                        expand(s);
                    }
                }
            }

            if let Some(volumes) = service.volumes.as_mut() {
                for volume in volumes {
                    match volume {
                        VolumeMount::Short(s) => expand(s),
                        VolumeMount::Long(long) => {
                            if let Some(source) = long.source.as_mut() {
                                expand(source);
                            }
                        }
                    }
                }
            }

            if let Some(readiness) = service.readiness.as_mut() {
                expand(&mut readiness.endpoint);
            }
        }

        Ok(())
    }

    /// Project name: the override, else the file's `name`, else the directory
    pub fn project_name(config: &ComposeConfig, dir: &Path, name: Option<&str>) -> String {
        let raw = name
            .map(str::to_string)
            .or_else(|| config.name.clone())
            .or_else(|| {
                dir.file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_default();

        let normalized: String = raw
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .skip_while(|c| !c.is_ascii_alphanumeric())
            .collect();

        if normalized.is_empty() {
            "berth".to_string()
        } else {
            normalized
        }
    }

    /// Load a parsed configuration into a validated registry
    pub fn load(
        config: &ComposeConfig,
        project: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> ConfigResult<ServiceRegistry> {
        let mut builder = RegistryBuilder::new(project);

        for (name, network) in &config.networks {
            let mut declared = Network::new(name);
            if let Some(network) = network {
                declared.driver = network.driver.clone();
                declared.external = network.external.as_ref().is_some_and(|e| e.is_external());
            }
            builder.register_network(declared)?;
        }

        for (name, volume) in &config.volumes {
            let mut declared = Volume::new(name);
            if let Some(volume) = volume {
                declared.driver = volume.driver.clone();
                declared.external = volume.external.as_ref().is_some_and(|e| e.is_external());
                declared.mount_path = volume.driver_opts.as_ref().and_then(|opts| {
                    let bind = opts.get("o").is_some_and(|o| o.split(',').any(|o| o == "bind"));
                    opts.get("device")
                        .filter(|_| bind)
                        .map(|device| resolve_host_path(device, working_dir))
                });
            }
            builder.register_volume(declared)?;
        }

        for (name, service) in &config.services {
            builder.register(service_spec(name, service, project, working_dir, env)?)?;
        }

        builder.load()
    }

    /// Find, parse, merge, interpolate and load a project
    ///
    /// `files` are used in order when given; otherwise the default file in
    /// `dir` is used.
    pub fn load_project(
        files: &[PathBuf],
        dir: &Path,
        project: Option<&str>,
        env: &HashMap<String, String>,
    ) -> ConfigResult<LoadedProject> {
        let files = if files.is_empty() {
            vec![Self::find_compose_file(dir)
                .ok_or_else(|| ConfigError::FileNotFound(dir.to_path_buf()))?]
        } else {
            files.to_vec()
        };

        let mut contents = Vec::with_capacity(files.len());
        let mut config = ComposeConfig::default();
        for path in &files {
            let content = read_file(path)?;
            config = Self::merge_configs(config, Self::parse_str(&content)?);
            contents.push(content);
        }

        Self::interpolate(&mut config, env)?;

        // Relative paths resolve against the first file's directory
        let working_dir = files
            .first()
            .and_then(|f| f.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(dir)
            .to_path_buf();
        let project = Self::project_name(&config, &working_dir, project);

        tracing::debug!(
            "Loading project {} from {} file(s)",
            project,
            files.len()
        );
        let registry = Self::load(&config, &project, &working_dir, env)?;

        Ok(LoadedProject {
            registry,
            files,
            digest: digest(&contents),
        })
    }
}

fn read_file(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigError::FileNotFound(path.to_path_buf()),
        _ => ConfigError::Parse(format!("Failed to read {}: {}", path.display(), e)),
    })
}

/// Digest of the raw compose file contents
pub fn digest(contents: &[String]) -> String {
    let mut hasher = Sha256::new();
    for content in contents {
        hasher.update(content.as_bytes());
    }
    format!("sha256:{:x}", hasher.finalize())
}

fn merge_service(existing: &mut ServiceConfig, overlay: ServiceConfig) {
    macro_rules! take_overlay {
        ($($field:ident),*) => {
            $(if overlay.$field.is_some() {
                existing.$field = overlay.$field;
            })*
        };
    }

    // Environment maps merge key by key; any other combination replaces
    match (existing.environment.as_mut(), overlay.environment) {
        (Some(EnvironmentConfig::Map(base)), Some(EnvironmentConfig::Map(extra))) => {
            base.extend(extra);
        }
        (_, Some(environment)) => existing.environment = Some(environment),
        (_, None) => {}
    }

    take_overlay!(
        image,
        build,
        command,
        entrypoint,
        container_name,
        ports,
        volumes,
        networks,
        depends_on,
        deploy,
        restart,
        working_dir,
        readiness
    );
}

fn interpolation_pattern() -> ConfigResult<Regex> {
    Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))")
        .map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Interpolate environment variables in a string
fn interpolate_string(pattern: &Regex, s: &str, env: &HashMap<String, String>) -> String {
    pattern
        .replace_all(s, |caps: &Captures| {
            if caps.get(1).is_some() {
                return "$".to_string();
            }

            let name = caps
                .get(2)
                .or_else(|| caps.get(5))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = env.get(name);

            match (caps.get(3).map(|m| m.as_str()), caps.get(4)) {
                (Some(":-"), Some(default)) => match value {
                    Some(v) if !v.is_empty() => v.clone(),
                    _ => default.as_str().to_string(),
                },
                (Some(_), Some(default)) => value
                    .cloned()
                    .unwrap_or_else(|| default.as_str().to_string()),
                _ => value.cloned().unwrap_or_else(|| {
                    tracing::warn!("The {} variable is not set. Defaulting to a blank string.", name);
                    String::new()
                }),
            }
        })
        .into_owned()
}

/// Parse a compose duration such as `1m30s`, `1.5s` or `500ms`
pub fn parse_duration(value: &str) -> ConfigResult<Duration> {
    let invalid = || ConfigError::InvalidDuration(value.to_string());
    let text = value.trim();

    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let unit = Regex::new(r"(\d+)(?:\.(\d+))?(ms|us|µs|ns|h|m|s)")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut nanos: u128 = 0;
    let mut consumed = 0;
    for caps in unit.captures_iter(text) {
        let (Some(whole), Some(suffix)) = (caps.get(0), caps.get(3)) else {
            return Err(invalid());
        };
        if whole.start() != consumed {
            return Err(invalid());
        }
        consumed = whole.end();

        let scale: u128 = match suffix.as_str() {
            "h" => 3_600_000_000_000,
            "m" => 60_000_000_000,
            "s" => 1_000_000_000,
            "ms" => 1_000_000,
            "us" | "µs" => 1_000,
            _ => 1,
        };
        let integer: u128 = caps[1].parse().map_err(|_| invalid())?;
        nanos = integer
            .checked_mul(scale)
            .and_then(|n| nanos.checked_add(n))
            .ok_or_else(invalid)?;

        if let Some(fraction) = caps.get(2) {
            // Digits past nanosecond precision are dropped
            let digits = &fraction.as_str()[..fraction.as_str().len().min(9)];
            let numerator: u128 = digits.parse().map_err(|_| invalid())?;
            let denominator = 10u128
                .checked_pow(digits.len() as u32)
                .ok_or_else(invalid)?;
            nanos = numerator
                .checked_mul(scale)
                .map(|n| n / denominator)
                .and_then(|n| nanos.checked_add(n))
                .ok_or_else(invalid)?;
        }
    }

    if consumed == 0 || consumed != text.len() {
        return Err(invalid());
    }

    let secs = u64::try_from(nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

fn duration(value: Option<&DurationConfig>, default: Duration) -> ConfigResult<Duration> {
    match value {
        None => Ok(default),
        Some(DurationConfig::Seconds(seconds)) => Ok(Duration::from_secs(*seconds)),
        Some(DurationConfig::Text(text)) => parse_duration(text),
    }
}

/// Split a shell-form command into words, honouring quotes
fn split_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn command_vector(command: &CommandConfig) -> Vec<String> {
    match command {
        CommandConfig::Shell(line) => split_command(line),
        CommandConfig::Exec(words) => words.clone(),
    }
}

fn resolve_host_path(path: &str, working_dir: &Path) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path.strip_prefix("./").unwrap_or(path))
    }
}

fn mount_string(mount: &VolumeMount, working_dir: &Path) -> String {
    let (source, rest) = match mount {
        VolumeMount::Short(short) => match short.split_once(':') {
            Some((source, rest)) => (Some(source.to_string()), rest.to_string()),
            None => return short.clone(),
        },
        VolumeMount::Long(long) => {
            let mode = if long.read_only.unwrap_or(false) { ":ro" } else { "" };
            (long.source.clone(), format!("{}{}", long.target, mode))
        }
    };

    match source {
        Some(source) if source.starts_with('.') || source.starts_with('~') => {
            format!("{}:{}", resolve_host_path(&source, working_dir).display(), rest)
        }
        Some(source) if !source.is_empty() => format!("{}:{}", source, rest),
        _ => rest,
    }
}

fn port_string(port: &PortConfig) -> String {
    match port {
        PortConfig::Short(value) => value.to_string(),
        PortConfig::Long(long) => {
            let mut port = String::new();
            if let Some(ip) = &long.host_ip {
                port.push_str(ip);
                port.push(':');
            }
            if let Some(published) = &long.published {
                port.push_str(&published.to_string());
                port.push(':');
            }
            port.push_str(&long.target.to_string());
            if let Some(protocol) = &long.protocol {
                port.push('/');
                port.push_str(protocol);
            }
            port
        }
    }
}

fn key_values(config: &EnvironmentConfig, env: &HashMap<String, String>) -> Vec<(String, String)> {
    // A bare key takes its value from the host environment, or is dropped
    match config {
        EnvironmentConfig::Array(items) => items
            .iter()
            .filter_map(|item| match item.split_once('=') {
                Some((key, value)) => Some((key.to_string(), value.to_string())),
                None => env.get(item).map(|value| (item.clone(), value.clone())),
            })
            .collect(),
        EnvironmentConfig::Map(map) => map
            .iter()
            .filter_map(|(key, value)| match value {
                Some(value) => Some((key.clone(), value.to_string())),
                None => env.get(key).map(|value| (key.clone(), value.clone())),
            })
            .collect(),
    }
}

fn service_spec(
    name: &str,
    service: &ServiceConfig,
    project: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> ConfigResult<ServiceSpec> {
    let image = match (&service.build, &service.image) {
        (Some(build), image) => {
            let (context, dockerfile, args, target) = match build {
                BuildConfig::Simple(context) => (context.clone(), None, Vec::new(), None),
                BuildConfig::Full(full) => (
                    full.context.clone().unwrap_or_else(|| ".".to_string()),
                    full.dockerfile.as_ref().map(PathBuf::from),
                    full.args
                        .as_ref()
                        .map(|args| key_values(args, env))
                        .unwrap_or_default(),
                    full.target.clone(),
                ),
            };
            ImageSource::Build(BuildSpec {
                context: resolve_host_path(&context, working_dir),
                dockerfile,
                args,
                target,
                tag: image
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}:latest", project, name)),
            })
        }
        (None, Some(image)) => ImageSource::Image(image.clone()),
        (None, None) => return Err(ConfigError::MissingImage(name.to_string())),
    };

    let mut spec = ServiceSpec::new(name, image);

    if let Some(environment) = &service.environment {
        spec.environment = key_values(environment, env);
    }
    if let Some(networks) = &service.networks {
        spec.networks = networks.names().into_iter().collect();
    }
    if let Some(depends_on) = &service.depends_on {
        spec.depends_on = depends_on.names();
    }

    let deploy_policy = service.deploy.as_ref().and_then(|d| d.restart_policy.as_ref());
    let restart = service
        .restart
        .as_deref()
        .or_else(|| deploy_policy.and_then(|p| p.condition.as_deref()));
    if let Some(value) = restart {
        spec.restart = value
            .parse::<RestartPolicy>()
            .map_err(|_| ConfigError::InvalidRestartPolicy {
                service: name.to_string(),
                value: value.to_string(),
            })?;
    }
    spec.max_restarts = deploy_policy.and_then(|p| p.max_attempts).or_else(|| {
        restart
            .and_then(|value| value.split_once(':'))
            .and_then(|(_, limit)| limit.trim().parse().ok())
    });

    spec.entrypoint = service.entrypoint.as_ref().map(command_vector);
    spec.command = service.command.as_ref().map(command_vector);

    if let Some(readiness) = &service.readiness {
        spec.readiness = Some(ReadinessCheck {
            endpoint: readiness.endpoint.clone(),
            timeout: duration(readiness.timeout.as_ref(), DEFAULT_READINESS_TIMEOUT)?,
            interval: duration(readiness.interval.as_ref(), DEFAULT_READINESS_INTERVAL)?,
        });
    }

    spec.mounts = service
        .volumes
        .iter()
        .flatten()
        .map(|mount| mount_string(mount, working_dir))
        .collect();
    spec.ports = service.ports.iter().flatten().map(port_string).collect();
    spec.working_dir = service.working_dir.clone();
    spec.container_name = service.container_name.clone();

    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::DEFAULT_NETWORK;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(yaml: &str) -> ConfigResult<ServiceRegistry> {
        let config = ComposeParser::parse_str(yaml)?;
        ComposeParser::load(&config, "dev", Path::new("/srv/dev"), &HashMap::new())
    }

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
version: "3.8"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        let names: Vec<&String> = config.services.keys().collect();
        assert_eq!(names, vec!["web", "db"]);
    }

    #[test]
    fn test_load_full_service() {
        let yaml = r#"
services:
  db:
    image: postgres:16
    environment:
      POSTGRES_PORT: 5432
      DEBUG: true
    volumes:
      - pgdata:/var/lib/postgresql/data
    networks: [backend]
    restart: on-failure
    deploy:
      restart_policy:
        max_attempts: 3
    x-readiness:
      endpoint: localhost:5432
      timeout: 1m30s
      interval: 500ms
  api:
    build:
      context: ./api
      dockerfile: Dockerfile.dev
      args:
        - VERSION=2
    command: serve --bind "0.0.0.0:8080"
    depends_on:
      db:
        condition: service_healthy
    volumes:
      - ./src:/app/src:ro
    ports:
      - 8080
      - target: 9090
        published: 19090
        protocol: tcp
    networks:
      backend:
      frontend:
        aliases: [api]
    restart: always
networks:
  backend:
    driver: bridge
volumes:
  pgdata:
"#;

        let registry = load(yaml).unwrap();
        assert_eq!(registry.launch_order(), ["db", "api"]);

        let db = registry.resolve("db").unwrap();
        assert_eq!(
            db.environment,
            vec![
                ("POSTGRES_PORT".to_string(), "5432".to_string()),
                ("DEBUG".to_string(), "true".to_string()),
            ]
        );
        assert_eq!(db.restart, RestartPolicy::OnFailure);
        assert_eq!(db.max_restarts, Some(3));
        let readiness = db.readiness.as_ref().unwrap();
        assert_eq!(readiness.timeout, Duration::from_secs(90));
        assert_eq!(readiness.interval, Duration::from_millis(500));

        let api = registry.resolve("api").unwrap();
        match &api.image {
            ImageSource::Build(build) => {
                assert_eq!(build.context, PathBuf::from("/srv/dev/api"));
                assert_eq!(build.tag, "dev-api:latest");
                assert_eq!(build.args, vec![("VERSION".to_string(), "2".to_string())]);
            }
            other => panic!("expected a build, got {:?}", other),
        }
        assert_eq!(
            api.command.as_deref(),
            Some(&["serve".to_string(), "--bind".to_string(), "0.0.0.0:8080".to_string()][..])
        );
        assert_eq!(api.depends_on, vec!["db"]);
        assert_eq!(api.mounts, vec!["/srv/dev/src:/app/src:ro"]);
        assert_eq!(api.ports, vec!["8080", "19090:9090/tcp"]);
        assert_eq!(api.restart, RestartPolicy::Always);

        assert!(registry.network("frontend").unwrap().members.contains("api"));
        assert_eq!(
            registry.network("backend").unwrap().driver.as_deref(),
            Some("bridge")
        );
        assert!(registry.network(DEFAULT_NETWORK).is_none());
    }

    #[test]
    fn test_missing_image() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;
        assert_eq!(
            load(yaml).unwrap_err(),
            ConfigError::MissingImage("web".to_string())
        );
    }

    #[test]
    fn test_dangling_dependency() {
        let yaml = r#"
services:
  x:
    image: x
    depends_on: [y]
"#;
        assert_eq!(
            load(yaml).unwrap_err(),
            ConfigError::DanglingDependency {
                service: "x".to_string(),
                dependency: "y".to_string(),
            }
        );
    }

    #[test]
    fn test_cyclic_dependency() {
        let yaml = r#"
services:
  a:
    image: a
    depends_on: [b]
  b:
    image: b
    depends_on: [a]
"#;
        let err = load(yaml).unwrap_err();
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_invalid_restart_policy() {
        let yaml = r#"
services:
  a:
    image: a
    restart: sometimes
"#;
        assert!(matches!(
            load(yaml),
            Err(ConfigError::InvalidRestartPolicy { .. })
        ));
    }

    #[test]
    fn test_bind_backed_volume() {
        let yaml = r#"
services:
  db:
    image: postgres
    volumes:
      - data:/data
volumes:
  data:
    driver_opts:
      type: none
      o: bind
      device: ./data
  cache:
    external: true
"#;
        let registry = load(yaml).unwrap();
        assert_eq!(
            registry.volume("data").unwrap().mount_path,
            Some(PathBuf::from("/srv/dev/data"))
        );
        assert!(registry.volume("cache").unwrap().external);
    }

    #[test]
    fn test_interpolate() {
        let pattern = interpolation_pattern().unwrap();
        let env = env(&[("TAG", "1.0.0"), ("EMPTY", "")]);

        assert_eq!(interpolate_string(&pattern, "nginx:${TAG}", &env), "nginx:1.0.0");
        assert_eq!(interpolate_string(&pattern, "nginx:$TAG", &env), "nginx:1.0.0");
        assert_eq!(interpolate_string(&pattern, "${MISSING:-x}", &env), "x");
        assert_eq!(interpolate_string(&pattern, "${EMPTY:-x}", &env), "x");
        assert_eq!(interpolate_string(&pattern, "${EMPTY-x}", &env), "");
        assert_eq!(interpolate_string(&pattern, "${MISSING-x}", &env), "x");
        assert_eq!(interpolate_string(&pattern, "$${TAG}", &env), "${TAG}");
        assert_eq!(interpolate_string(&pattern, "a${MISSING}b", &env), "ab");
    }

    #[test]
    fn test_interpolate_config() {
        let yaml = r#"
services:
  db:
    image: postgres:${PG_VERSION:-15}
    environment:
      - POSTGRES_USER=${USER_NAME}
    x-readiness:
      endpoint: localhost:${PG_PORT}
"#;
        let mut config = ComposeParser::parse_str(yaml).unwrap();
        ComposeParser::interpolate(
            &mut config,
            &env(&[("USER_NAME", "dev"), ("PG_PORT", "5433")]),
        )
        .unwrap();

        let db = &config.services["db"];
        assert_eq!(db.image.as_deref(), Some("postgres:15"));
        assert!(matches!(
            &db.environment,
            Some(EnvironmentConfig::Array(items)) if items == &vec!["POSTGRES_USER=dev".to_string()]
        ));
        assert_eq!(db.readiness.as_ref().unwrap().endpoint, "localhost:5433");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("0.3s").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));

        for bad in ["", "10x", "s", "1m 30s", "-5s"] {
            assert_eq!(
                parse_duration(bad).unwrap_err(),
                ConfigError::InvalidDuration(bad.to_string())
            );
        }
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        for huge in [
            "999999999999999999999999999999h",
            "340282366920938463463374607431768211455ns",
            "18446744073709551616s",
            "99999999999999999999999999999m99999999999999999999999999999h",
        ] {
            assert_eq!(
                parse_duration(huge).unwrap_err(),
                ConfigError::InvalidDuration(huge.to_string())
            );
        }

        assert_eq!(
            parse_duration("1.0000000005s").unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            parse_duration("1.123456789123s").unwrap(),
            Duration::new(1, 123_456_789)
        );
    }

    #[test]
    fn test_oversized_readiness_timeout_is_config_error() {
        let yaml = r#"
services:
  db:
    image: postgres:16
    x-readiness:
      endpoint: db:5432
      timeout: 999999999999999999999999999999h
"#;
        assert!(matches!(load(yaml), Err(ConfigError::InvalidDuration(_))));
    }

    #[test]
    fn test_zero_readiness_interval_is_rejected() {
        let yaml = r#"
services:
  db:
    image: postgres:16
    x-readiness:
      endpoint: db:5432
      interval: 0s
"#;
        assert!(matches!(load(yaml), Err(ConfigError::InvalidDuration(_))));
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command(r#"sh -c 'echo "hi there"' --flag\ value"#),
            vec!["sh", "-c", "echo \"hi there\"", "--flag value"]
        );
        assert_eq!(split_command("  "), Vec::<String>::new());
        assert_eq!(split_command("run ''"), vec!["run", ""]);
    }

    #[test]
    fn test_merge_configs() {
        let base = ComposeParser::parse_str(
            r#"
services:
  api:
    image: api:1
    environment:
      A: "1"
      B: "2"
"#,
        )
        .unwrap();
        let overlay = ComposeParser::parse_str(
            r#"
name: Override
services:
  api:
    image: api:2
    environment:
      B: "3"
  worker:
    image: worker
"#,
        )
        .unwrap();

        let merged = ComposeParser::merge_configs(base, overlay);
        assert_eq!(merged.name.as_deref(), Some("Override"));
        assert_eq!(merged.services.len(), 2);

        let registry =
            ComposeParser::load(&merged, "dev", Path::new("/srv"), &HashMap::new()).unwrap();
        let api = registry.resolve("api").unwrap();
        assert_eq!(api.image, ImageSource::Image("api:2".to_string()));
        assert_eq!(
            api.environment,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_project_name() {
        let config = ComposeConfig::default();
        assert_eq!(
            ComposeParser::project_name(&config, Path::new("/home/me/My App"), None),
            "myapp"
        );
        assert_eq!(
            ComposeParser::project_name(&config, Path::new("/x"), Some("_Dev-Env")),
            "dev-env"
        );

        let named = ComposeConfig {
            name: Some("shop".to_string()),
            ..Default::default()
        };
        assert_eq!(
            ComposeParser::project_name(&named, Path::new("/x"), None),
            "shop"
        );
    }

    #[test]
    fn test_load_project_from_dir() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ComposeParser::load_project(&[], dir.path(), None, &HashMap::new()),
            Err(ConfigError::FileNotFound(_))
        ));

        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  db:\n    image: postgres\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("override.yml"),
            "services:\n  db:\n    image: postgres:16\n",
        )
        .unwrap();

        let found = ComposeParser::find_compose_file(dir.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));

        let project = ComposeParser::load_project(
            &[found, dir.path().join("override.yml")],
            dir.path(),
            Some("demo"),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(project.registry.project(), "demo");
        assert_eq!(
            project.registry.resolve("db").unwrap().image,
            ImageSource::Image("postgres:16".to_string())
        );
        assert!(project.digest.starts_with("sha256:"));
        assert_eq!(project.files.len(), 2);
    }
}
