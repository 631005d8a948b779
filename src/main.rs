//! berth - development environment orchestrator
//!
//! This is the main CLI entry point for berth.

use berth::compose::{parse_duration, ComposeParser, LoadedProject};
use berth::container::docker::DEFAULT_DOCKER_BIN;
use berth::container::{ContainerHandle, ContainerRuntime, DockerCli};
use berth::error::{BerthError, Result};
use berth::orchestrator::{
    Backoff, ReadinessProber, Session, SessionConfig, SessionSnapshot, DEFAULT_STOP_GRACE,
};
use berth::service::ServiceRegistry;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// berth - start interdependent dev services in order
#[derive(Parser)]
#[command(name = "berth")]
#[command(version)]
#[command(about = "Start a compose project's services in dependency order", long_about = None)]
struct Cli {
    /// Compose file; repeat to merge several
    #[arg(short, long = "file", global = true)]
    file: Vec<PathBuf>,

    /// Project name
    #[arg(short, long, global = true)]
    project_name: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Docker binary
    #[arg(long, global = true, env = "BERTH_DOCKER", default_value = DEFAULT_DOCKER_BIN)]
    docker: PathBuf,

    /// Directory holding session snapshots
    #[arg(long, global = true, env = "BERTH_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// First restart delay
    #[arg(long, global = true, default_value = "1s", value_parser = duration_arg)]
    backoff_base: Duration,

    /// Longest restart delay
    #[arg(long, global = true, default_value = "30s", value_parser = duration_arg)]
    backoff_cap: Duration,

    /// Grace period before a stopping container is killed
    #[arg(long, global = true, value_parser = duration_arg)]
    stop_timeout: Option<Duration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start services in dependency order and supervise them
    Up {
        /// Return once everything is ready instead of supervising
        #[arg(short, long)]
        detach: bool,
    },
    /// Stop services in reverse dependency order
    Down {
        /// Remove named volumes
        #[arg(short, long)]
        volumes: bool,
    },
    /// Show the state of each service
    Status {
        /// Print the session snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the compose file and print the launch order
    Config,
}

fn duration_arg(value: &str) -> std::result::Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}: {}", e.kind(), e);
            if let BerthError::LaunchAborted { failures } = &e {
                for failure in failures {
                    eprintln!("  {}", failure);
                }
            }
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let working_dir = std::env::current_dir()?;
    let env: HashMap<String, String> = std::env::vars().collect();

    let project = ComposeParser::load_project(
        &cli.file,
        &working_dir,
        cli.project_name.as_deref(),
        &env,
    )?;

    let state_dir = cli.state_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("berth")
    });
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(&cli.docker));
    let config = SessionConfig {
        backoff: Backoff::new(cli.backoff_base, cli.backoff_cap),
        stop_grace: cli.stop_timeout.unwrap_or(DEFAULT_STOP_GRACE),
    };

    match cli.command {
        Commands::Up { detach } => up(project, runtime, config, &state_dir, detach).await,
        Commands::Down { volumes } => down(project, runtime, config, &state_dir, volumes).await,
        Commands::Status { json } => status(&project, runtime.as_ref(), &state_dir, json).await,
        Commands::Config => {
            print_config(&project);
            Ok(())
        }
    }
}

async fn up(
    project: LoadedProject,
    runtime: Arc<dyn ContainerRuntime>,
    config: SessionConfig,
    state_dir: &Path,
    detach: bool,
) -> Result<()> {
    let name = project.registry.project().to_string();
    if let Some(existing) = SessionSnapshot::load(state_dir, &name)? {
        if existing.supervisor_alive() {
            return Err(BerthError::Runtime(format!(
                "project {} is already up (pid {})",
                name, existing.pid
            )));
        }
    }

    let session = Arc::new(Session::new(
        project.registry,
        runtime,
        ReadinessProber::tcp(),
        config,
    ));
    let writer = spawn_snapshot_writer(session.clone(), project.digest.clone(), state_dir);

    let outcome = tokio::select! {
        result = session.up() => Some(result),
        _ = shutdown_signal() => None,
    };

    match outcome {
        None => {
            tracing::info!("Interrupted, stopping project {}", name);
            teardown(&session, writer, state_dir).await
        }
        Some(Err(e)) if detach => {
            writer.abort();
            SessionSnapshot::capture(&session, &project.digest).save(state_dir)?;
            Err(e)
        }
        Some(Err(e)) => {
            teardown(&session, writer, state_dir).await?;
            Err(e)
        }
        Some(Ok(())) => {
            print_snapshot(&SessionSnapshot::capture(&session, &project.digest));
            if detach {
                writer.abort();
                SessionSnapshot::capture(&session, &project.digest).save(state_dir)?;
                return Ok(());
            }

            tracing::info!("Supervising project {}; press Ctrl-C to stop", name);
            shutdown_signal().await;
            teardown(&session, writer, state_dir).await
        }
    }
}

async fn teardown(session: &Session, writer: JoinHandle<()>, state_dir: &Path) -> Result<()> {
    session.down(false).await?;
    writer.abort();
    SessionSnapshot::remove(state_dir, session.registry().project())
}

async fn down(
    project: LoadedProject,
    runtime: Arc<dyn ContainerRuntime>,
    config: SessionConfig,
    state_dir: &Path,
    remove_volumes: bool,
) -> Result<()> {
    let name = project.registry.project().to_string();

    if let Some(snapshot) = SessionSnapshot::load(state_dir, &name)? {
        if snapshot.supervisor_alive() {
            tracing::info!("Asking berth up (pid {}) to stop project {}", snapshot.pid, name);
            snapshot.signal_supervisor()?;

            let services = u32::try_from(snapshot.services.len()).unwrap_or(u32::MAX);
            let patience = config.stop_grace.saturating_mul(services.saturating_add(1));
            let deadline = tokio::time::Instant::now() + patience;
            while snapshot.supervisor_alive() {
                if tokio::time::Instant::now() >= deadline {
                    return Err(BerthError::Runtime(format!(
                        "berth up (pid {}) did not stop within {:?}",
                        snapshot.pid, patience
                    )));
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            if remove_volumes {
                for volume in project.registry.volumes() {
                    if let Err(e) = runtime.remove_volume(&name, volume).await {
                        tracing::warn!("Failed to remove volume {}: {}", volume.name, e);
                    }
                }
            }
            return Ok(());
        }
    }

    let session = Session::new(project.registry, runtime, ReadinessProber::tcp(), config);
    session.down(remove_volumes).await?;
    SessionSnapshot::remove(state_dir, &name)
}

async fn status(
    project: &LoadedProject,
    runtime: &dyn ContainerRuntime,
    state_dir: &Path,
    json: bool,
) -> Result<()> {
    let name = project.registry.project();
    let snapshot = SessionSnapshot::load(state_dir, name)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    match snapshot {
        Some(snapshot) => {
            if snapshot.config_digest != project.digest {
                tracing::warn!("Compose file changed since project {} was started", name);
            }
            if snapshot.supervisor_alive() {
                println!(
                    "Project {} (session {}, supervised by pid {})",
                    name, snapshot.session_id, snapshot.pid
                );
                print_snapshot(&snapshot);
            } else {
                println!(
                    "Project {} (session {}, not supervised)",
                    name, snapshot.session_id
                );
                print_snapshot(&snapshot);
                println!();
                print_containers(&project.registry, runtime).await;
            }
        }
        None => {
            println!("Project {} has no running session", name);
            print_containers(&project.registry, runtime).await;
        }
    }
    Ok(())
}

/// Ask the runtime about each service's container directly
async fn print_containers(registry: &ServiceRegistry, runtime: &dyn ContainerRuntime) {
    println!("{:<20} {:<30} {}", "SERVICE", "CONTAINER", "STATUS");
    for spec in registry.services() {
        let container = spec.container_name(registry.project());
        let status = match runtime.status(&ContainerHandle::named(&container)).await {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        };
        println!("{:<20} {:<30} {}", spec.name, container, status);
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    println!(
        "{:<20} {:<14} {:<9} {:<14} {}",
        "SERVICE", "STATE", "RESTARTS", "CONTAINER", "ERROR"
    );
    for service in &snapshot.services {
        let container = service
            .container_id
            .as_deref()
            .map(|id| &id[..id.len().min(12)])
            .unwrap_or("-");
        println!(
            "{:<20} {:<14} {:<9} {:<14} {}",
            service.name,
            service.state.to_string(),
            service.restarts,
            container,
            service.last_error.as_deref().unwrap_or("")
        );
    }
}

fn print_config(project: &LoadedProject) {
    let registry = &project.registry;
    println!("Project: {}", registry.project());
    for file in &project.files {
        println!("File: {}", file.display());
    }
    println!("Digest: {}", project.digest);

    println!("Launch order:");
    for (index, name) in registry.launch_order().iter().enumerate() {
        let Ok(spec) = registry.resolve(name) else {
            continue;
        };
        if spec.depends_on.is_empty() {
            println!("  {}. {}", index + 1, name);
        } else {
            println!(
                "  {}. {} (after {})",
                index + 1,
                name,
                spec.depends_on.join(", ")
            );
        }
    }

    println!("Networks:");
    for network in registry.networks() {
        let members: Vec<&str> = network.members.iter().map(String::as_str).collect();
        println!("  {}: {}", network.name, members.join(", "));
    }

    if registry.volumes().next().is_some() {
        println!("Volumes:");
        for volume in registry.volumes() {
            println!("  {}", volume.name);
        }
    }
}

/// Keep the snapshot file current while the session runs
fn spawn_snapshot_writer(session: Arc<Session>, digest: String, state_dir: &Path) -> JoinHandle<()> {
    let mut events = session.subscribe();
    let state_dir = state_dir.to_path_buf();

    tokio::spawn(async move {
        loop {
            if let Err(e) = SessionSnapshot::capture(&session, &digest).save(&state_dir) {
                tracing::warn!("Failed to write session snapshot: {}", e);
            }
            match events.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Snapshot writer skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
