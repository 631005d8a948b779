//! Launch sequencing
//!
//! A [`Session`] owns one [`ServiceInstance`] per declared service and runs
//! each on its own task. An instance waits for its dependencies to be Ready,
//! prepares its image, starts its container, probes readiness and then hands
//! every exit to the restart supervisor until it settles or is stopped.

use super::event::{EventKind, SessionEvent, EVENT_CHANNEL_CAPACITY};
use super::instance::{InstanceState, ServiceInstance};
use super::probe::ReadinessProber;
use super::supervisor::{Backoff, ExitCause, RestartDecision, RestartSupervisor};
use crate::container::{ContainerHandle, ContainerRuntime, ExitStatus, LaunchRequest};
use crate::error::{BerthError, ConfigError, InstanceFailure, Result};
use crate::service::ServiceRegistry;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default grace period given to a container before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Session tuning
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Restart backoff
    pub backoff: Backoff,
    /// Grace period for stopping containers
    pub stop_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// State shared with the instance tasks
struct Shared {
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    prober: ReadinessProber,
    supervisor: RestartSupervisor,
    stop_grace: Duration,
    instances: IndexMap<String, Arc<ServiceInstance>>,
}

/// One `up` run of a project
pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    tasks: Mutex<JoinSet<()>>,
    started: AtomicBool,
    spawned: AtomicBool,
}

impl Session {
    /// Create a session; every service gets a Pending instance
    pub fn new(
        registry: ServiceRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        prober: ReadinessProber,
        config: SessionConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut instances = IndexMap::new();
        for name in registry.launch_order() {
            // launch_order only names registered services
            if let Ok(spec) = registry.resolve(name) {
                let instance = ServiceInstance::new(spec.clone(), cancel.child_token(), events.clone());
                instances.insert(name.clone(), Arc::new(instance));
            }
        }

        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            shared: Arc::new(Shared {
                registry: Arc::new(registry),
                runtime,
                prober,
                supervisor: RestartSupervisor::new(config.backoff),
                stop_grace: config.stop_grace,
                instances,
            }),
            cancel,
            events,
            tasks: Mutex::new(JoinSet::new()),
            started: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
        }
    }

    /// Session identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the session was created
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Project registry
    pub fn registry(&self) -> &ServiceRegistry {
        &self.shared.registry
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Cancel every in-flight probe, backoff and dependency wait
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Look up an instance
    pub fn instance(&self, name: &str) -> Option<&Arc<ServiceInstance>> {
        self.shared.instances.get(name)
    }

    /// Instances in launch order
    pub fn instances(&self) -> impl Iterator<Item = &Arc<ServiceInstance>> {
        self.shared.instances.values()
    }

    /// Bring the project up.
    ///
    /// Returns once every instance has been Ready at least once or reached a
    /// terminal state. Instances keep being supervised afterwards until
    /// [`Session::down`] or [`Session::cancel`].
    ///
    /// # Errors
    ///
    /// - [`BerthError::LaunchAborted`] listing every instance that failed
    /// - [`BerthError::Cancelled`] when the session is cancelled first
    /// - runtime errors while creating networks or volumes
    pub async fn up(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BerthError::Runtime("session already started".to_string()));
        }

        let registry = &self.shared.registry;
        tracing::info!(
            "Starting project {} ({} services)",
            registry.project(),
            registry.len()
        );

        cancellable(&self.cancel, self.provision()).await?;

        {
            let mut tasks = self.tasks.lock().await;
            for instance in self.shared.instances.values() {
                let shared = self.shared.clone();
                let instance = instance.clone();
                tasks.spawn(async move { shared.run(instance).await });
            }
            self.spawned.store(true, Ordering::SeqCst);
        }

        for instance in self.shared.instances.values() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BerthError::Cancelled),
                _ = instance.wait_settled() => {}
            }
        }

        let failures: Vec<InstanceFailure> = self
            .shared
            .instances
            .values()
            .filter(|i| i.state() == InstanceState::Failed)
            .map(|i| {
                i.failure().unwrap_or_else(|| InstanceFailure {
                    service: i.name().to_string(),
                    kind: "LaunchError",
                    message: "failed".to_string(),
                })
            })
            .collect();

        if failures.is_empty() {
            tracing::info!("Project {} is up", registry.project());
            Ok(())
        } else {
            Err(BerthError::LaunchAborted { failures })
        }
    }

    /// Tear the project down in reverse dependency order.
    ///
    /// Each instance is stopped by its own task; the next one is only asked
    /// to stop once the previous one is terminal. A session whose instances
    /// never ran removes containers left behind by an earlier run instead.
    pub async fn down(&self, remove_volumes: bool) -> Result<()> {
        let registry = &self.shared.registry;
        let project = registry.project();
        tracing::info!("Stopping project {}", project);

        let spawned = self.spawned.load(Ordering::SeqCst);
        for instance in self.shared.instances.values().rev() {
            instance.request_stop();
            if spawned {
                instance.wait_terminal().await;
            } else {
                let handle = ContainerHandle::named(&instance.spec().container_name(project));
                if let Err(e) = self.shared.runtime.stop(&handle, self.shared.stop_grace).await {
                    tracing::debug!("No container to remove for {}: {}", instance.name(), e);
                }
                if let Err(e) = instance.transition(InstanceState::Stopped) {
                    tracing::debug!("{}", e);
                }
            }
        }

        self.cancel.cancel();
        {
            let mut tasks = self.tasks.lock().await;
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::warn!("Instance task ended abnormally: {}", e);
                }
            }
        }

        for network in registry.networks().collect::<Vec<_>>().into_iter().rev() {
            if let Err(e) = self.shared.runtime.remove_network(project, network).await {
                tracing::warn!("Failed to remove network {}: {}", network.name, e);
            }
        }

        if remove_volumes {
            for volume in registry.volumes() {
                if let Err(e) = self.shared.runtime.remove_volume(project, volume).await {
                    tracing::warn!("Failed to remove volume {}: {}", volume.name, e);
                }
            }
        }

        tracing::info!("Project {} is down", project);
        Ok(())
    }

    /// Create networks and volumes before anything starts
    async fn provision(&self) -> Result<()> {
        let registry = &self.shared.registry;
        let project = registry.project();

        for network in registry.networks() {
            tracing::info!("Creating network {}", network.runtime_name(project));
            self.shared.runtime.create_network(project, network).await?;
        }
        for volume in registry.volumes() {
            tracing::info!("Creating volume {}", volume.runtime_name(project));
            self.shared.runtime.create_volume(project, volume).await?;
        }
        Ok(())
    }
}

impl Shared {
    /// Body of an instance task. Always leaves the instance terminal.
    async fn run(self: Arc<Self>, instance: Arc<ServiceInstance>) {
        let result = self.drive(&instance).await;

        if let Some(handle) = instance.take_container() {
            self.stop_container(&instance, &handle).await;
        }

        let next = match result {
            Ok(()) => InstanceState::Stopped,
            Err(e) if e.is_cancelled() => InstanceState::Stopped,
            Err(e) => {
                tracing::error!("Service {} failed: {}", instance.name(), e);
                instance.record_error(&e);
                instance.emit(EventKind::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                InstanceState::Failed
            }
        };

        if let Err(e) = instance.transition(next) {
            tracing::debug!("{}", e);
        }
    }

    async fn drive(&self, instance: &ServiceInstance) -> Result<()> {
        self.wait_for_dependencies(instance).await?;

        let spec = instance.spec().clone();
        let stop = instance.stop_token();

        instance.transition(InstanceState::Building)?;
        let image = cancellable(stop, self.runtime.prepare_image(&spec.name, &spec.image)).await?;
        let request = LaunchRequest::for_service(&self.registry, &spec, &image);

        loop {
            instance.transition(InstanceState::Starting)?;
            let cause = self.launch_once(instance, &request).await?;

            match self.supervisor.decide(&spec, cause, instance.restarts()) {
                RestartDecision::Restart { attempt, delay } => {
                    instance.transition(InstanceState::Restarting)?;
                    self.supervisor.wait_backoff(instance, attempt, delay).await?;
                }
                RestartDecision::Settle => {
                    tracing::info!("Service {} exited cleanly", spec.name);
                    return Ok(());
                }
                RestartDecision::GiveUp(e) => return Err(e),
            }
        }
    }

    /// Gate on every declared dependency being Ready.
    ///
    /// A dependency that stopped after having been Ready counts as satisfied;
    /// one that ended without ever being Ready fails this instance.
    async fn wait_for_dependencies(&self, instance: &ServiceInstance) -> Result<()> {
        for name in &instance.spec().depends_on {
            let dependency = self
                .instances
                .get(name)
                .ok_or_else(|| ConfigError::UnknownService(name.clone()))?;

            let state = tokio::select! {
                biased;
                _ = instance.stop_token().cancelled() => return Err(BerthError::Cancelled),
                state = dependency.wait_ready() => state,
            };

            let satisfied = state == InstanceState::Ready
                || (state == InstanceState::Stopped && dependency.has_been_ready());
            if !satisfied {
                return Err(BerthError::DependencyFailed {
                    service: instance.name().to_string(),
                    dependency: name.clone(),
                });
            }
            tracing::debug!("{}: dependency {} is ready", instance.name(), name);
        }
        Ok(())
    }

    /// Start the container once and follow it until it exits.
    ///
    /// Only cancellation is returned as an error; everything else is an
    /// [`ExitCause`] for the supervisor.
    async fn launch_once(
        &self,
        instance: &ServiceInstance,
        request: &LaunchRequest,
    ) -> Result<ExitCause> {
        let stop = instance.stop_token();

        // Not cancelled mid-flight so a created container is always tracked
        let handle = match self.runtime.start(request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Service {} failed to start: {}", instance.name(), e);
                instance.record_error(&e);
                return Ok(ExitCause::StartFailed(e));
            }
        };
        tracing::info!("Started {} ({})", handle.name, handle.id);
        instance.set_container(handle.clone());

        if stop.is_cancelled() {
            return Err(BerthError::Cancelled);
        }

        instance.transition(InstanceState::WaitingReady)?;
        let mut exited = self.runtime.wait(&handle);

        if let Some(check) = &instance.spec().readiness {
            let probe = self
                .prober
                .probe(&check.endpoint, check.timeout, check.interval, stop);

            tokio::select! {
                biased;
                status = &mut exited => {
                    return self.exit_cause(instance, status).await;
                }
                probed = probe => match probed {
                    Ok(report) => tracing::info!(
                        "Service {} is ready ({} attempts, {:?})",
                        instance.name(),
                        report.attempts,
                        report.elapsed
                    ),
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        tracing::warn!("Service {} did not become ready: {}", instance.name(), e);
                        instance.record_error(&e);
                        self.release_container(instance).await;
                        return Ok(ExitCause::NotReady(e));
                    }
                },
            }
        } else {
            tracing::info!("Service {} is ready", instance.name());
        }

        instance.transition(InstanceState::Ready)?;

        let status = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(BerthError::Cancelled),
            status = &mut exited => status,
        };
        self.exit_cause(instance, status).await
    }

    async fn exit_cause(
        &self,
        instance: &ServiceInstance,
        status: Result<ExitStatus>,
    ) -> Result<ExitCause> {
        let status = status?;
        if status.success() {
            tracing::info!("Service {} exited with code 0", instance.name());
        } else {
            tracing::warn!("Service {} exited with code {}", instance.name(), status.code);
            instance.record_error(&BerthError::launch(
                instance.name(),
                format!("exited with code {}", status.code),
            ));
        }
        self.release_container(instance).await;
        Ok(ExitCause::Exited(status))
    }

    async fn release_container(&self, instance: &ServiceInstance) {
        if let Some(handle) = instance.take_container() {
            self.stop_container(instance, &handle).await;
        }
    }

    async fn stop_container(&self, instance: &ServiceInstance, handle: &ContainerHandle) {
        tracing::debug!("Stopping container {} of {}", handle.id, instance.name());
        if let Err(e) = self.runtime.stop(handle, self.stop_grace).await {
            tracing::warn!("Failed to stop container {}: {}", handle.name, e);
        }
    }
}

/// Run `future` unless `token` is cancelled first
async fn cancellable<T>(
    token: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(BerthError::Cancelled),
        result = future => result,
    }
}
