//! Scripted fakes for the runtime and connector seams

use crate::container::{
    ContainerHandle, ContainerRuntime, ContainerStatus, ExitStatus, LaunchRequest,
};
use crate::error::{BerthError, Result};
use crate::orchestrator::probe::Connector;
use crate::service::{Endpoint, ImageSource, Network, Volume};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Connector that replays a list of errors, then succeeds
pub struct ScriptedConnector {
    errors: Mutex<VecDeque<io::ErrorKind>>,
    forever: Option<io::ErrorKind>,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub fn refuse_first(n: usize) -> Self {
        Self::with_errors(vec![io::ErrorKind::ConnectionRefused; n])
    }

    pub fn never_ready() -> Self {
        Self {
            errors: Mutex::new(VecDeque::new()),
            forever: Some(io::ErrorKind::ConnectionRefused),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn with_errors(errors: Vec<io::ErrorKind>) -> Self {
        Self {
            errors: Mutex::new(errors.into()),
            forever: None,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.errors.lock().unwrap().pop_front() {
            return Err(io::Error::from(kind));
        }
        match self.forever {
            Some(kind) => Err(io::Error::from(kind)),
            None => Ok(()),
        }
    }
}

/// What a started container does
#[derive(Debug, Clone)]
pub enum RunScript {
    /// Keep running until stopped
    RunForever,
    /// Exit with `code` after `after`
    ExitAfter(Duration, i64),
    /// Fail to start
    FailStart(String),
}

/// Calls observed by [`ScriptedRuntime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    PrepareImage(String),
    CreateNetwork(String),
    RemoveNetwork(String),
    CreateVolume(String),
    RemoveVolume(String),
    Start(String),
    Stop(String),
}

/// Runtime whose containers follow per-service scripts
#[derive(Default)]
pub struct ScriptedRuntime {
    scripts: Mutex<HashMap<String, VecDeque<RunScript>>>,
    running: Mutex<HashMap<String, RunScript>>,
    unavailable: Mutex<HashSet<String>>,
    calls: Mutex<Vec<RuntimeCall>>,
    starts: AtomicU32,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue scripts for successive starts of `service`; later starts run forever
    pub fn script(&self, service: &str, scripts: Vec<RunScript>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(service.to_string(), scripts.into());
    }

    /// Make image preparation fail for `service`
    pub fn image_unavailable(&self, service: &str) {
        self.unavailable.lock().unwrap().insert(service.to_string());
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Services in the order they were started
    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Start(service) => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Services in the order they were stopped
    pub fn stopped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Stop(service) => Some(service),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn prepare_image(&self, service: &str, source: &ImageSource) -> Result<String> {
        self.record(RuntimeCall::PrepareImage(service.to_string()));
        if self.unavailable.lock().unwrap().contains(service) {
            return Err(BerthError::launch(service, "image unavailable"));
        }
        Ok(source.reference().to_string())
    }

    async fn create_network(&self, _project: &str, network: &Network) -> Result<()> {
        self.record(RuntimeCall::CreateNetwork(network.name.clone()));
        Ok(())
    }

    async fn remove_network(&self, _project: &str, network: &Network) -> Result<()> {
        self.record(RuntimeCall::RemoveNetwork(network.name.clone()));
        Ok(())
    }

    async fn create_volume(&self, _project: &str, volume: &Volume) -> Result<()> {
        self.record(RuntimeCall::CreateVolume(volume.name.clone()));
        Ok(())
    }

    async fn remove_volume(&self, _project: &str, volume: &Volume) -> Result<()> {
        self.record(RuntimeCall::RemoveVolume(volume.name.clone()));
        Ok(())
    }

    async fn start(&self, request: &LaunchRequest) -> Result<ContainerHandle> {
        self.record(RuntimeCall::Start(request.service.clone()));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.service)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(RunScript::RunForever);

        if let RunScript::FailStart(message) = &script {
            return Err(BerthError::launch(&request.service, message.clone()));
        }

        let id = format!(
            "{}-{}",
            request.service,
            self.starts.fetch_add(1, Ordering::SeqCst)
        );
        self.running.lock().unwrap().insert(id.clone(), script);

        Ok(ContainerHandle {
            id,
            name: request.service.clone(),
        })
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<()> {
        self.record(RuntimeCall::Stop(handle.name.clone()));
        self.running.lock().unwrap().remove(&handle.id);
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus> {
        let script = self.running.lock().unwrap().get(&handle.id).cloned();
        match script {
            Some(RunScript::ExitAfter(after, code)) => {
                tokio::time::sleep(after).await;
                Ok(ExitStatus { code })
            }
            _ => std::future::pending().await,
        }
    }

    async fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        if self.running.lock().unwrap().contains_key(&handle.id) {
            Ok(ContainerStatus::Running)
        } else {
            Ok(ContainerStatus::Missing)
        }
    }
}
