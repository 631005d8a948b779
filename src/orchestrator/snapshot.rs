//! Session snapshots
//!
//! A running `up` keeps a JSON snapshot of its instances in the state
//! directory so `status` and `down` in another process can see it.

use super::instance::InstanceState;
use super::sequencer::Session;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One instance as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    /// Service name
    pub name: String,
    /// Lifecycle state
    pub state: InstanceState,
    /// Restarts performed
    pub restarts: u32,
    /// Container name
    pub container_name: String,
    /// Runtime container ID, when running
    pub container_id: Option<String>,
    /// Most recent error
    pub last_error: Option<String>,
}

/// Snapshot of a whole session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session ID
    pub session_id: Uuid,
    /// Project name
    pub project: String,
    /// PID of the supervising `up` process
    pub pid: u32,
    /// Digest of the compose document the session was started from
    pub config_digest: String,
    /// Session start
    pub started_at: DateTime<Utc>,
    /// Last update
    pub updated_at: DateTime<Utc>,
    /// Instances in launch order
    pub services: Vec<ServiceSnapshot>,
}

impl SessionSnapshot {
    /// Record the current state of `session`
    pub fn capture(session: &Session, config_digest: &str) -> Self {
        let project = session.registry().project();
        let services = session
            .instances()
            .map(|instance| ServiceSnapshot {
                name: instance.name().to_string(),
                state: instance.state(),
                restarts: instance.restarts(),
                container_name: instance.spec().container_name(project),
                container_id: instance.container().map(|c| c.id),
                last_error: instance.last_error(),
            })
            .collect();

        Self {
            session_id: session.id(),
            project: project.to_string(),
            pid: std::process::id(),
            config_digest: config_digest.to_string(),
            started_at: session.started_at(),
            updated_at: Utc::now(),
            services,
        }
    }

    /// Snapshot file of `project` under `state_dir`
    pub fn path(state_dir: &Path, project: &str) -> PathBuf {
        state_dir.join(format!("{}.json", project))
    }

    /// Write the snapshot, replacing any previous one atomically
    pub fn save(&self, state_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(state_dir)?;

        let path = Self::path(state_dir, &self.project);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Read the snapshot of `project`, if one exists
    pub fn load(state_dir: &Path, project: &str) -> Result<Option<Self>> {
        match std::fs::read(Self::path(state_dir, project)) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the snapshot of `project`
    pub fn remove(state_dir: &Path, project: &str) -> Result<()> {
        match std::fs::remove_file(Self::path(state_dir, project)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the process that wrote this snapshot is still running
    pub fn supervisor_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return false;
        }
        process_alive(self.pid)
    }

    /// Ask the supervising process to tear the session down
    pub fn signal_supervisor(&self) -> Result<()> {
        signal(self.pid, libc::SIGTERM)
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn signal(pid: u32, signal: i32) -> Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let result = unsafe { libc::kill(pid, signal) };
    if result < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(())
    }
}
