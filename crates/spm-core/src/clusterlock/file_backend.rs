//! File-backed lease daemon binding.
//!
//! Resource leases are advisory `flock` locks on per-offset lock files next
//! to the leases volume, so separate processes (and separate instances in
//! one process) exclude each other. Lockspace membership is tracked in
//! memory. Used for development deployments and tests.

use std::{
    collections::{HashMap, HashSet},
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::Duration,
};

use fs2::FileExt;
use tokio::sync::Mutex;

use super::lease_daemon::{DaemonResult, LeaseDaemon, LeaseDaemonError, LeaseDisk, LeaseHandle};
use crate::ids::HostId;

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    clients: HashSet<LeaseHandle>,
    lockspaces: HashMap<String, HashSet<HostId>>,
    held: HashMap<PathBuf, Held>,
}

#[derive(Debug)]
struct Held {
    handle: LeaseHandle,
    file: File,
}

#[derive(Debug, Default)]
pub struct FileLeaseDaemon {
    state: Mutex<State>,
}

impl FileLeaseDaemon {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a daemon restart: every client handle becomes invalid and
    /// every resource lease is dropped. Lockspace membership survives.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.clients.clear();
        for (path, held) in state.held.drain() {
            if let Err(e) = held.file.unlock() {
                tracing::debug!("Unlock of {} failed: {e}", path.display());
            }
        }
        tracing::debug!("Lease daemon connections dropped");
    }

    /// Lock file standing in for the lease at `disk`.
    #[must_use]
    pub fn lock_path(disk: &LeaseDisk, resource: &str) -> PathBuf {
        let stem = disk
            .path
            .file_name()
            .map_or_else(|| "leases".into(), |n| n.to_string_lossy().into_owned());
        disk.path
            .with_file_name(format!("{stem}.{resource}.{}.lock", disk.offset))
    }
}

fn io_error(context: &str, path: &Path, err: &std::io::Error) -> LeaseDaemonError {
    LeaseDaemonError::Io(format!("{context} {}: {err}", path.display()))
}

fn touch(path: &Path) -> DaemonResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error("cannot create", parent, &e))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| io_error("cannot open", path, &e))
}

#[async_trait::async_trait]
impl LeaseDaemon for FileLeaseDaemon {
    async fn register(&self) -> DaemonResult<LeaseHandle> {
        let mut state = self.state.lock().await;
        state.next_handle += 1;
        let handle = LeaseHandle::new(state.next_handle);
        state.clients.insert(handle);
        Ok(handle)
    }

    async fn write_lockspace(
        &self,
        _lockspace: &str,
        disk: &LeaseDisk,
        _io_timeout: Duration,
    ) -> DaemonResult<()> {
        touch(&disk.path).map(drop)
    }

    async fn write_resource(
        &self,
        _lockspace: &str,
        _resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()> {
        touch(&disk.path).map(drop)
    }

    async fn add_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        _disk: &LeaseDisk,
        _wait: bool,
    ) -> DaemonResult<()> {
        let mut state = self.state.lock().await;
        let members = state.lockspaces.entry(lockspace.to_string()).or_default();
        if members.insert(host_id) {
            Ok(())
        } else {
            Err(LeaseDaemonError::AlreadyExists)
        }
    }

    async fn rem_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        _disk: &LeaseDisk,
        _wait: bool,
        _unused: bool,
    ) -> DaemonResult<()> {
        let mut state = self.state.lock().await;
        let removed = state
            .lockspaces
            .get_mut(lockspace)
            .is_some_and(|members| members.remove(&host_id));
        if removed {
            Ok(())
        } else {
            Err(LeaseDaemonError::NotFound)
        }
    }

    async fn inq_lockspace(
        &self,
        lockspace: &str,
        host_id: HostId,
        _disk: &LeaseDisk,
    ) -> DaemonResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .lockspaces
            .get(lockspace)
            .is_some_and(|members| members.contains(&host_id)))
    }

    async fn acquire(
        &self,
        handle: LeaseHandle,
        lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()> {
        let mut state = self.state.lock().await;
        if !state.clients.contains(&handle) {
            return Err(LeaseDaemonError::Disconnected);
        }
        if state.lockspaces.get(lockspace).map_or(true, HashSet::is_empty) {
            return Err(LeaseDaemonError::NotFound);
        }

        let path = Self::lock_path(disk, resource);
        match state.held.get(&path) {
            Some(held) if held.handle == handle => return Ok(()),
            Some(_) => return Err(LeaseDaemonError::Conflict),
            None => {}
        }

        let file = touch(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                state.held.insert(path, Held { handle, file });
                Ok(())
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LeaseDaemonError::Conflict)
            }
            Err(e) => Err(io_error("cannot lock", &path, &e)),
        }
    }

    async fn release(
        &self,
        handle: LeaseHandle,
        _lockspace: &str,
        resource: &str,
        disk: &LeaseDisk,
    ) -> DaemonResult<()> {
        let mut state = self.state.lock().await;
        if !state.clients.contains(&handle) {
            return Err(LeaseDaemonError::Disconnected);
        }
        let path = Self::lock_path(disk, resource);
        match state.held.get(&path) {
            Some(held) if held.handle == handle => {}
            _ => return Err(LeaseDaemonError::NotFound),
        }
        if let Some(held) = state.held.remove(&path) {
            held.file
                .unlock()
                .map_err(|e| io_error("cannot unlock", &path, &e))?;
        }
        Ok(())
    }
}
