//! Registered migratable processes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::error::AgentError;

/// A registered migratable workload.
///
/// `done_signal` and `inbox` are runtime state and never cross the wire:
/// the signal stops this PID's shadow forwarding, and the inbox queues
/// captured frames awaiting injection on the destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Process {
    pub pid: i32,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    #[serde(skip)]
    pub done_signal: Option<Arc<watch::Sender<bool>>>,
    #[serde(skip)]
    pub inbox: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Process {
    pub fn new(pid: i32, tcp_ports: Vec<u16>, udp_ports: Vec<u16>) -> Self {
        Self {
            pid,
            tcp_ports,
            udp_ports,
            done_signal: None,
            inbox: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Concurrent map of locally known processes, keyed by PID.
pub struct ProcessRegistry {
    inner: RwLock<HashMap<i32, Process>>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a process that must exist on this host. Overwrites any
    /// prior record for the same PID.
    pub async fn register(&self, process: Process) -> Result<(), AgentError> {
        if !pid_exists(process.pid) {
            return Err(AgentError::UnknownProcess(process.pid));
        }
        let pid = process.pid;
        self.inner.write().await.insert(pid, process);
        tracing::info!("registered process {pid}");
        Ok(())
    }

    /// Store a record announced by a peer; the PID lives on the remote
    /// host, so no local existence check applies.
    pub async fn insert(&self, process: Process) {
        self.inner.write().await.insert(process.pid, process);
    }

    pub async fn lookup(&self, pid: i32) -> Option<Process> {
        self.inner.read().await.get(&pid).cloned()
    }

    pub async fn remove(&self, pid: i32) -> Option<Process> {
        self.inner.write().await.remove(&pid)
    }

    /// Attach a fresh single-shot done signal to a process and return the
    /// consumer end for its forwarding loop.
    pub async fn attach_done_signal(
        &self,
        pid: i32,
    ) -> Result<(Arc<watch::Sender<bool>>, watch::Receiver<bool>), AgentError> {
        let mut processes = self.inner.write().await;
        let process = processes
            .get_mut(&pid)
            .ok_or(AgentError::UnknownProcess(pid))?;
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        process.done_signal = Some(tx.clone());
        Ok((tx, rx))
    }

    /// Subscribe to a process's existing done signal.
    pub async fn done_receiver(&self, pid: i32) -> Option<watch::Receiver<bool>> {
        self.inner
            .read()
            .await
            .get(&pid)?
            .done_signal
            .as_ref()
            .map(|tx| tx.subscribe())
    }

    /// Fire a process's done signal; returns false when the process or its
    /// signal is unknown.
    pub async fn signal_done(&self, pid: i32) -> bool {
        match self.inner.read().await.get(&pid).and_then(|p| p.done_signal.clone()) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Queue a captured frame for later injection.
    pub async fn append_inbox(&self, pid: i32, frame: Vec<u8>) -> Result<(), AgentError> {
        let inbox = {
            let processes = self.inner.read().await;
            processes
                .get(&pid)
                .ok_or(AgentError::UnknownProcess(pid))?
                .inbox
                .clone()
        };
        inbox.lock().push(frame);
        Ok(())
    }

    /// Take every queued frame, leaving the inbox empty.
    pub async fn drain_inbox(&self, pid: i32) -> Vec<Vec<u8>> {
        let Some(inbox) = self
            .inner
            .read()
            .await
            .get(&pid)
            .map(|p| p.inbox.clone())
        else {
            return Vec::new();
        };
        let drained = std::mem::take(&mut *inbox.lock());
        drained
    }
}

/// Whether a PID currently exists on this host.
fn pid_exists(pid: i32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    #[tokio::test]
    async fn register_rejects_missing_pid() {
        let registry = ProcessRegistry::new();
        let result = registry.register(Process::new(i32::MAX, vec![], vec![])).await;
        assert!(matches!(result, Err(AgentError::UnknownProcess(_))));
        assert!(registry.lookup(i32::MAX).await.is_none());
    }

    #[tokio::test]
    async fn register_overwrites_existing_record() {
        let registry = ProcessRegistry::new();
        let pid = own_pid();
        registry
            .register(Process::new(pid, vec![80], vec![]))
            .await
            .expect("register");
        registry
            .register(Process::new(pid, vec![8080], vec![53]))
            .await
            .expect("re-register");

        let process = registry.lookup(pid).await.expect("registered");
        assert_eq!(process.tcp_ports, vec![8080]);
        assert_eq!(process.udp_ports, vec![53]);
    }

    #[tokio::test]
    async fn done_signal_reaches_subscribers() {
        let registry = ProcessRegistry::new();
        let pid = own_pid();
        registry
            .register(Process::new(pid, vec![], vec![]))
            .await
            .expect("register");

        let (_tx, mut rx) = registry.attach_done_signal(pid).await.expect("attach");
        assert!(!*rx.borrow());
        assert!(registry.signal_done(pid).await);
        rx.changed().await.expect("signal delivered");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn inbox_append_and_drain() {
        let registry = ProcessRegistry::new();
        registry.insert(Process::new(4242, vec![], vec![5000])).await;

        registry
            .append_inbox(4242, vec![1, 2, 3])
            .await
            .expect("append");
        registry
            .append_inbox(4242, vec![4, 5])
            .await
            .expect("append");

        let frames = registry.drain_inbox(4242).await;
        assert_eq!(frames, vec![vec![1, 2, 3], vec![4, 5]]);
        assert!(registry.drain_inbox(4242).await.is_empty());
    }

    #[tokio::test]
    async fn inbox_append_for_unknown_pid_fails() {
        let registry = ProcessRegistry::new();
        let result = registry.append_inbox(9999, vec![0]).await;
        assert!(matches!(result, Err(AgentError::UnknownProcess(9999))));
    }
}
