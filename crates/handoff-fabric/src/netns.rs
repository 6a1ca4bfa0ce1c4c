//! Namespace handles and the thread-pinned switch discipline.
//!
//! Network namespace membership is per-OS-thread kernel state. Any code in
//! this crate that switches namespaces runs inside `spawn_blocking` (one
//! dedicated thread for the whole window) and holds a [`NetnsGuard`], whose
//! `Drop` returns the thread to the namespace it started in even when the
//! switch body panics.

use std::fs::File;
use std::net::Ipv4Addr;
use std::os::fd::AsFd;

use nix::sched::{setns, unshare, CloneFlags};

use crate::error::FabricError;

const SELF_NETNS: &str = "/proc/self/ns/net";

/// Handle to one per-process network namespace built by the fabric.
///
/// The open file descriptor keeps the namespace alive and is what restore
/// helpers are moved into. Ownership follows the migration: the handle is
/// held until cut-over, then passed back to [`crate::Fabric::release_netns`].
#[derive(Debug)]
pub struct NetNamespace {
    /// Open descriptor for the namespace itself.
    pub file: File,
    /// Address assigned to `eth0` inside the namespace.
    pub ip: Ipv4Addr,
    /// Number of the veth pair serving this namespace.
    pub veth_id: u64,
    /// Name of the bridge-side veth peer (`brveth<N>`), still in the host
    /// namespace; deleting it tears down the pair.
    pub bridge_peer: String,
}

impl NetNamespace {
    /// Duplicate the namespace descriptor, e.g. to hand it to a pinned
    /// thread while the caller keeps the original.
    pub fn try_clone_file(&self) -> Result<File, FabricError> {
        self.file.try_clone().map_err(FabricError::namespace)
    }
}

/// Open the calling thread's current network namespace.
pub(crate) fn current_netns() -> Result<File, FabricError> {
    File::open(SELF_NETNS).map_err(FabricError::namespace)
}

/// RAII guard holding the namespace the thread must end up in.
pub(crate) struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    /// Save the current namespace, then unshare into a brand new one.
    /// Returns the guard and an open handle to the new namespace.
    pub(crate) fn enter_new() -> Result<(Self, File), FabricError> {
        let original = current_netns()?;
        unshare(CloneFlags::CLONE_NEWNET).map_err(FabricError::namespace)?;
        let created = current_netns()?;
        Ok((Self { original }, created))
    }

    /// Save the current namespace, then switch to an existing one.
    pub(crate) fn enter(target: &File) -> Result<Self, FabricError> {
        let original = current_netns()?;
        setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(FabricError::namespace)?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(err) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            // Nothing sane can be done here; the thread is a blocking-pool
            // worker and must not be reused while in a foreign namespace.
            tracing::error!("failed to restore original network namespace: {err}");
        }
    }
}
