//! Detached command execution inside a network namespace.
//!
//! The original namespace is bind-mounted to a unique save path before
//! switching, so the thread can re-enter it even if its descriptor is gone;
//! the save mount is removed once the thread is back home.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::mount::{mount, umount, MsFlags};
use nix::sched::{setns, CloneFlags};
use uuid::Uuid;

use crate::error::FabricError;

const SELF_NETNS: &str = "/proc/self/ns/net";

/// Spawn `command` with inherited stdio inside the namespace behind
/// `ns_file`, without waiting for it. The calling task's thread state is
/// untouched; the switch happens on a pinned blocking thread that is
/// restored to its original namespace on every exit path.
pub(crate) async fn exec_in_opened_netns(
    ns_file: File,
    command: String,
    args: Vec<String>,
) -> Result<(), FabricError> {
    tokio::task::spawn_blocking(move || exec_pinned(&ns_file, &command, &args))
        .await
        .map_err(|err| FabricError::NamespaceCreate(format!("exec task failed: {err}")))?
}

fn exec_pinned(ns_file: &File, command: &str, args: &[String]) -> Result<(), FabricError> {
    let save_path = PathBuf::from(format!("./ns-{}", Uuid::new_v4()));
    File::create(&save_path).map_err(FabricError::namespace)?;
    if let Err(err) = mount(
        Some(Path::new(SELF_NETNS)),
        &save_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    ) {
        let _ = std::fs::remove_file(&save_path);
        return Err(FabricError::namespace(err));
    }

    // From here on the guard re-enters the saved namespace and removes the
    // save mount no matter how this function exits.
    let _restore = SavedNetns { path: save_path };

    setns(ns_file, CloneFlags::CLONE_NEWNET).map_err(FabricError::namespace)?;

    Command::new(command)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map(|_child| ())
        .map_err(|err| FabricError::NamespaceCreate(format!("spawn {command}: {err}")))
}

struct SavedNetns {
    path: PathBuf,
}

impl Drop for SavedNetns {
    fn drop(&mut self) {
        match File::open(&self.path) {
            Ok(saved) => {
                if let Err(err) = setns(&saved, CloneFlags::CLONE_NEWNET) {
                    tracing::error!("failed to re-enter saved network namespace: {err}");
                }
            }
            Err(err) => tracing::error!("saved network namespace unreadable: {err}"),
        }
        if let Err(err) = umount(self.path.as_path()) {
            tracing::warn!("failed to unmount namespace save point: {err}");
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove namespace save point: {err}");
        }
    }
}
