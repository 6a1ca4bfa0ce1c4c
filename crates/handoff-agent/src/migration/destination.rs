//! Destination-side migration handling: mirror state, receive and restore
//! the checkpoint, inject shadowed traffic, and cut over.

use std::path::PathBuf;
use std::sync::Arc;

use crate::api::AgentContext;
use crate::checkpoint::{single_entry, unpack_archive};
use crate::error::AgentError;
use crate::shadow::inject::run_injector;
use crate::wire::SlaveStartMigrationMessage;

/// Helper script that performs the actual restore inside the namespace.
const RESTORE_HELPER: &str = "./restore.sh";

/// Handle a source's migration announcement: store the mirrored process
/// and clock, and prepare the network namespace the restored process will
/// live in so frames can be injected once it runs.
pub async fn prepare_destination(ctx: Arc<AgentContext>, msg: SlaveStartMigrationMessage) {
    let pid = msg.process.pid;
    ctx.registry.insert(msg.process).await;
    if let Err(err) = ctx.registry.attach_done_signal(pid).await {
        tracing::error!("SlaveStartMigration(): {err}");
        return;
    }
    ctx.clocks.insert_mirror(pid, msg.clock);
    tracing::info!("SlaveStartMigration(): migration for {pid} started");

    match ctx.fabric.build_netns().await {
        Ok(ns) => {
            ctx.prepared.lock().insert(pid, ns);
        }
        Err(err) => {
            tracing::error!("SlaveStartMigration(): netns preparation for {pid} failed: {err}");
        }
    }
}

/// Unpack a received checkpoint archive and restore it inside the prepared
/// namespace, then start injecting queued frames.
pub async fn restore_from_archive(
    ctx: Arc<AgentContext>,
    pid: i32,
    archive_path: PathBuf,
) -> Result<(), AgentError> {
    let restore_dir = ctx.config.work_dir.join(format!("{pid}-restore"));
    {
        let archive_path = archive_path.clone();
        let restore_dir = restore_dir.clone();
        tokio::task::spawn_blocking(move || unpack_archive(&archive_path, &restore_dir))
            .await
            .map_err(|err| AgentError::ArchiveFailure(format!("unpack task failed: {err}")))??;
    }
    let image_dir = single_entry(&restore_dir)?;
    let image_arg = vec![image_dir.display().to_string()];

    // The namespace leaves the map only for the duration of the restore
    // call; cut-over needs it back to release resources.
    let prepared = ctx.prepared.lock().remove(&pid);
    match prepared {
        Some(ns) => {
            let result = ctx
                .fabric
                .exec_in_existing_netns(&ns, RESTORE_HELPER, &image_arg)
                .await;
            ctx.prepared.lock().insert(pid, ns);
            result?;
        }
        None => {
            tracing::warn!("ReceiveCheckpoint(): no prepared namespace for {pid}, building one");
            let ns = ctx.fabric.exec_in_netns(RESTORE_HELPER, &image_arg).await?;
            ctx.prepared.lock().insert(pid, ns);
        }
    }

    match ctx.registry.done_receiver(pid).await {
        Some(done) => {
            tokio::spawn(run_injector(ctx.clone(), pid, done));
        }
        None => {
            tracing::warn!("ReceiveCheckpoint(): no done signal for {pid}, injector not started");
        }
    }
    Ok(())
}

/// Cut-over: stop shadow forwarding and injection for `pid` and release
/// the resources its migration held.
pub async fn finish_restore(ctx: Arc<AgentContext>, pid: i32) -> Result<(), AgentError> {
    if ctx.clocks.snapshot(pid).is_none() {
        return Err(AgentError::UnknownMigration(pid));
    }

    ctx.registry.signal_done(pid).await;
    ctx.clocks.end_migration(pid);
    ctx.registry.remove(pid).await;

    let prepared = ctx.prepared.lock().remove(&pid);
    if let Some(ns) = prepared {
        ctx.fabric.release_netns(ns).await?;
    }
    Ok(())
}
