//! Source-side migration orchestration.

use std::sync::Arc;

use chrono::Utc;

use crate::api::AgentContext;
use crate::checkpoint::{external_netns_descriptor, pack_image_dir, DumpRequest};
use crate::error::AgentError;
use crate::shadow::capture::{build_capture_filter, run_forwarder};
use crate::wire::{SlaveStartMigrationMessage, StartMigrationRequest};

/// Drive one process through the source-side migration lifecycle.
///
/// Exactly one migration may be in flight per PID; a concurrent second
/// request fails with [`AgentError::AlreadyMigrating`] and changes nothing.
/// Any abort removes the clock and, once shadowing has started, stops the
/// forwarder via the done signal.
pub async fn run_source_migration(
    ctx: Arc<AgentContext>,
    request: StartMigrationRequest,
) -> Result<(), AgentError> {
    let pid = request.pid;
    let process = ctx
        .registry
        .lookup(pid)
        .await
        .ok_or(AgentError::UnknownProcess(pid))?;

    ctx.clocks.begin_migration(pid)?;

    match drive(ctx.clone(), &request, process).await {
        Ok(()) => {
            ctx.clocks.end_migration(pid);
            ctx.registry.remove(pid).await;
            tracing::info!(
                "StartMigration(): migration of {pid} to {} complete",
                request.destination
            );
            Ok(())
        }
        Err(err) => {
            ctx.registry.signal_done(pid).await;
            ctx.clocks.end_migration(pid);
            Err(err)
        }
    }
}

async fn drive(
    ctx: Arc<AgentContext>,
    request: &StartMigrationRequest,
    process: crate::registry::Process,
) -> Result<(), AgentError> {
    let pid = process.pid;
    let (_done_tx, done_rx) = ctx.registry.attach_done_signal(pid).await?;

    // Inform the destination; its mirror of the clock starts from this
    // snapshot.
    let clock = ctx.clocks.tick_source(pid)?;
    let msg = SlaveStartMigrationMessage {
        clock,
        process: process.clone(),
    };
    ctx.transport.slave_start(&request.destination, &msg).await?;

    // Shadow ingress traffic for the checkpoint window. A capture failure
    // degrades the migration (arriving datagrams are lost) but does not
    // abort it.
    let filter = build_capture_filter(&process.tcp_ports, &process.udp_ports);
    match ctx.packet_sources.open(&ctx.config.iface, &filter) {
        Ok(source) => {
            tokio::spawn(run_forwarder(
                ctx.clone(),
                pid,
                request.destination.clone(),
                source,
                done_rx,
            ));
        }
        Err(err) => {
            tracing::warn!("StartMigration(): shadow capture unavailable for {pid}: {err}");
        }
    }

    // Dump while the process keeps running.
    let image_dir = ctx
        .config
        .work_dir
        .join(format!("{}-{pid}", Utc::now().timestamp()));
    tokio::fs::create_dir_all(&image_dir)
        .await
        .map_err(|err| AgentError::ArchiveFailure(format!("create image dir: {err}")))?;

    let dump = DumpRequest {
        pid,
        image_dir: image_dir.clone(),
        leave_running: true,
        shell_job: true,
        orphan_pts_master: true,
        external: vec![external_netns_descriptor(pid)?],
    };
    ctx.checkpointer.dump(&dump).await?;

    // Ship the image. Delivery is one-shot: a failed POST leaves the
    // destination without an image and is reported, not retried.
    let archive = tokio::task::spawn_blocking(move || pack_image_dir(&image_dir))
        .await
        .map_err(|err| AgentError::ArchiveFailure(format!("pack task failed: {err}")))??;
    if let Err(err) = ctx
        .transport
        .send_checkpoint(&request.destination, pid, &archive)
        .await
    {
        tracing::warn!(
            "StartMigration(): checkpoint delivery to {} failed, not retried: {err}",
            request.destination
        );
    }

    ctx.registry.signal_done(pid).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::Process;
    use crate::test_util::{harness, harness_with, FakeCheckpointer};

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    fn request(pid: i32) -> StartMigrationRequest {
        StartMigrationRequest {
            pid,
            destination: "peer:8080".to_string(),
            source: "self:8080".to_string(),
        }
    }

    #[tokio::test]
    async fn unregistered_pid_is_rejected_without_peer_contact() {
        let h = harness();
        let result = run_source_migration(h.ctx.clone(), request(12345)).await;
        assert!(matches!(result, Err(AgentError::UnknownProcess(12345))));
        assert!(h.transport.slave_starts().is_empty());
        assert_eq!(h.ctx.clocks.active_count(), 0);
    }

    #[tokio::test]
    async fn happy_path_informs_dumps_ships_and_tears_down() {
        let h = harness();
        let pid = own_pid();
        h.ctx
            .registry
            .register(Process::new(pid, vec![80], vec![5353]))
            .await
            .expect("register");

        run_source_migration(h.ctx.clone(), request(pid))
            .await
            .expect("migration succeeds");

        let informs = h.transport.slave_starts();
        assert_eq!(informs.len(), 1);
        let (destination, msg) = &informs[0];
        assert_eq!(destination, "peer:8080");
        assert_eq!(msg.clock.source_time, 1);
        assert_eq!(msg.process.tcp_ports, vec![80]);

        let shipped = h.transport.checkpoints();
        assert_eq!(shipped.len(), 1);
        assert_eq!(shipped[0].1, pid);
        assert!(shipped[0].2.to_string_lossy().ends_with(".tar.gz"));

        assert_eq!(h.ctx.clocks.active_count(), 0);
        assert!(h.ctx.registry.lookup(pid).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_second_start_is_rejected_and_changes_nothing() {
        let h = harness_with(FakeCheckpointer {
            delay: Duration::from_millis(100),
            ..FakeCheckpointer::default()
        });
        let pid = own_pid();
        h.ctx
            .registry
            .register(Process::new(pid, vec![80], vec![]))
            .await
            .expect("register");

        let first = tokio::spawn(run_source_migration(h.ctx.clone(), request(pid)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = run_source_migration(h.ctx.clone(), request(pid)).await;

        assert!(matches!(second, Err(AgentError::AlreadyMigrating(p)) if p == pid));
        first.await.expect("join").expect("first migration succeeds");
        assert_eq!(
            h.transport.slave_starts().len(),
            1,
            "the rejected start must not contact the destination"
        );
    }

    #[tokio::test]
    async fn inform_failure_aborts_with_clock_rolled_back() {
        let h = harness();
        h.transport.fail_slave_start();
        let pid = own_pid();
        h.ctx
            .registry
            .register(Process::new(pid, vec![], vec![53]))
            .await
            .expect("register");

        let result = run_source_migration(h.ctx.clone(), request(pid)).await;
        assert!(matches!(result, Err(AgentError::TransportFailure(_))));
        assert_eq!(h.ctx.clocks.active_count(), 0);
        assert!(h.transport.checkpoints().is_empty());
        // The process stays registered; only the migration was aborted.
        assert!(h.ctx.registry.lookup(pid).await.is_some());
    }

    #[tokio::test]
    async fn dump_failure_signals_forwarder_and_aborts() {
        let h = harness_with(FakeCheckpointer {
            fail: true,
            ..FakeCheckpointer::default()
        });
        let pid = own_pid();
        h.ctx
            .registry
            .register(Process::new(pid, vec![80], vec![]))
            .await
            .expect("register");

        let result = run_source_migration(h.ctx.clone(), request(pid)).await;
        assert!(matches!(result, Err(AgentError::Checkpoint(_))));
        assert_eq!(h.ctx.clocks.active_count(), 0);

        let mut done = h
            .ctx
            .registry
            .done_receiver(pid)
            .await
            .expect("done signal attached");
        assert!(*done.borrow_and_update(), "forwarder must be told to stop");
        assert!(h.transport.checkpoints().is_empty());
    }
}
