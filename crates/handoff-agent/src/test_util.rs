//! Shared fakes for the seams of the agent: fabric, peer transport,
//! checkpointer, and packet source.

use std::collections::VecDeque;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use handoff_fabric::{FabricError, NetNamespace};

use crate::api::AgentContext;
use crate::checkpoint::{CheckpointError, Checkpointer, DumpRequest};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::fabric::NetFabric;
use crate::peer::MigrationTransport;
use crate::shadow::{CaptureError, PacketSource, PacketSourceFactory};
use crate::wire::{ShadowTrafficMessage, SlaveStartMigrationMessage};

/// Records peer traffic instead of sending it.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    slave_starts: Mutex<Vec<(String, SlaveStartMigrationMessage)>>,
    forwarded: Mutex<Vec<ShadowTrafficMessage>>,
    checkpoints: Mutex<Vec<(String, i32, PathBuf)>>,
    fail_slave_start: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn fail_slave_start(&self) {
        self.fail_slave_start.store(true, Ordering::SeqCst);
    }

    pub(crate) fn slave_starts(&self) -> Vec<(String, SlaveStartMigrationMessage)> {
        self.slave_starts.lock().clone()
    }

    pub(crate) fn forwarded(&self) -> Vec<ShadowTrafficMessage> {
        self.forwarded.lock().clone()
    }

    pub(crate) fn checkpoints(&self) -> Vec<(String, i32, PathBuf)> {
        self.checkpoints.lock().clone()
    }

    pub(crate) async fn wait_for_forwarded(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.forwarded.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("forwarded frames arrive in time");
    }
}

#[async_trait]
impl MigrationTransport for RecordingTransport {
    async fn slave_start(
        &self,
        destination: &str,
        msg: &SlaveStartMigrationMessage,
    ) -> Result<(), AgentError> {
        if self.fail_slave_start.load(Ordering::SeqCst) {
            return Err(AgentError::TransportFailure("connection refused".to_string()));
        }
        self.slave_starts
            .lock()
            .push((destination.to_string(), msg.clone()));
        Ok(())
    }

    async fn forward_traffic(
        &self,
        _destination: &str,
        msg: &ShadowTrafficMessage,
    ) -> Result<(), AgentError> {
        self.forwarded.lock().push(msg.clone());
        Ok(())
    }

    async fn send_checkpoint(
        &self,
        destination: &str,
        pid: i32,
        archive: &Path,
    ) -> Result<(), AgentError> {
        self.checkpoints
            .lock()
            .push((destination.to_string(), pid, archive.to_path_buf()));
        Ok(())
    }
}

/// Checkpointer that produces a marker image instead of a real dump.
#[derive(Default)]
pub(crate) struct FakeCheckpointer {
    pub fail: bool,
    pub delay: Duration,
}

#[async_trait]
impl Checkpointer for FakeCheckpointer {
    async fn dump(&self, request: &DumpRequest) -> Result<(), CheckpointError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(CheckpointError("fake dump failure".to_string()));
        }
        std::fs::write(request.image_dir.join("core-1.img"), b"fake image")
            .map_err(|err| CheckpointError(err.to_string()))?;
        Ok(())
    }
}

/// Fabric that fabricates namespace handles without touching the kernel.
#[derive(Default)]
pub(crate) struct FakeFabric {
    built: AtomicU64,
    released: Mutex<Vec<String>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeFabric {
    fn make_netns(&self) -> Result<NetNamespace, FabricError> {
        let id = self.built.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NetNamespace {
            file: File::open("/proc/self/ns/net")
                .map_err(|err| FabricError::NamespaceCreate(err.to_string()))?,
            ip: Ipv4Addr::new(172, 31, 0, id as u8),
            veth_id: id,
            bridge_peer: format!("brveth{id}"),
        })
    }

    pub(crate) fn built_count(&self) -> u64 {
        self.built.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    pub(crate) fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.execs.lock().clone()
    }
}

#[async_trait]
impl NetFabric for FakeFabric {
    async fn build_netns(&self) -> Result<NetNamespace, FabricError> {
        self.make_netns()
    }

    async fn release_netns(&self, ns: NetNamespace) -> Result<(), FabricError> {
        self.released.lock().push(ns.bridge_peer);
        Ok(())
    }

    async fn exec_in_netns(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<NetNamespace, FabricError> {
        let ns = self.make_netns()?;
        self.execs
            .lock()
            .push((command.to_string(), args.to_vec()));
        Ok(ns)
    }

    async fn exec_in_existing_netns(
        &self,
        _ns: &NetNamespace,
        command: &str,
        args: &[String],
    ) -> Result<(), FabricError> {
        self.execs
            .lock()
            .push((command.to_string(), args.to_vec()));
        Ok(())
    }
}

/// Packet source fed from a fixed frame list; quiet afterwards.
pub(crate) struct QueuedSource {
    frames: VecDeque<Vec<u8>>,
}

impl QueuedSource {
    pub(crate) fn new(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl PacketSource for QueuedSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => {
                // Emulate the capture read timeout on a quiet interface.
                std::thread::sleep(Duration::from_millis(5));
                Ok(None)
            }
        }
    }
}

pub(crate) struct QuietSourceFactory;

impl PacketSourceFactory for QuietSourceFactory {
    fn open(&self, _iface: &str, _filter: &str) -> Result<Box<dyn PacketSource>, CaptureError> {
        Ok(Box::new(QueuedSource::new(Vec::new())))
    }
}

pub(crate) struct TestHarness {
    pub ctx: Arc<AgentContext>,
    pub transport: Arc<RecordingTransport>,
    pub fabric: Arc<FakeFabric>,
}

pub(crate) fn harness() -> TestHarness {
    harness_with(FakeCheckpointer::default())
}

pub(crate) fn harness_with(checkpointer: FakeCheckpointer) -> TestHarness {
    let work_dir =
        std::env::temp_dir().join(format!("handoff-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&work_dir).expect("test work dir");

    let transport = Arc::new(RecordingTransport::default());
    let fabric = Arc::new(FakeFabric::default());
    let config = AgentConfig::new("eth0", 8080, "172.31.0.0/24").with_work_dir(work_dir);
    let ctx = AgentContext::with_parts(
        config,
        fabric.clone(),
        transport.clone(),
        Arc::new(checkpointer),
        Arc::new(QuietSourceFactory),
    );
    TestHarness {
        ctx,
        transport,
        fabric,
    }
}

pub(crate) fn test_context() -> (Arc<AgentContext>, Arc<RecordingTransport>) {
    let h = harness();
    (h.ctx, h.transport)
}
