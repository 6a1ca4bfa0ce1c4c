//! HTTP control surface and shared agent state.

mod error;
mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;

use handoff_fabric::NetNamespace;

use crate::checkpoint::{Checkpointer, CriuCheckpointer};
use crate::clock::ClockStore;
use crate::config::AgentConfig;
use crate::fabric::NetFabric;
use crate::peer::{HttpPeerClient, MigrationTransport};
use crate::registry::ProcessRegistry;
use crate::shadow::{PacketSourceFactory, PcapSourceFactory};

pub use error::ApiError;

/// Process-wide agent state, passed explicitly to every handler and task.
pub struct AgentContext {
    pub config: AgentConfig,
    pub registry: ProcessRegistry,
    pub clocks: ClockStore,
    pub fabric: Arc<dyn NetFabric>,
    pub transport: Arc<dyn MigrationTransport>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub packet_sources: Arc<dyn PacketSourceFactory>,
    /// Namespaces prepared for inbound migrations, keyed by PID; consumed
    /// at cut-over.
    pub prepared: Mutex<HashMap<i32, NetNamespace>>,
}

impl AgentContext {
    /// Production wiring: HTTP peer transport, the criu binary, and live
    /// pcap capture.
    pub fn new(config: AgentConfig, fabric: Arc<dyn NetFabric>) -> Arc<Self> {
        Self::with_parts(
            config,
            fabric,
            Arc::new(HttpPeerClient::default()),
            Arc::new(CriuCheckpointer::default()),
            Arc::new(PcapSourceFactory),
        )
    }

    pub fn with_parts(
        config: AgentConfig,
        fabric: Arc<dyn NetFabric>,
        transport: Arc<dyn MigrationTransport>,
        checkpointer: Arc<dyn Checkpointer>,
        packet_sources: Arc<dyn PacketSourceFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: ProcessRegistry::new(),
            clocks: ClockStore::new(),
            fabric,
            transport,
            checkpointer,
            packet_sources,
            prepared: Mutex::new(HashMap::new()),
        })
    }
}

/// The agent's control API. All migration endpoints are POST-only; axum
/// answers other methods with 405.
pub fn build_router(ctx: Arc<AgentContext>) -> Router {
    Router::new()
        .route("/RegisterProcess", post(handlers::register_process))
        .route("/StartMigration", post(handlers::start_migration))
        .route("/SlaveStartMigration", post(handlers::slave_start_migration))
        .route("/ForwardTraffic", post(handlers::forward_traffic))
        .route("/Checkpoints", post(handlers::receive_checkpoint))
        .route("/FinishRestore", post(handlers::finish_restore))
        .route("/healthz", get(handlers::healthz))
        .with_state(ctx)
}
