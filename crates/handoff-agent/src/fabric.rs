//! The network fabric as a capability.
//!
//! The orchestrator only needs namespace allocation, release, and
//! namespace-scoped execution; expressing those as a trait keeps the
//! netlink/iptables machinery behind a seam the tests can fake.

use async_trait::async_trait;

use handoff_fabric::{Fabric, FabricError, NetNamespace};

/// Namespace operations the migration machinery relies on.
#[async_trait]
pub trait NetFabric: Send + Sync {
    /// Allocate a namespace plumbed to the bridge.
    async fn build_netns(&self) -> Result<NetNamespace, FabricError>;

    /// Tear down a namespace's veth pair and return its address.
    async fn release_netns(&self, ns: NetNamespace) -> Result<(), FabricError>;

    /// Build a fresh namespace and launch `command` detached inside it.
    async fn exec_in_netns(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<NetNamespace, FabricError>;

    /// Launch `command` detached inside an existing namespace.
    async fn exec_in_existing_netns(
        &self,
        ns: &NetNamespace,
        command: &str,
        args: &[String],
    ) -> Result<(), FabricError>;
}

#[async_trait]
impl NetFabric for Fabric {
    async fn build_netns(&self) -> Result<NetNamespace, FabricError> {
        Fabric::build_netns(self).await
    }

    async fn release_netns(&self, ns: NetNamespace) -> Result<(), FabricError> {
        Fabric::release_netns(self, ns).await
    }

    async fn exec_in_netns(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<NetNamespace, FabricError> {
        Fabric::exec_in_netns(self, command, args).await
    }

    async fn exec_in_existing_netns(
        &self,
        ns: &NetNamespace,
        command: &str,
        args: &[String],
    ) -> Result<(), FabricError> {
        Fabric::exec_in_existing_netns(self, ns, command, args).await
    }
}
