//! Bridge lifecycle and namespace construction.

use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::route::RouteScope;
use rtnetlink::Handle;

use crate::error::FabricError;
use crate::netns::{NetNamespace, NetnsGuard};
use crate::nsexec;
use crate::pool::AddressPool;

/// Name of the shared L2 bridge all namespace veth peers attach to.
pub const BRIDGE_NAME: &str = "handoff-bridge";

/// MTU assigned to both ends of every veth pair.
pub const VETH_MTU: u32 = 1500;

/// Handle to the host's virtual network fabric.
///
/// Created once at startup by [`Fabric::ensure_bridge`]; owns the host-side
/// netlink connection, the bridge identity, and the free-address pool.
pub struct Fabric {
    handle: Handle,
    runtime: tokio::runtime::Handle,
    bridge_index: u32,
    bridge_addr: Ipv4Addr,
    cidr: Ipv4Net,
    pool: AddressPool,
}

impl Fabric {
    /// Make the bridge and its NAT glue exist. Idempotent: an existing
    /// bridge, rule, or address is left as-is.
    ///
    /// Installs `nat/POSTROUTING -s <cidr> -j MASQUERADE` (append-unique)
    /// and sets the `filter/FORWARD` policy to ACCEPT, creates the bridge
    /// if absent, brings it up, and assigns it the first host address of
    /// the CIDR. The address stays in the free pool; the pool is the full
    /// host set of the CIDR.
    pub async fn ensure_bridge(cidr: &str) -> Result<Self, FabricError> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|err| FabricError::FabricUnavailable(format!("bad CIDR {cidr}: {err}")))?;

        install_nat_rules(cidr).await?;

        let (connection, handle, _) = rtnetlink::new_connection().map_err(FabricError::unavailable)?;
        let runtime = tokio::runtime::Handle::current();
        runtime.spawn(connection);

        let bridge_index = match link_index(&handle, BRIDGE_NAME).await {
            Some(index) => index,
            None => {
                handle
                    .link()
                    .add()
                    .bridge(BRIDGE_NAME.to_string())
                    .execute()
                    .await
                    .map_err(FabricError::unavailable)?;
                link_index(&handle, BRIDGE_NAME).await.ok_or_else(|| {
                    FabricError::FabricUnavailable("bridge missing after creation".to_string())
                })?
            }
        };

        handle
            .link()
            .set(bridge_index)
            .up()
            .execute()
            .await
            .map_err(FabricError::unavailable)?;

        let bridge_addr = net.hosts().next().ok_or(FabricError::AddressExhausted)?;
        if let Err(err) = handle
            .address()
            .add(bridge_index, IpAddr::V4(bridge_addr), net.prefix_len())
            .execute()
            .await
        {
            // Re-running against an already-addressed bridge is fine.
            tracing::debug!("bridge address add skipped: {err}");
        }

        tracing::info!("bridge {BRIDGE_NAME} up at {bridge_addr}/{}", net.prefix_len());

        Ok(Self {
            handle,
            runtime,
            bridge_index,
            bridge_addr,
            cidr: net,
            pool: AddressPool::new(net),
        })
    }

    /// Allocate a new network namespace plumbed to the bridge.
    ///
    /// Reserves an address, creates the `hveth<N>`/`brveth<N>` pair,
    /// enslaves the bridge-side peer, moves the other end into a freshly
    /// unshared namespace, and configures it there: renamed to `eth0`,
    /// addressed `<ip>/32`, a link-scope route to the bridge CIDR, a
    /// default route via the bridge address, and loopback up.
    ///
    /// On any intermediate failure the reserved address goes back to the
    /// pool and created links are deleted.
    pub async fn build_netns(&self) -> Result<NetNamespace, FabricError> {
        let reservation = self.pool.reserve()?;
        let host_name = format!("hveth{}", reservation.veth_id);
        let peer_name = format!("brveth{}", reservation.veth_id);

        match self
            .build_netns_inner(reservation.ip, &host_name, &peer_name)
            .await
        {
            Ok(file) => Ok(NetNamespace {
                file,
                ip: reservation.ip,
                veth_id: reservation.veth_id,
                bridge_peer: peer_name,
            }),
            Err(err) => {
                // Deleting either end of the pair removes both; the peer is
                // the end guaranteed to still be in the host namespace.
                if let Some(index) = link_index(&self.handle, &peer_name).await {
                    if let Err(del_err) = self.handle.link().del(index).execute().await {
                        tracing::warn!("teardown of {peer_name} failed: {del_err}");
                    }
                }
                self.pool.release(reservation.ip);
                Err(err)
            }
        }
    }

    async fn build_netns_inner(
        &self,
        ip: Ipv4Addr,
        host_name: &str,
        peer_name: &str,
    ) -> Result<File, FabricError> {
        self.handle
            .link()
            .add()
            .veth(host_name.to_string(), peer_name.to_string())
            .execute()
            .await
            .map_err(FabricError::namespace)?;

        let host_index = link_index(&self.handle, host_name)
            .await
            .ok_or_else(|| FabricError::NamespaceCreate(format!("{host_name} not found")))?;
        let peer_index = link_index(&self.handle, peer_name)
            .await
            .ok_or_else(|| FabricError::NamespaceCreate(format!("{peer_name} not found")))?;

        for index in [host_index, peer_index] {
            self.handle
                .link()
                .set(index)
                .mtu(VETH_MTU)
                .execute()
                .await
                .map_err(FabricError::namespace)?;
        }

        self.handle
            .link()
            .set(peer_index)
            .controller(self.bridge_index)
            .execute()
            .await
            .map_err(FabricError::namespace)?;
        self.handle
            .link()
            .set(peer_index)
            .up()
            .execute()
            .await
            .map_err(FabricError::namespace)?;

        // The switch window: unshare into the new namespace on a pinned
        // blocking thread, open a handle to it, and create the netlink
        // socket that will configure it. A netlink socket stays bound to
        // the namespace it was created in, so configuration can continue
        // from async context after the thread has unwound back.
        let runtime = self.runtime.clone();
        let (ns_file, ns_handle) = tokio::task::spawn_blocking(move || {
            let (_guard, created) = NetnsGuard::enter_new()?;
            let (connection, handle, _) =
                rtnetlink::new_connection().map_err(FabricError::namespace)?;
            runtime.spawn(connection);
            Ok::<_, FabricError>((created, handle))
        })
        .await
        .map_err(|err| FabricError::NamespaceCreate(format!("switch task failed: {err}")))??;

        self.handle
            .link()
            .set(host_index)
            .setns_by_fd(ns_file.as_raw_fd())
            .execute()
            .await
            .map_err(FabricError::namespace)?;

        self.configure_inside(&ns_handle, host_name, ip).await?;
        Ok(ns_file)
    }

    async fn configure_inside(
        &self,
        ns_handle: &Handle,
        host_name: &str,
        ip: Ipv4Addr,
    ) -> Result<(), FabricError> {
        let eth_index = link_index(ns_handle, host_name)
            .await
            .ok_or_else(|| FabricError::NamespaceCreate(format!("{host_name} missing in netns")))?;

        ns_handle
            .link()
            .set(eth_index)
            .name("eth0".to_string())
            .execute()
            .await
            .map_err(FabricError::namespace)?;
        ns_handle
            .link()
            .set(eth_index)
            .up()
            .execute()
            .await
            .map_err(FabricError::namespace)?;
        ns_handle
            .address()
            .add(eth_index, IpAddr::V4(ip), 32)
            .execute()
            .await
            .map_err(FabricError::namespace)?;

        // Link-scope route to the bridge network, then default via the
        // bridge address.
        ns_handle
            .route()
            .add()
            .v4()
            .destination_prefix(self.cidr.network(), self.cidr.prefix_len())
            .output_interface(eth_index)
            .scope(RouteScope::Link)
            .execute()
            .await
            .map_err(FabricError::namespace)?;
        ns_handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .output_interface(eth_index)
            .gateway(self.bridge_addr)
            .execute()
            .await
            .map_err(FabricError::namespace)?;

        let lo_index = link_index(ns_handle, "lo")
            .await
            .ok_or_else(|| FabricError::NamespaceCreate("loopback missing in netns".to_string()))?;
        ns_handle
            .address()
            .add(lo_index, IpAddr::V4(Ipv4Addr::LOCALHOST), 8)
            .execute()
            .await
            .map_err(FabricError::namespace)?;
        ns_handle
            .link()
            .set(lo_index)
            .up()
            .execute()
            .await
            .map_err(FabricError::namespace)?;

        Ok(())
    }

    /// Release a namespace at cut-over: delete its veth pair and return its
    /// address to the pool. The namespace itself disappears once no process
    /// or descriptor holds it open.
    pub async fn release_netns(&self, ns: NetNamespace) -> Result<(), FabricError> {
        if let Some(index) = link_index(&self.handle, &ns.bridge_peer).await {
            self.handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(FabricError::unavailable)?;
        }
        self.pool.release(ns.ip);
        Ok(())
    }

    /// Build a fresh namespace and launch `command` detached inside it.
    /// Returns the namespace handle; the caller owns it until cut-over.
    pub async fn exec_in_netns(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<NetNamespace, FabricError> {
        let ns = self.build_netns().await?;
        self.exec_in_existing_netns(&ns, command, args).await?;
        Ok(ns)
    }

    /// Launch `command` detached inside an already-built namespace.
    pub async fn exec_in_existing_netns(
        &self,
        ns: &NetNamespace,
        command: &str,
        args: &[String],
    ) -> Result<(), FabricError> {
        nsexec::exec_in_opened_netns(ns.try_clone_file()?, command.to_string(), args.to_vec())
            .await
    }
}

/// Resolve a link name to its interface index; `None` when absent.
async fn link_index(handle: &Handle, name: &str) -> Option<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Some(link.header.index),
        _ => None,
    }
}

/// Masquerade egress from the virtual network and allow forwarding. The
/// iptables binding is synchronous, so this runs on the blocking pool.
async fn install_nat_rules(cidr: &str) -> Result<(), FabricError> {
    let cidr = cidr.to_string();
    tokio::task::spawn_blocking(move || {
        let table = iptables::new(false).map_err(|err| err.to_string())?;
        table
            .append_unique("nat", "POSTROUTING", &format!("-s {cidr} -j MASQUERADE"))
            .map_err(|err| err.to_string())?;
        table
            .set_policy("filter", "FORWARD", "ACCEPT")
            .map_err(|err| err.to_string())?;
        Ok::<_, String>(())
    })
    .await
    .map_err(|err| FabricError::FabricUnavailable(format!("iptables task failed: {err}")))?
    .map_err(FabricError::FabricUnavailable)
}
