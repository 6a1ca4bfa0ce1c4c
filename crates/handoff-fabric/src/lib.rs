//! Per-host virtual network fabric for live process migration.
//!
//! Every restored process gets a stable L3 identity that is independent of
//! the host it lands on: a dedicated network namespace, a veth pair whose
//! bridge-side peer hangs off the shared `handoff-bridge`, an address drawn
//! from the operator-supplied CIDR, and NATed egress via iptables.
//!
//! [`Fabric::ensure_bridge`] makes the bridge and NAT rules exist (it is
//! idempotent and is run once at agent startup); [`Fabric::build_netns`]
//! allocates and plumbs one namespace; [`Fabric::exec_in_netns`] runs a
//! helper command inside one. Namespace switches are kernel state of the
//! calling OS thread, so every switch window in this crate runs on a pinned
//! blocking thread and unwinds back to the original namespace on all exit
//! paths.

mod error;
mod fabric;
mod netns;
mod nsexec;
mod pool;

pub use error::FabricError;
pub use fabric::{Fabric, BRIDGE_NAME, VETH_MTU};
pub use netns::NetNamespace;
pub use pool::{AddressPool, Reservation};
