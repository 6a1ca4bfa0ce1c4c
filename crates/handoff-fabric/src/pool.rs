//! Free-address accounting for the virtual network.
//!
//! The pool is seeded with every host address of the bridge CIDR (network
//! and broadcast excluded) and hands them out FIFO. The veth counter lives
//! under the same lock so an address reservation and its pair number are
//! allocated atomically.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::error::FabricError;

/// One successful draw from the pool: the namespace address and the number
/// used to name its veth pair (`hveth<N>`/`brveth<N>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub ip: Ipv4Addr,
    pub veth_id: u64,
}

struct PoolState {
    free: VecDeque<Ipv4Addr>,
    veth_counter: u64,
}

/// FIFO pool of free namespace addresses plus the monotone veth counter.
pub struct AddressPool {
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Seed the pool from a CIDR's host addresses.
    pub fn new(net: Ipv4Net) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: net.hosts().collect(),
                veth_counter: 0,
            }),
        }
    }

    /// Draw the next free address and veth number.
    pub fn reserve(&self) -> Result<Reservation, FabricError> {
        let mut state = self.state.lock();
        let ip = state.free.pop_front().ok_or(FabricError::AddressExhausted)?;
        state.veth_counter += 1;
        Ok(Reservation {
            ip,
            veth_id: state.veth_counter,
        })
    }

    /// Return an address to the pool, e.g. when namespace construction
    /// failed partway or a migration released its namespace at cut-over.
    /// The veth counter is never rewound.
    pub fn release(&self, ip: Ipv4Addr) {
        self.state.lock().free.push_back(ip);
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> AddressPool {
        AddressPool::new(cidr.parse().expect("valid test cidr"))
    }

    #[test]
    fn slash_30_holds_two_hosts() {
        let pool = pool("10.0.0.0/30");
        assert_eq!(pool.free_count(), 2);

        let first = pool.reserve().expect("first draw");
        let second = pool.reserve().expect("second draw");
        assert_eq!(first.ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(second.ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(first.veth_id, 1);
        assert_eq!(second.veth_id, 2);

        assert!(matches!(
            pool.reserve(),
            Err(FabricError::AddressExhausted)
        ));
    }

    #[test]
    fn release_returns_address_without_rewinding_counter() {
        let pool = pool("10.0.0.0/30");
        let first = pool.reserve().expect("first draw");
        pool.reserve().expect("second draw");
        pool.release(first.ip);

        let third = pool.reserve().expect("released address is reusable");
        assert_eq!(third.ip, first.ip);
        assert_eq!(third.veth_id, 3);
    }

    #[test]
    fn pool_and_issued_addresses_partition_the_host_set() {
        let pool = pool("192.168.7.0/29");
        let hosts: Vec<Ipv4Addr> = "192.168.7.0/29"
            .parse::<Ipv4Net>()
            .expect("cidr")
            .hosts()
            .collect();
        assert_eq!(pool.free_count(), hosts.len());

        let mut issued = Vec::new();
        for _ in 0..3 {
            issued.push(pool.reserve().expect("draw").ip);
        }
        assert_eq!(pool.free_count() + issued.len(), hosts.len());
        for ip in &issued {
            assert!(hosts.contains(ip));
        }
    }

    #[test]
    fn network_and_broadcast_are_never_pooled() {
        let pool = pool("10.1.2.0/24");
        let mut seen = Vec::new();
        while let Ok(reservation) = pool.reserve() {
            seen.push(reservation.ip);
        }
        assert_eq!(seen.len(), 254);
        assert!(!seen.contains(&Ipv4Addr::new(10, 1, 2, 0)));
        assert!(!seen.contains(&Ipv4Addr::new(10, 1, 2, 255)));
    }
}
