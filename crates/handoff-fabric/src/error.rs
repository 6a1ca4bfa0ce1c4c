use thiserror::Error;

/// Failures surfaced by the network fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Bridge, iptables, or CIDR setup failed; the fabric cannot be used.
    #[error("network fabric unavailable: {0}")]
    FabricUnavailable(String),

    /// The free-IP pool is empty.
    #[error("no more addresses left in the virtual network")]
    AddressExhausted,

    /// A netlink or namespace syscall failed while building a namespace.
    #[error("namespace setup failed: {0}")]
    NamespaceCreate(String),
}

impl FabricError {
    pub(crate) fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::FabricUnavailable(err.to_string())
    }

    pub(crate) fn namespace(err: impl std::fmt::Display) -> Self {
        Self::NamespaceCreate(err.to_string())
    }
}
