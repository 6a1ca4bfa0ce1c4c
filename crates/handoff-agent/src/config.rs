use std::path::PathBuf;

/// Agent-wide settings resolved from the command line.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Public-facing interface shadow traffic is captured on.
    pub iface: String,
    /// Control API listen port.
    pub port: u16,
    /// CIDR block of the virtual network behind the bridge.
    pub network_cidr: String,
    /// Directory checkpoint images, archives, and restore trees live under.
    pub work_dir: PathBuf,
}

impl AgentConfig {
    pub fn new(iface: impl Into<String>, port: u16, network_cidr: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            port,
            network_cidr: network_cidr.into(),
            work_dir: PathBuf::from("."),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}
