//! Shadow traffic plane: mirror live ingress from the source host to the
//! destination during the checkpoint window, and replay it into the
//! restored process's network.

pub mod capture;
pub mod inject;

pub use capture::{
    build_capture_filter, CaptureError, PacketSource, PacketSourceFactory, PcapSourceFactory,
};
