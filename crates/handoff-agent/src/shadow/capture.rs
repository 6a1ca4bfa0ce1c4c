//! Source-side capture and forwarding.
//!
//! A BPF filter scoped to the migrating process's ports keeps the capture
//! handle from seeing unrelated traffic. Captured frames flow through an
//! ordered channel from the (blocking) capture thread to an async loop
//! that stamps each one with a clock snapshot and POSTs it to the
//! destination. Individual POST failures are logged and skipped so
//! forwarding latency stays bounded; the loop ends when the done signal
//! fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::api::AgentContext;
use crate::wire::ShadowTrafficMessage;

/// Snap length for the live capture handle; comfortably above the veth MTU.
const SNAPLEN: i32 = 1600;

/// Read timeout so a quiet interface still lets the capture loop observe
/// cancellation.
const READ_TIMEOUT_MS: i32 = 250;

/// Frames in flight between the capture thread and the forward loop.
const FORWARD_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
#[error("packet capture failed: {0}")]
pub struct CaptureError(pub String);

/// Opaque source of captured Ethernet frames.
///
/// `next_frame` returns `Ok(None)` on a read timeout so callers can poll
/// cancellation between reads.
pub trait PacketSource: Send {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;
}

/// Opens a [`PacketSource`] for one migration.
pub trait PacketSourceFactory: Send + Sync {
    fn open(&self, iface: &str, filter: &str) -> Result<Box<dyn PacketSource>, CaptureError>;
}

/// Build the BPF filter matching a process's declared ports: one
/// `tcp dst port <p>` / `udp dst port <p>` term per port, joined by `or`.
/// Empty port sets yield an empty filter, which matches everything.
pub fn build_capture_filter(tcp_ports: &[u16], udp_ports: &[u16]) -> String {
    tcp_ports
        .iter()
        .map(|port| format!("tcp dst port {port}"))
        .chain(udp_ports.iter().map(|port| format!("udp dst port {port}")))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Live pcap capture on the public interface.
pub struct PcapSource {
    capture: pcap::Capture<pcap::Active>,
}

impl PcapSource {
    pub fn open(iface: &str, filter: &str) -> Result<Self, CaptureError> {
        let mut capture = pcap::Capture::from_device(iface)
            .map_err(|err| CaptureError(format!("open {iface}: {err}")))?
            .promisc(true)
            .snaplen(SNAPLEN)
            .immediate_mode(true)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|err| CaptureError(format!("activate {iface}: {err}")))?;
        capture
            .filter(filter, true)
            .map_err(|err| CaptureError(format!("install filter {filter:?}: {err}")))?;
        Ok(Self { capture })
    }
}

impl PacketSource for PcapSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(packet.data.to_vec())),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(err) => Err(CaptureError(err.to_string())),
        }
    }
}

#[derive(Default)]
pub struct PcapSourceFactory;

impl PacketSourceFactory for PcapSourceFactory {
    fn open(&self, iface: &str, filter: &str) -> Result<Box<dyn PacketSource>, CaptureError> {
        Ok(Box::new(PcapSource::open(iface, filter)?))
    }
}

/// Mirror captured frames for `pid` to `destination` until the done signal
/// fires. Never fails fatally.
pub async fn run_forwarder(
    ctx: Arc<AgentContext>,
    pid: i32,
    destination: String,
    source: Box<dyn PacketSource>,
    mut done: watch::Receiver<bool>,
) {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(FORWARD_QUEUE_DEPTH);
    let stop = Arc::new(AtomicBool::new(false));
    let capture_stop = stop.clone();
    let capture_done = done.clone();
    let capture = tokio::task::spawn_blocking(move || {
        capture_loop(source, frame_tx, capture_done, capture_stop)
    });

    loop {
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    break;
                }
            }
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                // Clock tick and snapshot are one atomic step; losing the
                // clock means the migration ended under us.
                let Ok(clock) = ctx.clocks.tick_source(pid) else { break };
                let msg = ShadowTrafficMessage { clock, frame, pid };
                if let Err(err) = ctx.transport.forward_traffic(&destination, &msg).await {
                    tracing::warn!("ForwardTraffic(): send to {destination} failed: {err}");
                }
            }
        }
    }

    // The stop flag covers a quiet interface; the dropped receiver covers
    // a capture thread blocked on a full queue.
    stop.store(true, Ordering::SeqCst);
    drop(frame_rx);
    if let Err(err) = capture.await {
        tracing::warn!("ForwardTraffic(): capture thread panicked: {err}");
    }
    tracing::info!("shadow forwarding for {pid} stopped");
}

fn capture_loop(
    mut source: Box<dyn PacketSource>,
    frames: mpsc::Sender<Vec<u8>>,
    done: watch::Receiver<bool>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if *done.borrow() || stop.load(Ordering::SeqCst) {
            return;
        }
        match source.next_frame() {
            Ok(Some(frame)) => {
                if frames.blocking_send(frame).is_err() {
                    return;
                }
            }
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!("ForwardTraffic(): capture read failed: {err}");
                return;
            }
        }
    }
}
