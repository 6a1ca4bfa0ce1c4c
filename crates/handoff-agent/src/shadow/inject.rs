//! Destination-side frame injection.
//!
//! Queued frames are decoded Ethernet → IPv4 → UDP and the payload is
//! replayed to the decoded destination over a fresh UDP socket per frame.
//! Frames that are not IPv4/UDP are skipped — TCP replay is not supported,
//! and one odd frame must not stall the rest of the inbox.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::api::AgentContext;

/// How often the injector checks the inbox for newly forwarded frames.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Decoded replay target of one captured frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpTarget {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub payload: Vec<u8>,
}

/// Decode a raw Ethernet frame down to its UDP destination and payload.
/// `None` for anything that is not IPv4 over Ethernet carrying UDP.
pub fn decode_udp_frame(frame: &[u8]) -> Option<UdpTarget> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;
    let ip = match sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => ipv4.header().destination_addr(),
        _ => return None,
    };
    match sliced.transport {
        Some(TransportSlice::Udp(udp)) => Some(UdpTarget {
            ip,
            port: udp.destination_port(),
            payload: udp.payload().to_vec(),
        }),
        _ => None,
    }
}

/// Replay one decoded datagram from an ephemeral socket.
async fn replay(target: &UdpTarget) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket
        .send_to(&target.payload, (target.ip, target.port))
        .await?;
    Ok(())
}

/// Inject a batch of captured frames, skipping whatever does not decode.
pub async fn inject_frames(frames: Vec<Vec<u8>>) {
    for frame in frames {
        let Some(target) = decode_udp_frame(&frame) else {
            continue;
        };
        if let Err(err) = replay(&target).await {
            tracing::warn!(
                "ForwardTraffic(): replay to {}:{} failed: {err}",
                target.ip,
                target.port
            );
        }
    }
}

/// Drain and replay a process's inbox until its done signal fires.
pub async fn run_injector(ctx: Arc<AgentContext>, pid: i32, mut done: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(DRAIN_INTERVAL);
    loop {
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let frames = ctx.registry.drain_inbox(pid).await;
                inject_frames(frames).await;
            }
        }
    }
    // Whatever arrived between the last drain and the signal still belongs
    // to the restored process.
    let frames = ctx.registry.drain_inbox(pid).await;
    inject_frames(frames).await;
    tracing::info!("frame injection for {pid} stopped");
}
