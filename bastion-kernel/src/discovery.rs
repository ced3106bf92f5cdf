/**
 * DISCOVERY - Controller side of the LAN discovery protocol
 *
 * ROLE: Finds agents without any configuration on their side.
 *
 * OPERATION:
 * - Every interval: DISCOVER broadcast to <broadcast>:<discovery port>,
 *   carrying the local UDP port agents must answer to
 * - Each valid ANNOUNCE refreshes the agent's session and makes sure a
 *   command link exists for it
 * - Every sweep: silent sessions go LOST, long-lost ones are removed
 *
 * Datagrams are untrusted: anything malformed or from another protocol
 * version is dropped with a debug log.
 */

use crate::channel::SharedChannelManager;
use crate::config::DiscoveryConf;
use crate::sessions::AnnounceOutcome;
use anyhow::{Context, Result};
use bastion_protocol::{DiscoveryMessage, MAX_DATAGRAM_LEN, PROTOCOL_VERSION};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use time::OffsetDateTime;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn bind_socket(reply_port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, reply_port))
        .await
        .with_context(|| format!("binding discovery socket on port {reply_port}"))?;
    socket.set_broadcast(true).context("enabling broadcast on discovery socket")?;
    Ok(socket)
}

/// Handle one datagram; returns the session endpoint an ANNOUNCE refers to
pub fn handle_datagram(bytes: &[u8], from: SocketAddr, channels: &SharedChannelManager) -> Option<SocketAddr> {
    let message = match DiscoveryMessage::decode(bytes) {
        Ok(message) => message,
        Err(e) => {
            debug!("[discovery] ignoring datagram from {}: {}", from, e);
            return None;
        }
    };
    if message.version() != PROTOCOL_VERSION {
        debug!("[discovery] ignoring version {} datagram from {}", message.version(), from);
        return None;
    }

    let DiscoveryMessage::Announce { device_id, hostname, command_port, .. } = message else {
        return None;
    };
    let IpAddr::V4(ip) = from.ip() else { return None };
    if command_port == 0 {
        debug!("[discovery] ignoring announce without command port from {}", from);
        return None;
    }

    let addr = SocketAddr::from((ip, command_port));
    match channels.sessions().record_announce(addr, &device_id, &hostname, OffsetDateTime::now_utc()) {
        AnnounceOutcome::New => info!("[discovery] new agent {} ({}) at {}", hostname, device_id, addr),
        AnnounceOutcome::Revived => info!("[discovery] agent {} back at {}", hostname, addr),
        AnnounceOutcome::Refreshed => debug!("[discovery] agent {} refreshed", addr),
    }
    channels.ensure_link(addr);
    Some(addr)
}

pub async fn run_discovery(
    socket: UdpSocket,
    conf: DiscoveryConf,
    channels: SharedChannelManager,
    cancel: CancellationToken,
) -> Result<()> {
    let reply_port = socket.local_addr().context("reading discovery socket address")?.port();
    let target = SocketAddr::from((conf.broadcast, conf.port));
    let probe = DiscoveryMessage::discover(reply_port).encode()?;
    info!(
        "[discovery] broadcasting to {} every {:?}, answers on port {}",
        target,
        conf.interval(),
        reply_port
    );

    let mut broadcast = interval(conf.interval());
    broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = interval(conf.sweep());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = [0u8; MAX_DATAGRAM_LEN + 1];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = broadcast.tick() => {
                if let Err(e) = socket.send_to(&probe, target).await {
                    warn!("[discovery] broadcast to {} failed: {}", target, e);
                }
            }
            _ = sweep.tick() => {
                channels.expire_sessions(OffsetDateTime::now_utc(), conf.session_timeout(), conf.grace());
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    handle_datagram(&buf[..len], from, &channels);
                }
                Err(e) => warn!("[discovery] receive failed: {}", e),
            },
        }
    }
    info!("[discovery] stopped");
    Ok(())
}
