//! Discovery responder
//!
//! Listens for DISCOVER broadcasts and answers each valid one with an
//! ANNOUNCE sent to the controller's address and advertised reply port.
//! Anything else on the port is ignored.

use crate::identity::AgentIdentity;
use anyhow::{Context, Result};
use bastion_protocol::{DiscoveryMessage, MAX_DATAGRAM_LEN, PROTOCOL_VERSION};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn bind_socket(port: u16) -> Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("Failed to bind discovery port {}", port))
}

/// Where to send the ANNOUNCE for this datagram, if it deserves one
pub fn answer(bytes: &[u8], from: SocketAddr) -> Option<SocketAddr> {
    match DiscoveryMessage::decode(bytes) {
        Ok(DiscoveryMessage::Discover { version, reply_port }) if version == PROTOCOL_VERSION && reply_port != 0 => {
            Some(SocketAddr::new(from.ip(), reply_port))
        }
        Ok(other) => {
            debug!("Ignoring {:?} from {}", other, from);
            None
        }
        Err(e) => {
            debug!("Ignoring datagram from {}: {}", from, e);
            None
        }
    }
}

pub async fn run_responder(
    socket: UdpSocket,
    identity: AgentIdentity,
    command_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let announce = DiscoveryMessage::announce(&identity.device_id, &identity.hostname, command_port)
        .encode()
        .context("Failed to encode announce")?;
    info!(
        "Discovery responder on {}, announcing command port {}",
        socket.local_addr()?,
        command_port
    );

    let mut buf = [0u8; MAX_DATAGRAM_LEN + 1];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Discovery receive failed: {}", e);
                        continue;
                    }
                };
                if let Some(reply_to) = answer(&buf[..len], from) {
                    match socket.send_to(&announce, reply_to).await {
                        Ok(_) => debug!("Announced to {}", reply_to),
                        Err(e) => warn!("Announce to {} failed: {}", reply_to, e),
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity() -> AgentIdentity {
        AgentIdentity { device_id: "a1b2c3d4e5f6".into(), hostname: "pi-gw".into(), primary_mac: None }
    }

    #[test]
    fn test_answer_only_valid_discover() {
        let from: SocketAddr = "192.168.1.10:5555".parse().unwrap();
        let discover = DiscoveryMessage::discover(40000).encode().unwrap();
        assert_eq!(answer(&discover, from), Some("192.168.1.10:40000".parse().unwrap()));

        let old = br#"{"type":"DISCOVER","version":0,"reply_port":40000}"#;
        assert_eq!(answer(old, from), None);
        assert_eq!(answer(b"DISCOVER_PI", from), None);
        let echo = DiscoveryMessage::announce("x", "y", 1).encode().unwrap();
        assert_eq!(answer(&echo, from), None);
        let no_port = DiscoveryMessage::discover(0).encode().unwrap();
        assert_eq!(answer(&no_port, from), None);
    }

    #[tokio::test]
    async fn test_responder_announces() {
        let socket = bind_socket(0).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_responder(socket, identity(), 10000, cancel.clone()));

        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply_port = controller.local_addr().unwrap().port();
        let discover = DiscoveryMessage::discover(reply_port).encode().unwrap();
        controller.send_to(&discover, ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), controller.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            DiscoveryMessage::decode(&buf[..len]).unwrap(),
            DiscoveryMessage::announce("a1b2c3d4e5f6", "pi-gw", 10000)
        );

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
