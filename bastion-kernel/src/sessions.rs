/**
 * SESSION TABLE - Devices found by discovery and the state of their channel
 *
 * ROLE: One DeviceSession per agent endpoint (agent ip : command port).
 * Written by discovery (announce / expiry) and by each device's link task
 * (connection state); read by the HTTP API and the dispatcher.
 *
 * Connection transitions carry the epoch of the link task that owns the
 * session; a task replaced by a newer link can no longer touch it.
 *
 * LIFECYCLE:
 *   ANNOUNCE -> DISCOVERED -> CONNECTING -> CONNECTED
 *   any state -> LOST (channel error, retries exhausted, discovery timeout)
 *   LOST + ANNOUNCE -> DISCOVERED ; LOST past the grace period -> removed
 */

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Discovered,
    Connecting,
    Connected,
    Lost,
}

#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub device_id: SocketAddr,
    /// Identity the agent reports (MAC-derived)
    pub agent_id: String,
    pub hostname: String,
    pub state: SessionState,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
    pub lost_since: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    /// Epoch of the link task currently driving this session
    pub link_epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    New,
    /// Was LOST, back to DISCOVERED
    Revived,
    Refreshed,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// Sessions that just became LOST; their links must be closed
    pub lost: Vec<SocketAddr>,
    pub removed: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub discovered: usize,
    pub connecting: usize,
    pub connected: usize,
    pub lost: usize,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SocketAddr, DeviceSession>>,
}

pub type SharedSessionTable = Arc<SessionTable>;

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_announce(
        &self,
        addr: SocketAddr,
        agent_id: &str,
        hostname: &str,
        now: OffsetDateTime,
    ) -> AnnounceOutcome {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&addr) {
            Some(session) => {
                session.last_seen = now;
                session.agent_id = agent_id.to_string();
                session.hostname = hostname.to_string();
                if session.state == SessionState::Lost {
                    session.state = SessionState::Discovered;
                    session.lost_since = None;
                    AnnounceOutcome::Revived
                } else {
                    AnnounceOutcome::Refreshed
                }
            }
            None => {
                sessions.insert(
                    addr,
                    DeviceSession {
                        device_id: addr,
                        agent_id: agent_id.to_string(),
                        hostname: hostname.to_string(),
                        state: SessionState::Discovered,
                        first_seen: now,
                        last_seen: now,
                        lost_since: None,
                        last_error: None,
                        link_epoch: 0,
                    },
                );
                AnnounceOutcome::New
            }
        }
    }

    /// Hand the session to a new link task; returns the epoch that task must present
    pub fn claim_link(&self, addr: SocketAddr) -> Option<u64> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&addr)?;
        session.link_epoch += 1;
        Some(session.link_epoch)
    }

    /// DISCOVERED or CONNECTING (retry) -> CONNECTING
    pub fn mark_connecting(&self, addr: SocketAddr, epoch: u64) -> bool {
        self.transition(addr, epoch, |session| {
            matches!(session.state, SessionState::Discovered | SessionState::Connecting)
                .then_some(SessionState::Connecting)
        })
    }

    /// CONNECTING -> CONNECTED
    pub fn mark_connected(&self, addr: SocketAddr, epoch: u64) -> bool {
        self.transition(addr, epoch, |session| {
            if session.state != SessionState::Connecting {
                return None;
            }
            session.last_error = None;
            Some(SessionState::Connected)
        })
    }

    /// Any state -> LOST. `lost_since` keeps the first time it was lost.
    pub fn mark_lost(&self, addr: SocketAddr, epoch: u64, reason: &str, now: OffsetDateTime) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(&addr) else { return false };
        if session.link_epoch != epoch {
            debug!("[sessions] {} ignoring loss from stale link {}: {}", addr, epoch, reason);
            return false;
        }
        if session.state != SessionState::Lost {
            info!("[sessions] {} lost: {}", addr, reason);
            session.state = SessionState::Lost;
            session.lost_since = Some(now);
        }
        session.last_error = Some(reason.to_string());
        true
    }

    fn transition<F>(&self, addr: SocketAddr, epoch: u64, next: F) -> bool
    where
        F: FnOnce(&mut DeviceSession) -> Option<SessionState>,
    {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(&addr) else { return false };
        if session.link_epoch != epoch {
            return false;
        }
        match next(&mut *session) {
            Some(state) => {
                debug!("[sessions] {} {:?} -> {:?}", addr, session.state, state);
                session.state = state;
                true
            }
            None => false,
        }
    }

    /// Sessions silent for longer than `timeout` become LOST; sessions LOST for
    /// longer than `grace` are dropped.
    pub fn expire(&self, now: OffsetDateTime, timeout: Duration, grace: Duration) -> Expired {
        let mut expired = Expired::default();
        let mut sessions = self.sessions.write();
        for (addr, session) in sessions.iter_mut() {
            if session.state != SessionState::Lost && now - session.last_seen > timeout {
                info!("[sessions] {} ({}) silent since {}", addr, session.hostname, session.last_seen);
                session.state = SessionState::Lost;
                session.lost_since = Some(now);
                session.last_error = Some("discovery timeout".into());
                expired.lost.push(*addr);
            }
        }
        sessions.retain(|addr, session| {
            let keep = !matches!(session.lost_since, Some(since) if now - since > grace);
            if !keep {
                info!("[sessions] removing {} ({})", addr, session.hostname);
                expired.removed.push(*addr);
            }
            keep
        });
        expired.lost.sort();
        expired.removed.sort();
        expired
    }

    pub fn get(&self, addr: SocketAddr) -> Option<DeviceSession> {
        self.sessions.read().get(&addr).cloned()
    }

    pub fn snapshot(&self) -> Vec<DeviceSession> {
        let mut list: Vec<DeviceSession> = self.sessions.read().values().cloned().collect();
        list.sort_by_key(|s| s.device_id);
        list
    }

    /// Endpoint of the connected session for a device address
    pub fn connected_addr_for(&self, ip: Ipv4Addr) -> Option<SocketAddr> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.device_id.ip() == ip && s.state == SessionState::Connected)
            .map(|s| s.device_id)
            .min()
    }

    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for session in self.sessions.read().values() {
            match session.state {
                SessionState::Discovered => counts.discovered += 1,
                SessionState::Connecting => counts.connecting += 1,
                SessionState::Connected => counts.connected += 1,
                SessionState::Lost => counts.lost += 1,
            }
        }
        counts
    }
}
