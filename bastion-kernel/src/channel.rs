/**
 * COMMAND CHANNEL - One persistent TCP link per discovered device
 *
 * ROLE:
 * Carries compiled command texts to the agent and its results back.
 * Each device gets its own link task, so a slow or broken device never
 * stalls another one.
 *
 * LINK TASK:
 * - CONNECTING: connect with a timeout; failures back off exponentially
 *   (initial, doubled, capped) for at most `max_attempts`, then LOST
 * - CONNECTED: batches from the queue are written one frame per command in
 *   queue order; a reader task forwards result frames, matched FIFO
 * - Reset, I/O error, peer close or cancellation: session -> LOST, every
 *   command sent but unanswered or still queued resolves to DeliveryUnknown
 *
 * A LOST link task exits; only a fresh ANNOUNCE starts a new one. Each task
 * holds the session epoch it was started with, so a closed task that wakes
 * late cannot mark a revived session LOST.
 */

use crate::config::ChannelConf;
use crate::sessions::{SessionCounts, SharedSessionTable};
use bastion_protocol::{read_frame, write_frame, CommandResult, FailureReason, ResultStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub queue_depth: usize,
}

impl From<&ChannelConf> for ChannelSettings {
    fn from(conf: &ChannelConf) -> Self {
        Self {
            connect_timeout: Duration::from_millis(conf.connect_timeout_ms),
            initial_backoff: Duration::from_millis(conf.initial_backoff_ms),
            max_backoff: Duration::from_millis(conf.max_backoff_ms.max(conf.initial_backoff_ms)),
            max_attempts: conf.max_attempts.max(1),
            queue_depth: conf.queue_depth.max(1),
        }
    }
}

/// What the kernel knows about one delivered command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Applied { exit_code: Option<i32>, detail: String },
    /// Refused by the agent's validator, never executed
    Rejected { detail: String },
    Failed { reason: FailureReason, exit_code: Option<i32>, detail: String },
    /// Sent (or queued) but the link went away before a result arrived
    DeliveryUnknown { reason: String },
}

impl From<CommandResult> for DeliveryOutcome {
    fn from(result: CommandResult) -> Self {
        match (result.status, result.reason) {
            (ResultStatus::Ok, _) => DeliveryOutcome::Applied { exit_code: result.exit_code, detail: result.detail },
            (ResultStatus::Error, Some(FailureReason::InvalidCommand)) => {
                DeliveryOutcome::Rejected { detail: result.detail }
            }
            (ResultStatus::Error, reason) => DeliveryOutcome::Failed {
                reason: reason.unwrap_or(FailureReason::ExecutionFailed),
                exit_code: result.exit_code,
                detail: result.detail,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("device {0} has no connected session")]
    NotConnected(Ipv4Addr),
    #[error("command queue for {0} is closed")]
    QueueClosed(SocketAddr),
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::NotConnected(_) => "not_connected",
            TransportError::QueueClosed(_) => "queue_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub applied: u64,
    pub rejected: u64,
    pub failed: u64,
    pub unknown: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    applied: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    unknown: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Applied { .. } => &self.applied,
            DeliveryOutcome::Rejected { .. } => &self.rejected,
            DeliveryOutcome::Failed { .. } => &self.failed,
            DeliveryOutcome::DeliveryUnknown { .. } => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}

struct Pending {
    raw_text: String,
    reply: oneshot::Sender<DeliveryOutcome>,
}

impl Pending {
    fn resolve(self, outcome: DeliveryOutcome) {
        let _ = self.reply.send(outcome);
    }

    fn unknown(self, reason: &str) {
        self.resolve(DeliveryOutcome::DeliveryUnknown { reason: reason.to_string() });
    }
}

/// Commands of one dispatch call; written back to back
struct Batch {
    items: Vec<Pending>,
}

struct DeviceLink {
    sender: mpsc::Sender<Batch>,
    cancel: CancellationToken,
}

pub struct ChannelManager {
    sessions: SharedSessionTable,
    links: Mutex<HashMap<SocketAddr, DeviceLink>>,
    settings: ChannelSettings,
    shutdown: CancellationToken,
    counters: Counters,
}

pub type SharedChannelManager = Arc<ChannelManager>;

impl ChannelManager {
    pub fn new(sessions: SharedSessionTable, settings: ChannelSettings, shutdown: CancellationToken) -> Self {
        Self {
            sessions,
            links: Mutex::new(HashMap::new()),
            settings,
            shutdown,
            counters: Counters::default(),
        }
    }

    pub fn sessions(&self) -> &SharedSessionTable {
        &self.sessions
    }

    /// Start a link task for `addr` unless a live one exists or the session is
    /// unknown. Returns true if started.
    pub fn ensure_link(&self, addr: SocketAddr) -> bool {
        let mut links = self.links.lock();
        if let Some(link) = links.get(&addr) {
            if !link.sender.is_closed() {
                return false;
            }
        }
        let Some(epoch) = self.sessions.claim_link(addr) else {
            debug!("[channel] no session for {}, not linking", addr);
            return false;
        };
        let (sender, receiver) = mpsc::channel(self.settings.queue_depth);
        let cancel = self.shutdown.child_token();
        tokio::spawn(run_link(
            addr,
            epoch,
            self.sessions.clone(),
            self.settings.clone(),
            receiver,
            cancel.clone(),
        ));
        links.insert(addr, DeviceLink { sender, cancel });
        true
    }

    /// Cancel the link for `addr`; its pending commands resolve to DeliveryUnknown
    pub fn close(&self, addr: SocketAddr) {
        if let Some(link) = self.links.lock().remove(&addr) {
            debug!("[channel] closing link {}", addr);
            link.cancel.cancel();
        }
    }

    /// Run session expiry and close the links of sessions that went LOST or were removed
    pub fn expire_sessions(&self, now: OffsetDateTime, timeout: time::Duration, grace: time::Duration) {
        let expired = self.sessions.expire(now, timeout, grace);
        for addr in expired.lost.iter().chain(expired.removed.iter()) {
            self.close(*addr);
        }
    }

    pub fn session_counts(&self) -> SessionCounts {
        self.sessions.counts()
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Send `commands` to the connected session of `target`, in order, and
    /// wait for one outcome per command.
    pub async fn dispatch(&self, target: Ipv4Addr, commands: &[String]) -> Result<Vec<DeliveryOutcome>, TransportError> {
        let addr = self
            .sessions
            .connected_addr_for(target)
            .ok_or(TransportError::NotConnected(target))?;
        let sender = self
            .links
            .lock()
            .get(&addr)
            .map(|link| link.sender.clone())
            .ok_or(TransportError::NotConnected(target))?;

        let mut receivers = Vec::with_capacity(commands.len());
        let mut items = Vec::with_capacity(commands.len());
        for raw_text in commands {
            let (reply, rx) = oneshot::channel();
            items.push(Pending { raw_text: raw_text.clone(), reply });
            receivers.push(rx);
        }
        sender
            .send(Batch { items })
            .await
            .map_err(|_| TransportError::QueueClosed(addr))?;
        self.counters.dispatched.fetch_add(commands.len() as u64, Ordering::Relaxed);

        let mut outcomes = Vec::with_capacity(receivers.len());
        for rx in receivers {
            let outcome = rx.await.unwrap_or_else(|_| DeliveryOutcome::DeliveryUnknown {
                reason: "link dropped".into(),
            });
            self.counters.record(&outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

async fn run_link(
    addr: SocketAddr,
    epoch: u64,
    sessions: SharedSessionTable,
    settings: ChannelSettings,
    mut queue: mpsc::Receiver<Batch>,
    cancel: CancellationToken,
) {
    let mut delay = settings.initial_backoff;
    let mut attempt = 0u32;

    let stream = loop {
        if !sessions.mark_connecting(addr, epoch) {
            debug!("[channel] {} no longer awaiting a connection", addr);
            drain_queue(&mut queue, "session not active");
            return;
        }
        attempt += 1;

        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                drain_queue(&mut queue, "session closed");
                return;
            }
            result = timeout(settings.connect_timeout, TcpStream::connect(addr)) => result,
        };
        match connected {
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) => warn!("[channel] connect {} failed (attempt {}/{}): {}", addr, attempt, settings.max_attempts, e),
            Err(_) => warn!("[channel] connect {} timed out (attempt {}/{})", addr, attempt, settings.max_attempts),
        }

        if attempt >= settings.max_attempts {
            sessions.mark_lost(addr, epoch, "connect attempts exhausted", OffsetDateTime::now_utc());
            drain_queue(&mut queue, "connect attempts exhausted");
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                drain_queue(&mut queue, "session closed");
                return;
            }
            _ = sleep(delay) => {}
        }
        delay = (delay * 2).min(settings.max_backoff);
    };

    if !sessions.mark_connected(addr, epoch) {
        drain_queue(&mut queue, "session not active");
        return;
    }
    info!("[channel] connected to {}", addr);

    let reason = serve_connection(addr, stream, &mut queue, &cancel).await;
    sessions.mark_lost(addr, epoch, &reason, OffsetDateTime::now_utc());
    drain_queue(&mut queue, &reason);
}

async fn serve_connection(
    addr: SocketAddr,
    stream: TcpStream,
    queue: &mut mpsc::Receiver<Batch>,
    cancel: &CancellationToken,
) -> String {
    let (read_half, mut write_half) = stream.into_split();
    let (result_tx, mut results) = mpsc::channel(16);
    let reader = tokio::spawn(read_results(read_half, result_tx));
    let mut pending: VecDeque<Pending> = VecDeque::new();

    let reason = 'conn: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'conn "session closed".to_string(),
            batch = queue.recv() => {
                let Some(batch) = batch else { break 'conn "channel manager gone".to_string() };
                let mut items = batch.items.into_iter();
                while let Some(item) = items.next() {
                    let written = tokio::select! {
                        _ = cancel.cancelled() => Err("session closed".to_string()),
                        r = write_frame(&mut write_half, &item.raw_text) => r.map_err(|e| format!("write failed: {e}")),
                    };
                    if let Err(reason) = written {
                        pending.push_back(item);
                        items.by_ref().for_each(|rest| rest.unknown(&reason));
                        break 'conn reason;
                    }
                    debug!("[channel] sent to {}: {}", addr, item.raw_text);
                    pending.push_back(item);
                }
            }
            incoming = results.recv() => match incoming {
                Some(Ok(result)) => match pending.pop_front() {
                    Some(item) => item.resolve(DeliveryOutcome::from(result)),
                    None => break 'conn "result received with nothing pending".to_string(),
                },
                Some(Err(reason)) => break 'conn reason,
                None => break 'conn "reader stopped".to_string(),
            },
        }
    };

    reader.abort();
    if !pending.is_empty() {
        warn!("[channel] {}: {} command(s) unacknowledged: {}", addr, pending.len(), reason);
    }
    for item in pending.drain(..) {
        item.unknown(&reason);
    }
    reason
}

/// Forward result frames; a decode failure ends the stream since FIFO
/// correlation can no longer be trusted.
async fn read_results(mut read_half: OwnedReadHalf, results: mpsc::Sender<Result<CommandResult, String>>) {
    loop {
        let message = match read_frame(&mut read_half).await {
            Ok(Some(text)) => match CommandResult::decode(&text) {
                Ok(result) => Ok(result),
                Err(e) => Err(format!("malformed result: {e}")),
            },
            Ok(None) => Err("connection closed by agent".to_string()),
            Err(e) => Err(format!("read failed: {e}")),
        };
        let stop = message.is_err();
        if results.send(message).await.is_err() || stop {
            return;
        }
    }
}

fn drain_queue(queue: &mut mpsc::Receiver<Batch>, reason: &str) {
    queue.close();
    while let Ok(batch) = queue.try_recv() {
        for item in batch.items {
            item.unknown(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{AnnounceOutcome, SessionState, SessionTable};
    use bastion_protocol::{MockAgent, MockReply};

    fn fast_settings() -> ChannelSettings {
        ChannelSettings {
            connect_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            max_attempts: 3,
            queue_depth: 8,
        }
    }

    fn manager() -> ChannelManager {
        ChannelManager::new(Arc::new(SessionTable::new()), fast_settings(), CancellationToken::new())
    }

    fn announce(manager: &ChannelManager, addr: SocketAddr) {
        manager.sessions().record_announce(addr, "a1b2c3", "mock", OffsetDateTime::now_utc());
        assert!(manager.ensure_link(addr));
    }

    async fn wait_for_state(manager: &ChannelManager, addr: SocketAddr, state: SessionState) {
        let reached = timeout(Duration::from_secs(3), async {
            loop {
                if manager.sessions().get(addr).map(|s| s.state) == Some(state) {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "{addr} never reached {state:?}");
    }

    fn ip_of(addr: SocketAddr) -> Ipv4Addr {
        match addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => unreachable!(),
        }
    }

    fn commands(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_dispatch_in_order() {
        let agent = MockAgent::accepting().await.unwrap();
        let manager = manager();
        announce(&manager, agent.addr());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;

        let sent = commands(&[
            "iptables -A INPUT -p tcp --dport 22 -j REJECT",
            "iptables -A INPUT -p tcp --dport 23 -j REJECT",
            "iptables -A INPUT -j DROP",
        ]);
        let outcomes = manager.dispatch(ip_of(agent.addr()), &sent).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| matches!(o, DeliveryOutcome::Applied { exit_code: Some(0), .. })));
        assert_eq!(agent.received(), sent);
        assert_eq!(manager.stats().applied, 3);
        // a second ensure_link on a live link is a no-op
        assert!(!manager.ensure_link(agent.addr()));
        assert_eq!(agent.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_results_matched_fifo() {
        let agent = MockAgent::rejecting("--dport 23").await.unwrap();
        let manager = manager();
        announce(&manager, agent.addr());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;

        let sent = commands(&[
            "iptables -A INPUT -p tcp --dport 22 -j REJECT",
            "iptables -A INPUT -p tcp --dport 23 -j REJECT",
            "iptables -A INPUT -p tcp --dport 80 -j REJECT",
        ]);
        let outcomes = manager.dispatch(ip_of(agent.addr()), &sent).await.unwrap();
        assert!(matches!(outcomes[0], DeliveryOutcome::Applied { .. }));
        assert!(matches!(outcomes[1], DeliveryOutcome::Rejected { .. }));
        assert!(matches!(outcomes[2], DeliveryOutcome::Applied { .. }));
        // a rejection does not close the link
        assert_eq!(manager.sessions().get(agent.addr()).unwrap().state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_execution_failure_reported() {
        let agent = MockAgent::spawn(|_| {
            MockReply::Result(CommandResult::error(FailureReason::ExecutionFailed, Some(1), "iptables: No chain"))
        })
        .await
        .unwrap();
        let manager = manager();
        announce(&manager, agent.addr());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;

        let outcomes = manager
            .dispatch(ip_of(agent.addr()), &commands(&["iptables -A FORWARD -j DROP"]))
            .await
            .unwrap();
        assert_eq!(
            outcomes[0],
            DeliveryOutcome::Failed {
                reason: FailureReason::ExecutionFailed,
                exit_code: Some(1),
                detail: "iptables: No chain".into()
            }
        );
    }

    #[tokio::test]
    async fn test_discovery_timeout_resolves_pending_as_unknown() {
        let agent = MockAgent::spawn(|_| MockReply::Silent).await.unwrap();
        let manager = Arc::new(manager());
        announce(&manager, agent.addr());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;

        let dispatcher = {
            let manager = manager.clone();
            let ip = ip_of(agent.addr());
            tokio::spawn(async move {
                manager
                    .dispatch(ip, &commands(&["iptables -A INPUT -j DROP", "iptables -A OUTPUT -j DROP"]))
                    .await
            })
        };
        agent.wait_for_commands(2, Duration::from_secs(2)).await.unwrap();

        let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        manager.expire_sessions(later, time::Duration::seconds(20), time::Duration::hours(1));

        let outcomes = timeout(Duration::from_secs(2), dispatcher).await.unwrap().unwrap().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o, DeliveryOutcome::DeliveryUnknown { .. })));
        assert_eq!(manager.sessions().get(agent.addr()).unwrap().state, SessionState::Lost);
        assert_eq!(manager.stats().unknown, 2);
    }

    #[tokio::test]
    async fn test_announce_right_after_expiry_keeps_new_link() {
        let agent = MockAgent::accepting().await.unwrap();
        let manager = manager();
        announce(&manager, agent.addr());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;

        // no await in between: the closed task only wakes after the new link exists
        let later = OffsetDateTime::now_utc() + time::Duration::minutes(5);
        manager.expire_sessions(later, time::Duration::seconds(20), time::Duration::hours(1));
        let outcome = manager
            .sessions()
            .record_announce(agent.addr(), "a1b2c3", "mock", OffsetDateTime::now_utc());
        assert_eq!(outcome, AnnounceOutcome::Revived);
        assert!(manager.ensure_link(agent.addr()));

        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;
        sleep(Duration::from_millis(200)).await;
        let session = manager.sessions().get(agent.addr()).unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.last_error, None);

        let outcomes = manager
            .dispatch(ip_of(agent.addr()), &commands(&["iptables -A INPUT -j DROP"]))
            .await
            .unwrap();
        assert!(matches!(outcomes[0], DeliveryOutcome::Applied { .. }));
        assert_eq!(agent.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_peer_hangup_marks_lost() {
        let agent = MockAgent::spawn(|_| MockReply::Hangup).await.unwrap();
        let manager = manager();
        announce(&manager, agent.addr());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;

        let outcomes = manager
            .dispatch(ip_of(agent.addr()), &commands(&["iptables -A INPUT -j DROP"]))
            .await
            .unwrap();
        assert!(matches!(outcomes[0], DeliveryOutcome::DeliveryUnknown { .. }));
        wait_for_state(&manager, agent.addr(), SessionState::Lost).await;

        let err = manager
            .dispatch(ip_of(agent.addr()), &commands(&["iptables -A INPUT -j DROP"]))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected(ip_of(agent.addr())));
    }

    #[tokio::test]
    async fn test_reannounce_after_loss_reconnects() {
        let agent = MockAgent::spawn(|cmd| {
            if cmd.contains("OUTPUT") {
                MockReply::Hangup
            } else {
                MockReply::Result(CommandResult::ok(0, "applied"))
            }
        })
        .await
        .unwrap();
        let manager = manager();
        announce(&manager, agent.addr());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;
        let ip = ip_of(agent.addr());

        manager.dispatch(ip, &commands(&["iptables -A OUTPUT -j DROP"])).await.unwrap();
        wait_for_state(&manager, agent.addr(), SessionState::Lost).await;

        // the dead link task is replaced once the device announces again
        manager.sessions().record_announce(agent.addr(), "a1b2c3", "mock", OffsetDateTime::now_utc());
        let started = timeout(Duration::from_secs(2), async {
            while !manager.ensure_link(agent.addr()) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(started.is_ok());
        wait_for_state(&manager, agent.addr(), SessionState::Connected).await;
        let outcomes = manager.dispatch(ip, &commands(&["iptables -A INPUT -j DROP"])).await.unwrap();
        assert!(matches!(outcomes[0], DeliveryOutcome::Applied { .. }));
        assert_eq!(agent.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_device_gives_up() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let manager = manager();
        announce(&manager, addr);
        wait_for_state(&manager, addr, SessionState::Lost).await;
        let session = manager.sessions().get(addr).unwrap();
        assert_eq!(session.last_error.as_deref(), Some("connect attempts exhausted"));
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_device() {
        let manager = manager();
        let err = manager
            .dispatch("10.9.9.9".parse().unwrap(), &commands(&["iptables -A INPUT -j DROP"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_connected");
    }

    #[test]
    fn test_outcome_from_result() {
        assert_eq!(
            DeliveryOutcome::from(CommandResult::ok(0, "already present")),
            DeliveryOutcome::Applied { exit_code: Some(0), detail: "already present".into() }
        );
        assert_eq!(
            DeliveryOutcome::from(CommandResult::error(FailureReason::Timeout, None, "timed out")),
            DeliveryOutcome::Failed { reason: FailureReason::Timeout, exit_code: None, detail: "timed out".into() }
        );
        let json = serde_json::to_value(DeliveryOutcome::DeliveryUnknown { reason: "reset".into() }).unwrap();
        assert_eq!(json["outcome"], "delivery_unknown");
    }
}
