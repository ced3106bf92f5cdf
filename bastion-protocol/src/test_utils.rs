/*!
Mock agent for exercising the kernel without a real device

Listens on a loopback TCP port, records every command frame it receives and
answers according to a scripted responder. Lets channel tests assert on
ordering, result correlation and connection loss.
*/

use crate::frame::{read_frame, write_frame};
use crate::wire::{CommandResult, FailureReason};
use anyhow::Result;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// What the mock does with one received command
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Send this result frame back
    Result(CommandResult),
    /// Keep the connection open and never answer
    Silent,
    /// Close the connection without answering
    Hangup,
}

type Responder = Arc<dyn Fn(&str) -> MockReply + Send + Sync>;

pub struct MockAgent {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<usize>>,
    handle: JoinHandle<()>,
}

impl MockAgent {
    /// Start a mock that answers every command with `responder`
    pub async fn spawn<F>(responder: F) -> Result<Self>
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let responder: Responder = Arc::new(responder);

        let handle = {
            let received = received.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    *connections.lock() += 1;
                    tokio::spawn(serve(stream, responder.clone(), received.clone()));
                }
            })
        };

        tracing::debug!("[mock-agent] listening on {}", addr);
        Ok(Self { addr, received, connections, handle })
    }

    /// Mock that reports every command as applied
    pub async fn accepting() -> Result<Self> {
        Self::spawn(|_| MockReply::Result(CommandResult::ok(0, "applied"))).await
    }

    /// Mock that rejects commands containing `needle` and applies the rest
    pub async fn rejecting(needle: &'static str) -> Result<Self> {
        Self::spawn(move |cmd| {
            if cmd.contains(needle) {
                MockReply::Result(CommandResult::error(FailureReason::InvalidCommand, None, "rejected by mock"))
            } else {
                MockReply::Result(CommandResult::ok(0, "applied"))
            }
        })
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Commands received so far, in arrival order
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        *self.connections.lock()
    }

    /// Wait until at least `count` commands arrived
    pub async fn wait_for_commands(&self, count: usize, limit: Duration) -> Result<Vec<String>> {
        timeout(limit, async {
            loop {
                let seen = self.received();
                if seen.len() >= count {
                    return seen;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {} commands", count))
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, responder: Responder, received: Arc<Mutex<Vec<String>>>) {
    loop {
        let command = match read_frame(&mut stream).await {
            Ok(Some(command)) => command,
            Ok(None) | Err(_) => return,
        };
        received.lock().push(command.clone());

        match responder(&command) {
            MockReply::Result(result) => {
                let Ok(text) = result.encode() else { return };
                if write_frame(&mut stream, &text).await.is_err() {
                    return;
                }
            }
            MockReply::Silent => {}
            MockReply::Hangup => return,
        }
    }
}
