//! Command listener
//!
//! Accepts kernel connections on the command port. Each frame carries one
//! command; it is validated, executed, and answered with exactly one result
//! frame before the next frame is read. A bad command, including one that is
//! not UTF-8, is answered as invalid and the connection stays open; only a
//! broken frame closes it. Execution is serialized across connections so
//! rules land in the order they arrived.

use crate::execution::FirewallExecutor;
use crate::validator::validate;
use anyhow::{Context, Result};
use bastion_protocol::{read_frame, write_frame, CommandResult, FailureReason, FrameError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind command listener on {}", addr))
}

/// Validate then execute one command; never fails, the outcome is in the result
pub async fn handle_command(text: &str, executor: &FirewallExecutor) -> CommandResult {
    match validate(text) {
        Ok(command) => executor.apply(&command).await,
        Err(e) => {
            warn!("Refused command {:?}: {}", text, e);
            CommandResult::error(FailureReason::InvalidCommand, None, e.to_string())
        }
    }
}

pub async fn run_listener(listener: TcpListener, executor: FirewallExecutor, cancel: CancellationToken) -> Result<()> {
    info!("Command listener on {}", listener.local_addr()?);
    let executor = Arc::new(Mutex::new(executor));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                info!("Kernel connected from {}", peer);
                let executor = executor.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, peer, executor, cancel).await {
                        error!("Connection from {} failed: {:#}", peer, e);
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    executor: Arc<Mutex<FirewallExecutor>>,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => frame,
        };
        let result = match frame {
            Ok(Some(text)) => {
                debug!("Command from {}: {}", peer, text);
                let executor = executor.lock().await;
                handle_command(&text, &executor).await
            }
            Ok(None) => {
                info!("Kernel at {} disconnected", peer);
                return Ok(());
            }
            // the whole payload was consumed, the stream is still in step
            Err(FrameError::InvalidUtf8) => {
                warn!("Refused command from {}: not valid UTF-8", peer);
                CommandResult::error(FailureReason::InvalidCommand, None, "command is not valid UTF-8")
            }
            Err(e) => return Err(e).context("Reading command frame"),
        };
        let payload = result.encode().context("Encoding result")?;
        write_frame(&mut stream, &payload).await.context("Writing result frame")?;
    }
}
