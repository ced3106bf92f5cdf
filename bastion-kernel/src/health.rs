use crate::channel::{DispatchStats, SharedChannelManager};
use crate::directory::Directory;
use crate::sessions::SessionCounts;
use crate::state::Shared;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub sessions: SessionCounts,
    pub aliases: usize,
    pub services: usize,
    pub dispatch: DispatchStats,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, directory: &Shared<Directory>, channels: &SharedChannelManager) -> KernelHealth {
        let (aliases, services) = {
            let directory = directory.read();
            (directory.alias_count(), directory.services().len())
        };
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            sessions: channels.session_counts(),
            aliases,
            services,
            dispatch: channels.stats(),
        }
    }

    /// Log a health line periodically until cancelled
    pub fn spawn_health_reporter(
        &self,
        directory: Shared<Directory>,
        channels: SharedChannelManager,
        every: Duration,
        cancel: CancellationToken,
    ) {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let health = tracker.get_health(&directory, &channels);
                        info!(
                            "[health] up {}s, sessions {}/{} connected, {} lost, dispatched {} ({} unknown)",
                            health.uptime_seconds,
                            health.sessions.connected,
                            health.sessions.discovered + health.sessions.connecting + health.sessions.connected,
                            health.sessions.lost,
                            health.dispatch.dispatched,
                            health.dispatch.unknown,
                        );
                    }
                }
            }
        });
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(Ok(kb)) = rest.split_whitespace().next().map(str::parse::<u64>) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}
